/*++

Licensed under the Apache-2.0 license.

File Name:

    ack.rs

Abstract:

    File contains the certificate installation acknowledgement published on
    the system telemetry topic.

--*/

use crate::clock::iso8601_millis;
use crate::mqtt::{MqttClient, QoS};
use sdcle_drivers::cprintln;
use sdcle_error::SdcleError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Csr,
    ProtectedUpdate,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csr => "csr_workflow",
            Self::ProtectedUpdate => "protected_update",
        }
    }
}

/// `"0xE0E2"` style rendering of an object id.
pub fn oid_string(oid: u16) -> String {
    format!("0x{oid:04X}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallAck {
    pub event: &'static str,
    pub timestamp: String,
    pub oid: String,
    pub status: &'static str,
    pub correlation_id: String,
    pub workflow: &'static str,
    pub installation_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<&'static str>,
}

impl InstallAck {
    pub fn success(
        workflow: Workflow,
        oid: u16,
        correlation_id: &str,
        now_millis: i64,
        duration_ms: u64,
    ) -> Self {
        Self {
            event: "certificate_installed",
            timestamp: iso8601_millis(now_millis),
            oid: oid_string(oid),
            status: "success",
            correlation_id: correlation_id.into(),
            workflow: workflow.as_str(),
            installation_duration_ms: duration_ms,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure(
        workflow: Workflow,
        oid: u16,
        correlation_id: &str,
        now_millis: i64,
        duration_ms: u64,
        err: SdcleError,
    ) -> Self {
        Self {
            event: "certificate_install_failed",
            status: "failed",
            error_code: Some(format!("0x{:04X}", err.wire_code())),
            error_message: Some(err.message()),
            ..Self::success(workflow, oid, correlation_id, now_millis, duration_ms)
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Publish on `topic`. Delivery failures are logged and otherwise
    /// ignored.
    pub fn publish(&self, mqtt: &mut dyn MqttClient, topic: &str) {
        if let Err(err) = mqtt.publish(topic, &self.to_json(), QoS::AtMostOnce) {
            cprintln!(
                "[mqtt] ACK {} not delivered: 0x{:08X}",
                self.event,
                u32::from(err)
            );
        }
    }
}
