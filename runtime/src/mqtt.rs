/*++

Licensed under the Apache-2.0 license.

File Name:

    mqtt.rs

Abstract:

    File contains the contract of the MQTT/TLS client collaborator and the
    topic layout of a device.

--*/

use sdcle_error::SdcleResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// MQTT client owned by the network stack.
///
/// `connect` establishes mutual TLS presenting the certificate stored in
/// `cert_oid`; the private key stays in the secure element and is reached
/// through the PSA driver.
pub trait MqttClient: Send {
    fn is_connected(&self) -> bool;

    fn connect(&mut self, cert_oid: u16) -> SdcleResult<()>;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> SdcleResult<()>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> SdcleResult<()>;

    fn unsubscribe(&mut self, topic: &str) -> SdcleResult<()>;
}

/// Topic suffixes of platform to device commands.
pub mod suffix {
    pub const PROTECTED_UPDATE: &str = "commands/protected_update";
    pub const CERTIFICATE: &str = "commands/certificate";
    pub const CHECK_CERTIFICATE_RESPONSE: &str = "commands/check_certificate_response";
    pub const UPLOAD_CERTIFICATE_RESPONSE: &str = "commands/upload_certificate_response";
    pub const SYNC_CERTIFICATE_RESPONSE: &str = "commands/sync_certificate_response";
}

/// Every topic of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub csr: String,
    pub certificate: String,
    pub protected_update: String,
    pub check_certificate: String,
    pub upload_certificate: String,
    pub sync_certificate: String,
    pub telemetry_system: String,
    /// Wildcard covering every command topic.
    pub commands: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        let base = format!("device/{device_id}");
        Self {
            csr: format!("{base}/commands/csr"),
            certificate: format!("{base}/{}", suffix::CERTIFICATE),
            protected_update: format!("{base}/{}", suffix::PROTECTED_UPDATE),
            check_certificate: format!("{base}/commands/check_certificate"),
            upload_certificate: format!("{base}/commands/upload_certificate"),
            sync_certificate: format!("{base}/commands/sync_certificate"),
            telemetry_system: format!("{base}/telemetry/system"),
            commands: format!("{base}/commands/#"),
        }
    }
}
