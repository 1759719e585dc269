/*++

Licensed under the Apache-2.0 license.

File Name:

    config.rs

Abstract:

    File contains the build-time configuration of the lifecycle engine and
    its JSON override loader.

--*/

use core::time::Duration;
use sdcle_drivers::{BridgeTimeouts, SeManagerConfig};
use sdcle_error::{SdcleError, SdcleResult};
use serde::Deserialize;

pub const DEFAULT_BROKER_HOST: &str = "mqtt.tesaiot.com";
pub const DEFAULT_CSR_ORGANIZATION: &str = "TESAIoT";

/// Value a license field holds until manufacturing fills it in.
pub const LICENSE_PLACEHOLDER: &str = "REPLACE_WITH_LICENSE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SdcleConfig {
    /// Device UUID used in every MQTT topic.
    pub device_id: String,
    pub broker_host: String,
    pub mtls_port: u16,
    pub tls_port: u16,
    pub keepalive_secs: u16,
    pub network_buffer_len: usize,

    pub se_poll_interval_ms: u64,
    pub se_operation_timeout_ms: u64,
    pub metadata_write_timeout_ms: u64,
    pub se_mutex_timeout_ms: u64,
    /// Platform round trip deadline of the CSR workflow.
    pub csr_timeout_ms: u64,
    /// Delay between the trust anchor write and its first use by the SE.
    pub nvm_commit_wait_ms: u64,
    pub queue_depth: usize,

    pub auto_renewal: bool,
    pub csr_organization: String,
    /// Submit protected update fragments as continue + final blocks.
    pub split_fragments: bool,

    /// Factory UID the license was issued for, 54 hex characters.
    pub license_uid: String,
    /// Base64 DER ECDSA-P256 signature over the UID.
    pub license_key: String,
    /// Hex SEC1 encoding of the vendor license key.
    pub vendor_public_key: String,
}

impl Default for SdcleConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            broker_host: DEFAULT_BROKER_HOST.into(),
            mtls_port: 8883,
            tls_port: 8884,
            keepalive_secs: 180,
            network_buffer_len: 4096,
            se_poll_interval_ms: 100,
            se_operation_timeout_ms: 5_000,
            metadata_write_timeout_ms: 10_000,
            se_mutex_timeout_ms: 10_000,
            csr_timeout_ms: 300_000,
            nvm_commit_wait_ms: 500,
            queue_depth: 20,
            auto_renewal: true,
            csr_organization: DEFAULT_CSR_ORGANIZATION.into(),
            split_fragments: false,
            license_uid: LICENSE_PLACEHOLDER.into(),
            license_key: LICENSE_PLACEHOLDER.into(),
            vendor_public_key: String::new(),
        }
    }
}

impl SdcleConfig {
    /// Load a configuration from JSON. Absent fields keep their defaults.
    pub fn from_json(json: &str) -> SdcleResult<Self> {
        serde_json::from_str(json).map_err(|_| SdcleError::PROTOCOL_INVALID_JSON)
    }

    pub fn se_manager_config(&self) -> SeManagerConfig {
        SeManagerConfig {
            mutex_timeout: Duration::from_millis(self.se_mutex_timeout_ms),
            timeouts: BridgeTimeouts {
                poll_interval: Duration::from_millis(self.se_poll_interval_ms),
                operation: Duration::from_millis(self.se_operation_timeout_ms),
                metadata_write: Duration::from_millis(self.metadata_write_timeout_ms),
            },
        }
    }

    pub fn csr_timeout(&self) -> Duration {
        Duration::from_millis(self.csr_timeout_ms)
    }

    pub fn nvm_commit_wait(&self) -> Duration {
        Duration::from_millis(self.nvm_commit_wait_ms)
    }

    /// Subject of the enrollment CSR for a device UID.
    pub fn csr_subject(&self, device_uid: &str) -> String {
        format!("CN={},O={}", device_uid, self.csr_organization)
    }
}
