/*++

Licensed under the Apache-2.0 license.

File Name:

    platform.rs

Abstract:

    File contains the certificate handshakes with the platform used by the
    automatic fallback: check, upload and sync requests and the status
    recorded from their responses.

--*/

use crate::ack::oid_string;
use crate::drivers::Drivers;
use crate::identity;
use crate::mqtt::QoS;
use crate::router::SubscriberCommand;
use core::time::Duration;
use sdcle_drivers::cprintln;
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::{pem, PemLabel};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformRequest {
    Check,
    Upload,
    Sync,
}

impl PlatformRequest {
    pub fn response_command(&self) -> SubscriberCommand {
        match self {
            Self::Check => SubscriberCommand::CheckCertificateResponse,
            Self::Upload => SubscriberCommand::UploadCertificateResponse,
            Self::Sync => SubscriberCommand::SyncCertificateResponse,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check_certificate",
            Self::Upload => "upload_certificate",
            Self::Sync => "sync_certificate",
        }
    }
}

/// What the platform said about this device's certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformCertStatus {
    pub check_received: bool,
    pub has_certificate: bool,
    pub upload_received: bool,
    pub upload_ok: bool,
    pub sync_received: bool,
    pub sync_ok: bool,
}

impl PlatformCertStatus {
    pub fn received(&self, request: PlatformRequest) -> bool {
        match request {
            PlatformRequest::Check => self.check_received,
            PlatformRequest::Upload => self.upload_received,
            PlatformRequest::Sync => self.sync_received,
        }
    }

    fn clear(&mut self, request: PlatformRequest) {
        match request {
            PlatformRequest::Check => {
                self.check_received = false;
                self.has_certificate = false;
            }
            PlatformRequest::Upload => {
                self.upload_received = false;
                self.upload_ok = false;
            }
            PlatformRequest::Sync => {
                self.sync_received = false;
                self.sync_ok = false;
            }
        }
    }

    /// Record a response payload. Empty or malformed payloads count as a
    /// negative answer.
    pub fn record(&mut self, request: PlatformRequest, payload: &[u8]) {
        let response: PlatformResponse = serde_json::from_slice(payload).unwrap_or_default();
        match request {
            PlatformRequest::Check => {
                self.check_received = true;
                self.has_certificate = response.has_certificate.unwrap_or(false);
            }
            PlatformRequest::Upload => {
                self.upload_received = true;
                self.upload_ok = response.is_success();
            }
            PlatformRequest::Sync => {
                self.sync_received = true;
                self.sync_ok = response.is_success();
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PlatformResponse {
    has_certificate: Option<bool>,
    status: Option<String>,
}

impl PlatformResponse {
    fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }
}

#[derive(Serialize)]
struct PlatformRequestBody<'a> {
    device_id: &'a str,
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    oid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_pem: Option<String>,
}

pub struct PlatformRequestCmd;
impl PlatformRequestCmd {
    /// Publish a certificate handshake request and forget any previous
    /// answer to it.
    ///
    /// Upload carries the factory certificate; sync carries the currently
    /// selected certificate.
    pub fn execute(drivers: &mut Drivers, request: PlatformRequest) -> SdcleResult<()> {
        drivers.license.check()?;

        let (cert_oid, certificate_pem) = match request {
            PlatformRequest::Check => (None, None),
            PlatformRequest::Upload => (
                Some(oid_string(sdcle_drivers::oid::FACTORY_CERT)),
                Some(identity::read_factory_certificate_pem(&drivers.se)?),
            ),
            PlatformRequest::Sync => {
                let selected = drivers.selector.selected_oid();
                let record = drivers.selector.record(&drivers.se, selected)?;
                if record.der.is_empty() {
                    return Err(SdcleError::CERT_EMPTY_PAYLOAD);
                }
                (
                    Some(oid_string(selected)),
                    Some(pem::encode_to_string(PemLabel::Certificate, &record.der)),
                )
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        if request == PlatformRequest::Sync {
            // The platform answers a sync with a protected update bundle
            drivers.pu.expect_correlation_id(&correlation_id);
        }
        let body = PlatformRequestBody {
            device_id: &drivers.device_id,
            correlation_id,
            oid: cert_oid,
            certificate_pem,
        };
        let payload = serde_json::to_vec(&body).map_err(|_| SdcleError::PROTOCOL_INVALID_JSON)?;
        let topic = match request {
            PlatformRequest::Check => &drivers.topics.check_certificate,
            PlatformRequest::Upload => &drivers.topics.upload_certificate,
            PlatformRequest::Sync => &drivers.topics.sync_certificate,
        };

        drivers.platform.clear(request);
        drivers.mqtt.publish(topic, &payload, QoS::AtLeastOnce)?;
        cprintln!("[sub] Sent {} request", request.as_str());
        Ok(())
    }

    /// Wait for the answer to `request`, handling every other command that
    /// arrives meanwhile.
    pub fn wait_response(
        drivers: &mut Drivers,
        request: PlatformRequest,
        timeout: Duration,
    ) -> SdcleResult<PlatformCertStatus> {
        let deadline = Instant::now() + timeout;
        while !drivers.platform.received(request) {
            let Some(msg) = drivers.inbox.recv_until(deadline) else {
                cprintln!("[sub] No {} response", request.as_str());
                return Err(SdcleError::PLATFORM_RESPONSE_TIMEOUT);
            };
            crate::dispatch(drivers, msg);
        }
        Ok(drivers.platform.clone())
    }
}
