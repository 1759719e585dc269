/*++

Licensed under the Apache-2.0 license.

File Name:

    csr_workflow.rs

Abstract:

    File contains the certificate enrollment workflow: on-chip key
    generation, PKCS#10 request signed by the secure element, MQTT round
    trip to the platform and installation of the issued certificate.

--*/

use crate::ack::{oid_string, InstallAck, Workflow};
use crate::drivers::Drivers;
use crate::mqtt::QoS;
use crate::psa::KeyAttributes;
use crate::router::SubscriberCommand;
use crate::selector::PRIMARY_CERT_OID;
use sdcle_drivers::printer::Oid;
use sdcle_drivers::{cprintln, lcso, oid, Metadata, SeKeyUsage};
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::{
    pem, point_from_bit_string, point_from_spki, CertificateInfo, CsrBuilder, CsrScratch,
    EcdsaP256Signature, P256_POINT_LEN, P256_RAW_SIGNATURE_LEN, P256_SPKI_LEN,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;
use uuid::Uuid;

/// Key slot the enrollment key pair is generated in.
pub const CSR_KEY_OID: u16 = oid::DEVICE_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrState {
    Idle,
    GenerateKeypair,
    GenerateCsr,
    ConnectMqtt,
    PublishCsr,
    WaitCertificate,
    ValidateCert,
    WriteToSe,
    Done,
    Error,
}

impl CsrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::GenerateKeypair => "GENERATE_KEYPAIR",
            Self::GenerateCsr => "GENERATE_CSR",
            Self::ConnectMqtt => "CONNECT_MQTT",
            Self::PublishCsr => "PUBLISH_CSR",
            Self::WaitCertificate => "WAIT_CERTIFICATE",
            Self::ValidateCert => "VALIDATE_CERT",
            Self::WriteToSe => "WRITE_TO_SE",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

/// State of the enrollment in flight, if any.
pub struct CsrTransaction {
    pub state: CsrState,
    /// Correlation id of the last published request.
    pub correlation_id: Option<String>,
    pub target_oid: u16,
    pub trust_anchor_oid: u16,
    pub payload_version: u64,
    pub csr_der: Vec<u8>,
    /// Failure that moved the workflow to `Error`.
    pub error: Option<SdcleError>,
    key_slot: Option<usize>,
    scratch: Box<CsrScratch>,
}

impl CsrTransaction {
    /// `version_seed` starts the payload version counter, usually the boot
    /// time in seconds.
    pub fn new(version_seed: u64) -> Self {
        Self {
            state: CsrState::Idle,
            correlation_id: None,
            target_oid: PRIMARY_CERT_OID,
            trust_anchor_oid: oid::TRUST_ANCHOR,
            payload_version: version_seed,
            csr_der: Vec::new(),
            error: None,
            key_slot: None,
            scratch: Box::default(),
        }
    }

    fn next_payload_version(&mut self) -> u64 {
        self.payload_version = self.payload_version.saturating_add(1);
        self.payload_version
    }

    fn set_state(&mut self, state: CsrState) {
        cprintln!("[csr] {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
    }
}

#[derive(Serialize)]
struct CsrEnvelope<'a> {
    device_id: &'a str,
    correlation_id: &'a str,
    target_oid: String,
    trust_anchor_oid: String,
    payload_version: u64,
    csr_pem: &'a str,
}

#[derive(Deserialize)]
struct CertificateEnvelope {
    correlation_id: Option<String>,
    certificate: String,
}

/// Certificate delivered on `commands/certificate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMessage {
    pub correlation_id: Option<String>,
    pub der: Vec<u8>,
}

impl CertificateMessage {
    /// Accept a JSON envelope `{correlation_id, certificate}` or a bare PEM
    /// or DER certificate.
    pub fn parse(payload: &[u8]) -> SdcleResult<Self> {
        if payload.is_empty() {
            return Err(SdcleError::CERT_EMPTY_PAYLOAD);
        }
        if payload.first() == Some(&b'{') {
            let envelope: CertificateEnvelope = serde_json::from_slice(payload)
                .map_err(|_| SdcleError::PROTOCOL_INVALID_JSON)?;
            return Ok(Self {
                correlation_id: envelope.correlation_id,
                der: pem::certificate_der(envelope.certificate.as_bytes())?,
            });
        }
        Ok(Self {
            correlation_id: None,
            der: pem::certificate_der(payload)?,
        })
    }

    /// A message stamped with another request's id is a stale retained
    /// response.
    pub fn matches(&self, expected: Option<&str>) -> bool {
        match (self.correlation_id.as_deref(), expected) {
            (Some(got), Some(expected)) => got == expected,
            _ => true,
        }
    }
}

/// Write `der` to `cert_oid` and verify it by reading it back.
///
/// A write whose completion never arrives may still have been applied, so
/// a timeout falls through to the readback.
pub fn install_certificate(drivers: &mut Drivers, cert_oid: u16, der: &[u8]) -> SdcleResult<()> {
    let mut se = drivers.se.acquire()?;
    let written = se.write_data(cert_oid, der);
    drivers.selector.invalidate(cert_oid);
    match written {
        Ok(()) => {}
        Err(SdcleError::SE_OPERATION_TIMEOUT) => {
            cprintln!("[csr] Write to {} unconfirmed, verifying", Oid(cert_oid));
        }
        Err(err) => return Err(err),
    }

    if se.read_data(cert_oid)? != der {
        cprintln!("[csr] Readback of {} differs", Oid(cert_oid));
        return Err(SdcleError::SE_READBACK_MISMATCH);
    }
    drop(se);

    drivers.selector.reset_fallback_state();
    cprintln!("[csr] Certificate installed in {}", Oid(cert_oid));
    Ok(())
}

/// Check a returned certificate before it replaces anything on the chip.
/// Chain verification is left to the next TLS handshake.
pub fn validate_certificate(der: &[u8], device_uid: &str) -> SdcleResult<CertificateInfo> {
    let info = CertificateInfo::parse(der)?;
    if info.subject_cn != device_uid {
        cprintln!("[csr] Unexpected subject CN {}", info.subject_cn.as_str());
        return Err(SdcleError::CSR_CERT_SUBJECT_MISMATCH);
    }
    Ok(info)
}

pub struct CsrWorkflowCmd;
impl CsrWorkflowCmd {
    /// Run one enrollment from key generation to the installation ACK.
    ///
    /// # Returns
    ///
    /// * The certificate object id written
    pub fn execute(drivers: &mut Drivers) -> SdcleResult<u16> {
        drivers.license.check()?;
        if drivers.session.csr_workflow_active() {
            return Err(SdcleError::CSR_UNEXPECTED_STATE);
        }

        drivers.session.set_csr_workflow_active(true);
        drivers.csr.correlation_id = None;
        drivers.csr.error = None;
        let started = drivers.clock.now_millis();
        let result = Self::run(drivers);
        Self::release_key_slot(drivers);
        drivers.session.set_csr_workflow_active(false);

        let target_oid = drivers.csr.target_oid;
        let correlation_id = drivers.csr.correlation_id.clone().unwrap_or_default();
        let now = drivers.clock.now_millis();
        let duration = u64::try_from(now - started).unwrap_or(0);
        let ack = match result {
            Ok(()) => {
                drivers.csr.set_state(CsrState::Done);
                InstallAck::success(Workflow::Csr, target_oid, &correlation_id, now, duration)
            }
            Err(err) => {
                cprintln!(
                    "[csr] Failed in {}: 0x{:08X}",
                    drivers.csr.state.as_str(),
                    u32::from(err)
                );
                drivers.csr.set_state(CsrState::Error);
                drivers.csr.error = Some(err);
                InstallAck::failure(Workflow::Csr, target_oid, &correlation_id, now, duration, err)
            }
        };
        ack.publish(drivers.mqtt.as_mut(), &drivers.topics.telemetry_system);
        result.map(|_| target_oid)
    }

    fn run(drivers: &mut Drivers) -> SdcleResult<()> {
        drivers.csr.set_state(CsrState::GenerateKeypair);
        let point = Self::generate_keypair(drivers)?;

        drivers.csr.set_state(CsrState::GenerateCsr);
        Self::generate_csr(drivers, &point)?;

        drivers.csr.set_state(CsrState::ConnectMqtt);
        if !drivers.mqtt.is_connected() {
            drivers.mqtt.connect(drivers.selector.selected_oid())?;
        }

        drivers.csr.set_state(CsrState::PublishCsr);
        Self::publish_csr(drivers)?;

        drivers.csr.set_state(CsrState::WaitCertificate);
        let message = Self::wait_certificate(drivers)?;

        drivers.csr.set_state(CsrState::ValidateCert);
        let info = validate_certificate(&message.der, &drivers.device_uid)?;
        if info.public_key.is_some_and(|key| key != point) {
            cprintln!("[csr] Certificate is for another key");
        }

        drivers.csr.set_state(CsrState::WriteToSe);
        let target_oid = drivers.csr.target_oid;
        install_certificate(drivers, target_oid, &message.der)
    }

    /// Generate the key pair in the secure element and export its public
    /// half through a transient PSA slot.
    fn generate_keypair(drivers: &mut Drivers) -> SdcleResult<[u8; P256_POINT_LEN]> {
        let bit_string = {
            let mut se = drivers.se.acquire()?;
            let state = se.lcso(CSR_KEY_OID)?.unwrap_or(lcso::CREATION);
            if state < lcso::OPERATIONAL {
                if let Err(err) = se.write_metadata(CSR_KEY_OID, &Metadata::key_slot_reset()) {
                    cprintln!("[csr] Key slot access reset failed: 0x{:08X}", u32::from(err));
                }
            }
            se.create_crypt()
                .generate_keypair(CSR_KEY_OID, SeKeyUsage::SIGN | SeKeyUsage::AUTHENTICATION)?
        };
        drivers
            .psa
            .cache_public_key(CSR_KEY_OID, &point_from_bit_string(&bit_string)?);

        let slot = drivers.psa.allocate(KeyAttributes::p256_signing())?;
        drivers.csr.key_slot = Some(slot);
        drivers.psa.generate(slot, CSR_KEY_OID)?;

        let mut spki = [0u8; P256_SPKI_LEN];
        let len = drivers.psa.export_public(slot, &mut spki)?;
        point_from_spki(&spki[..len])
    }

    fn generate_csr(drivers: &mut Drivers, point: &[u8; P256_POINT_LEN]) -> SdcleResult<()> {
        let slot = drivers
            .csr
            .key_slot
            .ok_or(SdcleError::CSR_UNEXPECTED_STATE)?;
        let subject = drivers.config.csr_subject(&drivers.device_uid);
        let builder = CsrBuilder::new(&subject, point)?;

        let psa = &drivers.psa;
        let se = &drivers.se;
        drivers.csr.scratch.build(&builder, |cri| {
            let digest = Sha256::digest(cri);
            let mut raw = [0u8; P256_RAW_SIGNATURE_LEN];
            psa.sign_hash(se, slot, &digest, &mut raw)?;
            EcdsaP256Signature::from_raw(&raw)
        })?;
        drivers.csr.csr_der = drivers.csr.scratch.der().to_vec();
        cprintln!("[csr] Request built, {} bytes", drivers.csr.csr_der.len());
        Ok(())
    }

    fn publish_csr(drivers: &mut Drivers) -> SdcleResult<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let payload_version = drivers.csr.next_payload_version();
        let envelope = CsrEnvelope {
            device_id: &drivers.device_id,
            correlation_id: &correlation_id,
            target_oid: oid_string(drivers.csr.target_oid),
            trust_anchor_oid: oid_string(drivers.csr.trust_anchor_oid),
            payload_version,
            csr_pem: drivers.csr.scratch.pem(),
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|_| SdcleError::PROTOCOL_INVALID_JSON)?;

        // Recorded first so a reply racing the publish still matches
        drivers.csr.correlation_id = Some(correlation_id);
        drivers
            .mqtt
            .publish(&drivers.topics.csr, &payload, QoS::AtMostOnce)?;
        cprintln!("[csr] Request published, version {}", payload_version);
        Ok(())
    }

    fn wait_certificate(drivers: &mut Drivers) -> SdcleResult<CertificateMessage> {
        let deadline = Instant::now() + drivers.config.csr_timeout();
        loop {
            let msg = drivers
                .inbox
                .wait_for(deadline, SubscriberCommand::UpdateDeviceCertificates)
                .ok_or(SdcleError::CSR_CERTIFICATE_TIMEOUT)?;
            let message = match CertificateMessage::parse(&msg.payload) {
                Ok(message) => message,
                Err(err) => {
                    cprintln!("[csr] Unusable certificate message: 0x{:08X}", u32::from(err));
                    continue;
                }
            };
            if message.matches(drivers.csr.correlation_id.as_deref()) {
                return Ok(message);
            }
        }
    }

    fn release_key_slot(drivers: &mut Drivers) {
        if let Some(slot) = drivers.csr.key_slot.take() {
            if let Err(err) = drivers.psa.destroy(slot) {
                cprintln!("[psa] Release of slot {} failed: 0x{:08X}", slot, u32::from(err));
            }
        }
    }
}
