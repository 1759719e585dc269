/*++

Licensed under the Apache-2.0 license.

File Name:

    protected_update.rs

Abstract:

    File contains the protected update workflow that rotates the device
    certificate through the secure element's signed and encrypted atomic
    update.

--*/

use crate::ack::{InstallAck, Workflow};
use crate::drivers::Drivers;
use crate::selector::PRIMARY_CERT_OID;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sdcle_drivers::printer::Oid;
use sdcle_drivers::{cprintln, lcso, oid, Metadata, SeGuard};
use sdcle_error::{SdcleError, SdcleResult};
use serde::Deserialize;
use std::thread;

/// Fragments a bundle may carry.
pub const MAX_FRAGMENTS: usize = 3;
/// Manifest format understood by the secure element.
pub const MANIFEST_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    ProcessingJsonBundle,
    WritingTrustAnchor,
    VerifyingManifest,
    ApplyingFragments,
    Success,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::ProcessingJsonBundle => "PROCESSING_JSON_BUNDLE",
            Self::WritingTrustAnchor => "WRITING_TRUST_ANCHOR",
            Self::VerifyingManifest => "VERIFYING_MANIFEST",
            Self::ApplyingFragments => "APPLYING_FRAGMENTS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The certificate was written to the contained object id.
    Installed(u16),
    /// The bundle answered another request and was dropped.
    Discarded,
}

/// Bundle as delivered on `commands/protected_update`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateBundle {
    pub signing_certificate: Option<String>,
    pub manifest: Option<String>,
    pub fragment_0: Option<String>,
    pub fragment_1: Option<String>,
    pub fragment_2: Option<String>,
    pub fragment_count: Option<usize>,
    pub correlation_id: Option<String>,
}

impl UpdateBundle {
    pub fn parse(payload: &[u8]) -> SdcleResult<Self> {
        serde_json::from_slice(payload).map_err(|_| SdcleError::PROTOCOL_INVALID_JSON)
    }

    fn fragment(&self, index: usize) -> Option<&str> {
        match index {
            0 => self.fragment_0.as_deref(),
            1 => self.fragment_1.as_deref(),
            2 => self.fragment_2.as_deref(),
            _ => None,
        }
    }
}

fn decode_field(field: Option<&str>) -> SdcleResult<Vec<u8>> {
    let text = field.ok_or(SdcleError::PU_MISSING_FIELD)?;
    STANDARD
        .decode(text.trim())
        .map_err(|_| SdcleError::PU_BASE64_DECODE)
}

/// Binary contents of an accepted bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBundle {
    pub signing_certificate: Vec<u8>,
    pub manifest: Vec<u8>,
    /// `fragment_0 || fragment_1 || fragment_2`
    pub fragments: Vec<u8>,
    pub fragment_count: usize,
    /// Fragments that carried data.
    pub non_empty_fragments: usize,
}

impl DecodedBundle {
    pub fn decode(bundle: &UpdateBundle) -> SdcleResult<Self> {
        let fragment_count = match bundle.fragment_count {
            Some(count) => count,
            None => (0..MAX_FRAGMENTS)
                .take_while(|i| bundle.fragment(*i).is_some())
                .count(),
        };
        if fragment_count > MAX_FRAGMENTS {
            return Err(SdcleError::PU_TOO_MANY_FRAGMENTS);
        }
        if fragment_count == 0 {
            return Err(SdcleError::PU_MISSING_FIELD);
        }

        let mut decoded = Self {
            signing_certificate: decode_field(bundle.signing_certificate.as_deref())?,
            manifest: decode_field(bundle.manifest.as_deref())?,
            fragment_count,
            ..Default::default()
        };
        for index in 0..fragment_count {
            let fragment = decode_field(bundle.fragment(index))?;
            if !fragment.is_empty() {
                decoded.non_empty_fragments += 1;
            }
            decoded.fragments.extend_from_slice(&fragment);
        }
        if decoded.signing_certificate.is_empty()
            || decoded.manifest.is_empty()
            || decoded.fragments.is_empty()
        {
            return Err(SdcleError::PU_MISSING_FIELD);
        }
        Ok(decoded)
    }
}

pub struct UpdateTransaction {
    pub state: UpdateState,
    /// Id of the response being waited for. Bundles stamped with another
    /// id are stale.
    pub expected_correlation_id: Option<String>,
    /// Id of the bundle being processed.
    pub correlation_id: Option<String>,
    pub target_oid: u16,
    pub trust_anchor_oid: u16,
    pub error: Option<SdcleError>,
}

impl Default for UpdateTransaction {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            expected_correlation_id: None,
            correlation_id: None,
            target_oid: PRIMARY_CERT_OID,
            trust_anchor_oid: oid::TRUST_ANCHOR,
            error: None,
        }
    }
}

impl UpdateTransaction {
    pub fn expect_correlation_id(&mut self, correlation_id: &str) {
        self.expected_correlation_id = Some(correlation_id.into());
    }

    fn accepts(&self, correlation_id: Option<&str>) -> bool {
        match (self.expected_correlation_id.as_deref(), correlation_id) {
            (Some(expected), Some(got)) => expected == got,
            _ => true,
        }
    }

    fn set_state(&mut self, state: UpdateState) {
        cprintln!("[pu] {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
    }
}

pub struct ProtectedUpdateCmd;
impl ProtectedUpdateCmd {
    pub fn execute(drivers: &mut Drivers, payload: &[u8]) -> SdcleResult<UpdateOutcome> {
        drivers.license.check()?;
        if drivers.session.protected_update_active() {
            return Err(SdcleError::PU_WORKFLOW_BUSY);
        }

        let started = drivers.clock.now_millis();
        drivers.pu.error = None;
        drivers.pu.correlation_id = None;
        drivers.pu.set_state(UpdateState::ProcessingJsonBundle);
        let bundle = match UpdateBundle::parse(payload) {
            Ok(bundle) => bundle,
            Err(err) => return Err(Self::fail(drivers, started, err)),
        };
        if !drivers.pu.accepts(bundle.correlation_id.as_deref()) {
            drivers.pu.state = UpdateState::Idle;
            return Ok(UpdateOutcome::Discarded);
        }
        drivers.pu.correlation_id = bundle.correlation_id.clone();

        drivers.session.set_protected_update_active(true);
        let result = Self::run(drivers, &bundle);
        drivers.selector.invalidate(drivers.pu.target_oid);
        let target_oid = match result {
            Ok(target_oid) => target_oid,
            Err(err) => {
                drivers.session.set_protected_update_active(false);
                return Err(Self::fail(drivers, started, err));
            }
        };

        drivers.pu.set_state(UpdateState::Success);
        drivers.session.mark_protected_update_completed();
        drivers.selector.reset_fallback_state();
        if let Err(err) = drivers.selector.refresh(&drivers.se, target_oid) {
            cprintln!("[pu] Cache refresh failed: 0x{:08X}", u32::from(err));
        }

        let now = drivers.clock.now_millis();
        InstallAck::success(
            Workflow::ProtectedUpdate,
            target_oid,
            drivers.pu.correlation_id.as_deref().unwrap_or_default(),
            now,
            u64::try_from(now - started).unwrap_or(0),
        )
        .publish(drivers.mqtt.as_mut(), &drivers.topics.telemetry_system);
        drivers.pu.expected_correlation_id = None;
        cprintln!("[pu] Certificate rotated in {}", Oid(target_oid));
        Ok(UpdateOutcome::Installed(target_oid))
    }

    /// Install the shared secret that protected update manifests are
    /// encrypted under.
    pub fn provision_update_secret(drivers: &mut Drivers, secret: &[u8]) -> SdcleResult<()> {
        drivers.license.check()?;
        if secret.is_empty() {
            return Err(SdcleError::STORE_EMPTY_DATA);
        }

        let mut se = drivers.se.acquire()?;
        Self::write_unless_operational(
            &mut se,
            oid::UPDATE_SHARED_SECRET,
            &Metadata::update_secret(),
        )?;
        se.write_data(oid::UPDATE_SHARED_SECRET, secret)?;
        cprintln!(
            "[pu] Shared secret provisioned in {} ({} B)",
            Oid(oid::UPDATE_SHARED_SECRET),
            secret.len()
        );
        Ok(())
    }

    fn fail(drivers: &mut Drivers, started: i64, err: SdcleError) -> SdcleError {
        cprintln!(
            "[pu] Failed in {}: 0x{:08X}",
            drivers.pu.state.as_str(),
            u32::from(err)
        );
        drivers.pu.set_state(UpdateState::Failed);
        drivers.pu.error = Some(err);

        let now = drivers.clock.now_millis();
        InstallAck::failure(
            Workflow::ProtectedUpdate,
            drivers.pu.target_oid,
            drivers.pu.correlation_id.as_deref().unwrap_or_default(),
            now,
            u64::try_from(now - started).unwrap_or(0),
            err,
        )
        .publish(drivers.mqtt.as_mut(), &drivers.topics.telemetry_system);
        err
    }

    fn run(drivers: &mut Drivers, bundle: &UpdateBundle) -> SdcleResult<u16> {
        let decoded = DecodedBundle::decode(bundle)?;
        if drivers.config.split_fragments && decoded.non_empty_fragments > 1 {
            return Err(SdcleError::PU_SPLIT_FRAGMENTS_UNSUPPORTED);
        }
        cprintln!(
            "[pu] Bundle: cert {} B, manifest {} B, {} fragment(s) {} B",
            decoded.signing_certificate.len(),
            decoded.manifest.len(),
            decoded.fragment_count,
            decoded.fragments.len()
        );

        let ta_oid = drivers.pu.trust_anchor_oid;
        let target_oid = drivers.pu.target_oid;

        // Held until the update is final
        let mut se = drivers.se.acquire()?;

        drivers.pu.set_state(UpdateState::WritingTrustAnchor);
        Self::write_trust_anchor(&mut se, ta_oid, &decoded.signing_certificate)?;
        thread::sleep(drivers.config.nvm_commit_wait());
        Self::verify_trust_anchor(&mut se, ta_oid, &decoded.signing_certificate);

        let binding = Metadata::protected_update_target(ta_oid, oid::UPDATE_SHARED_SECRET);
        Self::write_unless_operational(&mut se, target_oid, &binding)?;

        drivers.pu.set_state(UpdateState::VerifyingManifest);
        se.protected_update_start(MANIFEST_VERSION, &decoded.manifest)?;

        drivers.pu.set_state(UpdateState::ApplyingFragments);
        se.protected_update_final(&decoded.fragments)?;
        Ok(target_oid)
    }

    fn write_trust_anchor(se: &mut SeGuard, ta_oid: u16, certificate: &[u8]) -> SdcleResult<()> {
        // Fails once the slot is operational; the data write decides
        if let Err(err) = se.write_metadata(ta_oid, &Metadata::trust_anchor()) {
            cprintln!(
                "[pu] Trust anchor metadata not written: 0x{:08X}",
                u32::from(err)
            );
        }
        match se.write_data(ta_oid, certificate) {
            Ok(()) => Ok(()),
            Err(SdcleError::SE_OPERATION_TIMEOUT) => {
                cprintln!("[pu] Trust anchor write unconfirmed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Write `metadata` to `oid`. A refusal is tolerated only once the
    /// object is operational.
    fn write_unless_operational(
        se: &mut SeGuard,
        oid: u16,
        metadata: &Metadata,
    ) -> SdcleResult<()> {
        let err = match se.write_metadata(oid, metadata) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match se.lcso(oid) {
            Ok(Some(state)) if state >= lcso::OPERATIONAL => {
                cprintln!(
                    "[pu] Metadata of operational {} kept: 0x{:08X}",
                    Oid(oid),
                    u32::from(err)
                );
                Ok(())
            }
            _ => Err(err),
        }
    }

    fn verify_trust_anchor(se: &mut SeGuard, ta_oid: u16, certificate: &[u8]) {
        match se.read_data(ta_oid) {
            Ok(readback) if readback == certificate => {}
            Ok(_) => cprintln!("[pu] Trust anchor readback differs"),
            Err(err) => cprintln!("[pu] Trust anchor readback failed: 0x{:08X}", u32::from(err)),
        }
        match se.read_metadata(ta_oid) {
            Ok(metadata) if metadata.data_type.is_some() => {}
            Ok(_) => cprintln!("[pu] Trust anchor has no object type"),
            Err(err) => cprintln!(
                "[pu] Trust anchor metadata unreadable: 0x{:08X}",
                u32::from(err)
            ),
        }
    }
}
