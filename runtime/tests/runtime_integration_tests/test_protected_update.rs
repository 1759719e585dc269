// Licensed under the Apache-2.0 license

use crate::common::{
    certificate_pem, enrolled_device, TestDevice, DEVICE_UID_HEX, NOT_AFTER, NOT_BEFORE,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sdcle_drivers::{lcso, oid, status, AccessCondition, DataObjectType, Metadata};
use sdcle_emu_se::{BundleParams, PlatformCa};
use sdcle_error::SdcleError;
use sdcle_runtime::{
    process_pending, ProtectedUpdateCmd, UpdateCertificateCmd, UpdateOutcome, UpdateState,
};

const CORRELATION_ID: &str = "cafe-0000-0000-0000-000000000003";

/// A rotated device certificate and the bundle delivering it.
fn rotation_bundle(device: &TestDevice, fragment_count: usize) -> (Vec<u8>, serde_json::Value) {
    rotation_bundle_under(device, fragment_count, &device.shared_secret)
}

fn rotation_bundle_under(
    device: &TestDevice,
    fragment_count: usize,
    shared_secret: &[u8],
) -> (Vec<u8>, serde_json::Value) {
    let point = device.se.public_key(oid::DEVICE_KEY).unwrap();
    let der = device
        .ca
        .issue_certificate(DEVICE_UID_HEX, &point, NOT_BEFORE, NOT_AFTER + 86_400)
        .unwrap();
    let bundle = device
        .ca
        .update_bundle(&BundleParams {
            certificate_der: &der,
            target_oid: oid::DEVICE_CERT,
            shared_secret,
            new_version: 1,
            correlation_id: CORRELATION_ID,
            fragment_count,
        })
        .unwrap();
    (der, bundle)
}

fn payload(bundle: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(bundle).unwrap()
}

#[test]
fn test_protected_update_rotates_certificate() {
    let mut device = enrolled_device();
    let (der, bundle) = rotation_bundle(&device, 1);

    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)),
        Ok(UpdateOutcome::Installed(oid::DEVICE_CERT))
    );
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(der.clone()));
    assert_eq!(
        device.se.object_metadata(oid::TRUST_ANCHOR).unwrap().data_type,
        Some(DataObjectType::TrustAnchor)
    );

    let drivers = &device.drivers;
    assert_eq!(drivers.pu.state, UpdateState::Success);
    assert_eq!(drivers.pu.correlation_id.as_deref(), Some(CORRELATION_ID));
    assert!(!drivers.session.protected_update_active());
    assert!(drivers.session.protected_update_just_completed());
    assert!(!drivers.session.publisher_allowed());

    // The certificate cache serves the rotated certificate
    let record = drivers.selector.record(&drivers.se, oid::DEVICE_CERT).unwrap();
    assert_eq!(record.der, der);

    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["status"], "success");
    assert_eq!(acks[0]["workflow"], "protected_update");
    assert_eq!(acks[0]["oid"], "0xE0E2");
    assert_eq!(acks[0]["correlation_id"], CORRELATION_ID);
}

#[test]
fn test_protected_update_three_fragments() {
    let mut device = enrolled_device();
    let (der, bundle) = rotation_bundle(&device, 3);
    assert!(bundle.get("fragment_2").is_some());

    device
        .drivers
        .router
        .route(&device.drivers.topics.protected_update, &payload(&bundle));
    assert_eq!(process_pending(&mut device.drivers), 1);
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(der));
    assert_eq!(device.drivers.pu.state, UpdateState::Success);
}

#[test]
fn test_protected_update_without_target_binding() {
    let mut device = enrolled_device();
    let (_, bundle) = rotation_bundle(&device, 1);
    // An operational target refuses the binding metadata
    device.se.provision_metadata(
        oid::DEVICE_CERT,
        &Metadata {
            lcso: Some(lcso::OPERATIONAL),
            ..Default::default()
        },
    );
    let before = device.se.object_data(oid::DEVICE_CERT);
    device.se.clear_journal();

    let err = ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)).unwrap_err();
    assert_eq!(err.se_status(), Some(status::ACCESS_DENIED));
    assert_eq!(device.drivers.pu.state, UpdateState::Failed);
    assert_eq!(device.drivers.pu.error, Some(err));
    assert!(!device.drivers.session.protected_update_active());
    assert!(device.drivers.session.publisher_allowed());

    assert_eq!(device.se.writes_to(oid::DEVICE_CERT), 0);
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), before);

    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["status"], "failed");
    assert_eq!(acks[0]["error_code"], "0x8007");
    assert_eq!(acks[0]["correlation_id"], CORRELATION_ID);
}

#[test]
fn test_protected_update_aborts_when_binding_refused() {
    let mut device = enrolled_device();
    let (_, bundle) = rotation_bundle(&device, 1);
    let before = device.se.object_data(oid::DEVICE_CERT);
    device.se.clear_journal();
    // Trust anchor metadata goes through, the target binding does not
    device.se.fail_next("write_metadata", status::SUCCESS);
    device.se.fail_next("write_metadata", status::INVALID_OID);

    let err = ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)).unwrap_err();
    assert_eq!(err.se_status(), Some(status::INVALID_OID));
    assert_eq!(device.drivers.pu.state, UpdateState::Failed);
    assert_eq!(device.drivers.pu.error, Some(err));
    assert!(!device.drivers.session.protected_update_active());

    let journal = device.se.journal();
    let refused = journal
        .iter()
        .position(|e| e.name == "write_metadata" && e.status == status::INVALID_OID)
        .unwrap();
    assert_eq!(journal[refused].target, Some(oid::DEVICE_CERT));
    assert!(journal[refused + 1..]
        .iter()
        .all(|e| e.name == "read_metadata" || e.name == "read_data"));
    assert!(!journal.iter().any(|e| e.name == "protected_update_start"));
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), before);

    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["status"], "failed");
    assert_eq!(acks[0]["error_code"], "0x8001");
}

/// Reopen the shared secret slot so it accepts a new secret.
fn unlock_update_secret(device: &TestDevice) {
    device.se.provision_metadata(
        oid::UPDATE_SHARED_SECRET,
        &Metadata {
            lcso: Some(lcso::CREATION),
            change: Some(AccessCondition::Always),
            ..Default::default()
        },
    );
}

#[test]
fn test_provisioned_secret_drives_rotation() {
    let mut device = enrolled_device();
    unlock_update_secret(&device);
    let secret = [0x6B; 64];
    assert_ne!(device.shared_secret, secret);

    assert_eq!(
        ProtectedUpdateCmd::provision_update_secret(&mut device.drivers, &secret),
        Ok(())
    );
    assert_eq!(
        device.se.object_data(oid::UPDATE_SHARED_SECRET),
        Some(secret.to_vec())
    );
    assert_eq!(
        device.se.object_metadata(oid::UPDATE_SHARED_SECRET).unwrap().data_type,
        Some(DataObjectType::AuthReference)
    );

    let (der, bundle) = rotation_bundle_under(&device, 2, &secret);
    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)),
        Ok(UpdateOutcome::Installed(oid::DEVICE_CERT))
    );
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(der));
}

#[test]
fn test_update_secret_provisioning_refusals() {
    let mut device = enrolled_device();

    assert_eq!(
        ProtectedUpdateCmd::provision_update_secret(&mut device.drivers, &[]),
        Err(SdcleError::STORE_EMPTY_DATA)
    );

    // The factory secret is operational and locked
    device.se.clear_journal();
    let err =
        ProtectedUpdateCmd::provision_update_secret(&mut device.drivers, &[0x11; 32]).unwrap_err();
    assert_eq!(err.se_status(), Some(status::ACCESS_DENIED));
    assert_eq!(
        device.se.object_data(oid::UPDATE_SHARED_SECRET),
        Some(device.shared_secret.clone())
    );
    assert!(device.se.journal().iter().any(|e| e.name == "write_data"));

    // Before the slot is operational a metadata refusal stops the write
    unlock_update_secret(&device);
    device.se.clear_journal();
    device.se.fail_next("write_metadata", status::INVALID_OID);
    let err =
        ProtectedUpdateCmd::provision_update_secret(&mut device.drivers, &[0x11; 32]).unwrap_err();
    assert_eq!(err.se_status(), Some(status::INVALID_OID));
    assert!(!device.se.journal().iter().any(|e| e.name == "write_data"));
    assert_eq!(
        device.se.object_data(oid::UPDATE_SHARED_SECRET),
        Some(device.shared_secret.clone())
    );
}

#[test]
fn test_protected_update_signed_by_unknown_signer() {
    let mut device = enrolled_device();
    let (_, mut bundle) = rotation_bundle(&device, 1);
    let impostor = PlatformCa::new().unwrap();
    bundle["signing_certificate"] =
        STANDARD.encode(impostor.signing_certificate_der().unwrap()).into();
    let before = device.se.object_data(oid::DEVICE_CERT);

    let err = ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)).unwrap_err();
    assert_eq!(err.se_status(), Some(status::TRUST_ANCHOR_FAILURE));
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), before);
    assert_eq!(device.acks()[0]["error_code"], "0x8029");
}

#[test]
fn test_protected_update_discards_other_correlation_id() {
    let mut device = enrolled_device();
    let (_, bundle) = rotation_bundle(&device, 1);
    device.drivers.pu.expect_correlation_id("cafe-0000-0000-0000-000000000009");
    device.se.clear_journal();

    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)),
        Ok(UpdateOutcome::Discarded)
    );
    assert!(device.se.journal().is_empty());
    assert!(device.acks().is_empty());
    assert_eq!(device.drivers.pu.state, UpdateState::Idle);
}

#[test]
fn test_protected_update_rejects_malformed_bundles() {
    let mut device = enrolled_device();
    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, b"{not json"),
        Err(SdcleError::PROTOCOL_INVALID_JSON)
    );

    let (_, mut bundle) = rotation_bundle(&device, 1);
    bundle["fragment_count"] = 4.into();
    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)),
        Err(SdcleError::PU_TOO_MANY_FRAGMENTS)
    );
    assert_eq!(device.acks().len(), 2);
    assert!(device.acks().iter().all(|ack| ack["status"] == "failed"));
}

#[test]
fn test_split_fragment_submission_not_supported() {
    let mut device = enrolled_device();
    device.drivers.config.split_fragments = true;
    let (_, bundle) = rotation_bundle(&device, 3);
    assert_eq!(
        ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)),
        Err(SdcleError::PU_SPLIT_FRAGMENTS_UNSUPPORTED)
    );
}

#[test]
fn test_certificate_push_ignored_after_protected_update() {
    let mut device = enrolled_device();
    let (der, bundle) = rotation_bundle(&device, 1);
    ProtectedUpdateCmd::execute(&mut device.drivers, &payload(&bundle)).unwrap();

    let point = device.se.public_key(oid::DEVICE_KEY).unwrap();
    let stale = device.issue_device_certificate(&point);
    assert_eq!(
        UpdateCertificateCmd::execute(&mut device.drivers, certificate_pem(&stale).as_bytes()),
        Ok(None)
    );
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(der));

    device.drivers.session.on_new_session();
    assert!(device.drivers.session.publisher_allowed());
}
