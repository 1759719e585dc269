// Licensed under the Apache-2.0 license

use crate::common::{
    enrolled_device, factory_device, run_device_test, DeviceOptions, DEVICE_ID, DEVICE_UID_HEX,
};
use sdcle_drivers::oid;
use sdcle_error::SdcleError;
use sdcle_runtime::{LicenseStatus, SessionCmd};

#[test]
fn test_boot_with_valid_device_certificate() {
    let mut device = enrolled_device();
    let drivers = &mut device.drivers;
    assert_eq!(drivers.device_uid, DEVICE_UID_HEX);
    assert_eq!(drivers.device_id, DEVICE_ID);
    assert_eq!(drivers.license.status(), LicenseStatus::Ok);

    assert_eq!(SessionCmd::start(drivers), Ok(oid::DEVICE_CERT));
    assert!(!drivers.selector.is_using_fallback());
    assert!(!drivers.selector.pending_renewal());
    assert_eq!(drivers.psa.signing_key_oid(), oid::DEVICE_KEY);

    let mqtt = device.mqtt();
    assert_eq!(mqtt.connects, [oid::DEVICE_CERT]);
    assert_eq!(mqtt.subscribed, [format!("device/{DEVICE_ID}/commands/#")]);
    // No enrollment on a healthy boot
    assert!(mqtt.published.is_empty());
}

#[test]
fn test_boot_with_factory_certificate_only() {
    let mut device = factory_device();
    let drivers = &mut device.drivers;

    let selected = drivers
        .selector
        .select_mqtt_certificate(&drivers.se, drivers.clock.as_ref(), &mut drivers.psa)
        .unwrap();
    assert_eq!(selected, oid::FACTORY_CERT);
    assert!(drivers.selector.is_using_fallback());
    assert!(drivers.selector.pending_renewal());
    assert_eq!(drivers.psa.signing_key_oid(), oid::FACTORY_KEY);
}

#[test]
fn test_first_connect_on_factory_certificate_starts_enrollment() {
    let mut device = factory_device();
    let csr_topic = device.drivers.topics.csr.clone();

    // Nobody answers, so the enrollment times out
    assert_eq!(SessionCmd::start(&mut device.drivers), Ok(oid::FACTORY_CERT));
    assert_eq!(device.published_on(&csr_topic).len(), 1);
    assert!(!device.drivers.selector.pending_renewal());

    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["status"], "failed");
    assert_eq!(acks[0]["workflow"], "csr_workflow");
}

#[test]
fn test_boot_without_license() {
    let mut device = run_device_test(DeviceOptions {
        device_cert: true,
        ..Default::default()
    });
    assert_eq!(
        device.drivers.license.status(),
        LicenseStatus::InvalidConfig
    );
    assert_eq!(
        SessionCmd::start(&mut device.drivers),
        Err(SdcleError::NOT_LICENSED)
    );
    assert!(device.mqtt().connects.is_empty());
}

#[test]
fn test_boot_before_time_sync_keeps_primary() {
    let mut device = enrolled_device();
    device.clock.set(0);
    assert_eq!(SessionCmd::start(&mut device.drivers), Ok(oid::DEVICE_CERT));
    assert!(!device.drivers.selector.is_using_fallback());
}
