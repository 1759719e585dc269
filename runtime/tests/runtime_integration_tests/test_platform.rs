// Licensed under the Apache-2.0 license

use crate::common::{enrolled_device, factory_device, TestDevice, DEVICE_ID};
use core::time::Duration;
use sdcle_drivers::oid;
use sdcle_emu_se::BundleParams;
use sdcle_error::SdcleError;
use sdcle_runtime::mqtt::suffix;
use sdcle_runtime::{PlatformRequest, PlatformRequestCmd, QoS, UpdateState};
use sdcle_x509::pem;

fn response_topic(suffix: &str) -> String {
    format!("device/{DEVICE_ID}/{suffix}")
}

/// Answer `request_topic` publishes with `body` on `reply_suffix`.
fn answer(
    device: &TestDevice,
    request_topic: String,
    reply_suffix: &'static str,
    body: &'static str,
) {
    let router = device.drivers.router.clone();
    device.respond_with(Box::new(move |topic, _| {
        if topic == request_topic {
            router.route(&response_topic(reply_suffix), body.as_bytes());
        }
    }));
}

#[test]
fn test_check_certificate() {
    let mut device = factory_device();
    let topic = device.drivers.topics.check_certificate.clone();
    answer(
        &device,
        topic.clone(),
        suffix::CHECK_CERTIFICATE_RESPONSE,
        r#"{"has_certificate":true}"#,
    );

    PlatformRequestCmd::execute(&mut device.drivers, PlatformRequest::Check).unwrap();
    let status = PlatformRequestCmd::wait_response(
        &mut device.drivers,
        PlatformRequest::Check,
        Duration::from_millis(200),
    )
    .unwrap();
    assert!(status.check_received);
    assert!(status.has_certificate);

    let request = &device.published_on(&topic)[..];
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].qos, QoS::AtLeastOnce);
    let body = request[0].json();
    assert_eq!(body["device_id"], DEVICE_ID);
    assert!(body["correlation_id"].as_str().is_some_and(|id| id.len() == 36));
    assert!(body.get("certificate_pem").is_none());
}

#[test]
fn test_upload_factory_certificate() {
    let mut device = factory_device();
    let topic = device.drivers.topics.upload_certificate.clone();
    answer(
        &device,
        topic.clone(),
        suffix::UPLOAD_CERTIFICATE_RESPONSE,
        r#"{"status":"success"}"#,
    );

    PlatformRequestCmd::execute(&mut device.drivers, PlatformRequest::Upload).unwrap();
    let status = PlatformRequestCmd::wait_response(
        &mut device.drivers,
        PlatformRequest::Upload,
        Duration::from_millis(200),
    )
    .unwrap();
    assert!(status.upload_ok);

    let body = device.published_on(&topic)[0].json();
    assert_eq!(body["oid"], "0xE0E0");
    let der = pem::certificate_der(body["certificate_pem"].as_str().unwrap().as_bytes()).unwrap();
    assert_eq!(Some(der), device.se.object_data(oid::FACTORY_CERT));
}

#[test]
fn test_response_timeout() {
    let mut device = factory_device();
    PlatformRequestCmd::execute(&mut device.drivers, PlatformRequest::Check).unwrap();
    assert_eq!(
        PlatformRequestCmd::wait_response(
            &mut device.drivers,
            PlatformRequest::Check,
            Duration::from_millis(50),
        ),
        Err(SdcleError::PLATFORM_RESPONSE_TIMEOUT)
    );
}

#[test]
fn test_sync_installs_bundle_with_matching_correlation_id() {
    let mut device = enrolled_device();
    let point = device.se.public_key(oid::DEVICE_KEY).unwrap();
    let renewed = device.issue_device_certificate(&point);

    let router = device.drivers.router.clone();
    let ca = device.ca.clone();
    let secret = device.shared_secret.clone();
    let sync_topic = device.drivers.topics.sync_certificate.clone();
    let update_topic = device.drivers.topics.protected_update.clone();
    let certificate = renewed.clone();
    device.respond_with(Box::new(move |topic, payload| {
        if topic != sync_topic {
            return;
        }
        let request: serde_json::Value = serde_json::from_slice(payload).unwrap();
        let bundle = ca
            .update_bundle(&BundleParams {
                certificate_der: &certificate,
                target_oid: oid::DEVICE_CERT,
                shared_secret: &secret,
                new_version: 1,
                correlation_id: request["correlation_id"].as_str().unwrap(),
                fragment_count: 1,
            })
            .unwrap();
        router.route(&update_topic, &serde_json::to_vec(&bundle).unwrap());
        router.route(
            &response_topic(suffix::SYNC_CERTIFICATE_RESPONSE),
            br#"{"status":"success"}"#,
        );
    }));

    PlatformRequestCmd::execute(&mut device.drivers, PlatformRequest::Sync).unwrap();
    let status = PlatformRequestCmd::wait_response(
        &mut device.drivers,
        PlatformRequest::Sync,
        Duration::from_millis(500),
    )
    .unwrap();
    assert!(status.sync_ok);
    assert_eq!(device.drivers.pu.state, UpdateState::Success);
    assert_eq!(device.drivers.pu.expected_correlation_id, None);
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(renewed));
}

#[test]
fn test_sync_without_certificate() {
    let mut device = factory_device();
    assert_eq!(
        PlatformRequestCmd::execute(&mut device.drivers, PlatformRequest::Sync),
        Err(SdcleError::CERT_EMPTY_PAYLOAD)
    );
}
