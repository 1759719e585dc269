// Licensed under the Apache-2.0 license

use crate::common::{
    certificate_envelope, certificate_pem, enrolled_device, factory_device, Responder,
    TestDevice, DEVICE_UID_HEX, NOT_AFTER, NOT_BEFORE,
};
use sdcle_drivers::oid;
use sdcle_error::SdcleError;
use sdcle_runtime::{
    process_pending, CsrState, CsrWorkflowCmd, QoS, SessionCmd, SubscriberMessage,
    SubscriberCommand, UpdateCertificateCmd,
};
use sdcle_x509::CertificateInfo;
use std::sync::{Arc, Mutex};

const STALE_CORRELATION_ID: &str = "cafe-0000-0000-0000-000000000001";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Reply {
    Issue,
    StaleThenIssue,
    StaleOnly,
    WrongSubject,
}

/// Platform side of the enrollment: issue a certificate for every CSR
/// published and record the correlation id it carried.
fn platform_issuer(device: &TestDevice, reply: Reply) -> (Responder, Arc<Mutex<Vec<String>>>) {
    let router = device.drivers.router.clone();
    let ca = device.ca.clone();
    let csr_topic = device.drivers.topics.csr.clone();
    let cert_topic = device.drivers.topics.certificate.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let requests = seen.clone();

    let responder: Responder = Box::new(move |topic, payload| {
        if topic != csr_topic {
            return;
        }
        let request: serde_json::Value = serde_json::from_slice(payload).unwrap();
        let correlation_id = request["correlation_id"].as_str().unwrap().to_string();
        let csr = request["csr_pem"].as_str().unwrap();
        let der = ca
            .issue_from_csr(csr.as_bytes(), NOT_BEFORE, NOT_AFTER)
            .unwrap();
        requests.lock().unwrap().push(correlation_id.clone());

        match reply {
            Reply::Issue => router.route(&cert_topic, &certificate_envelope(&correlation_id, &der)),
            Reply::StaleThenIssue => {
                router.route(&cert_topic, &certificate_envelope(STALE_CORRELATION_ID, &der));
                router.route(&cert_topic, &certificate_envelope(&correlation_id, &der));
            }
            Reply::StaleOnly => {
                router.route(&cert_topic, &certificate_envelope(STALE_CORRELATION_ID, &der))
            }
            Reply::WrongSubject => {
                let info = CertificateInfo::parse(&der).unwrap();
                let other = ca
                    .issue_certificate(
                        "OTHER-DEVICE",
                        &info.public_key.unwrap(),
                        NOT_BEFORE,
                        NOT_AFTER,
                    )
                    .unwrap();
                router.route(&cert_topic, &certificate_envelope(&correlation_id, &other));
            }
        }
    });
    (responder, seen)
}

#[test]
fn test_csr_round_trip() {
    let mut device = factory_device();
    let (responder, requests) = platform_issuer(&device, Reply::Issue);
    device.respond_with(responder);

    assert_eq!(SessionCmd::start(&mut device.drivers), Ok(oid::FACTORY_CERT));

    let correlation_id = requests.lock().unwrap()[0].clone();
    let csr_topic = device.drivers.topics.csr.clone();
    let published = device.published_on(&csr_topic);
    assert_eq!(published[0].qos, QoS::AtMostOnce);
    let body = published[0].json();
    assert_eq!(body["target_oid"], "0xE0E2");
    assert_eq!(body["trust_anchor_oid"], "0xE0E8");
    assert!(body["csr_pem"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

    let installed = device.se.object_data(oid::DEVICE_CERT).unwrap();
    let info = CertificateInfo::parse(&installed).unwrap();
    assert_eq!(info.subject_cn, DEVICE_UID_HEX);
    assert_eq!(info.public_key, device.se.public_key(oid::DEVICE_KEY));

    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["event"], "certificate_installed");
    assert_eq!(acks[0]["status"], "success");
    assert_eq!(acks[0]["oid"], "0xE0E2");
    assert_eq!(acks[0]["correlation_id"], correlation_id.as_str());
    assert_eq!(acks[0]["workflow"], "csr_workflow");

    let drivers = &mut device.drivers;
    assert_eq!(drivers.csr.state, CsrState::Done);
    assert!(!drivers.selector.is_using_fallback());
    assert!(!drivers.session.csr_workflow_active());

    // The next bring-up picks the new certificate
    let selected = drivers
        .selector
        .select_mqtt_certificate(&drivers.se, drivers.clock.as_ref(), &mut drivers.psa)
        .unwrap();
    assert_eq!(selected, oid::DEVICE_CERT);
    assert_eq!(drivers.psa.signing_key_oid(), oid::DEVICE_KEY);
}

#[test]
fn test_csr_skips_stale_certificate() {
    let mut device = factory_device();
    let (responder, requests) = platform_issuer(&device, Reply::StaleThenIssue);
    device.respond_with(responder);
    device.se.clear_journal();

    assert_eq!(CsrWorkflowCmd::execute(&mut device.drivers), Ok(oid::DEVICE_CERT));
    assert_eq!(device.se.writes_to(oid::DEVICE_CERT), 1);

    let correlation_id = requests.lock().unwrap()[0].clone();
    let acks = device.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["correlation_id"], correlation_id.as_str());
}

#[test]
fn test_csr_stale_certificate_only_times_out() {
    let mut device = factory_device();
    let (responder, _) = platform_issuer(&device, Reply::StaleOnly);
    device.respond_with(responder);
    device.se.clear_journal();

    assert_eq!(
        CsrWorkflowCmd::execute(&mut device.drivers),
        Err(SdcleError::CSR_CERTIFICATE_TIMEOUT)
    );
    assert_eq!(device.se.writes_to(oid::DEVICE_CERT), 0);
    assert_eq!(device.drivers.csr.state, CsrState::Error);
    assert_eq!(
        device.drivers.csr.error,
        Some(SdcleError::CSR_CERTIFICATE_TIMEOUT)
    );

    let acks = device.acks();
    assert_eq!(acks[0]["status"], "failed");
    assert_eq!(
        acks[0]["error_code"],
        format!("0x{:04X}", SdcleError::CSR_CERTIFICATE_TIMEOUT.wire_code())
    );
}

#[test]
fn test_csr_rejects_certificate_for_other_subject() {
    let mut device = factory_device();
    let (responder, _) = platform_issuer(&device, Reply::WrongSubject);
    device.respond_with(responder);
    device.se.clear_journal();

    assert_eq!(
        CsrWorkflowCmd::execute(&mut device.drivers),
        Err(SdcleError::CSR_CERT_SUBJECT_MISMATCH)
    );
    assert_eq!(device.se.writes_to(oid::DEVICE_CERT), 0);
    assert_eq!(device.acks()[0]["status"], "failed");
}

#[test]
fn test_csr_write_without_completion_is_verified_by_readback() {
    let mut device = factory_device();
    let (responder, _) = platform_issuer(&device, Reply::Issue);
    device.respond_with(responder);
    device.se.drop_write_callbacks(1);

    assert_eq!(CsrWorkflowCmd::execute(&mut device.drivers), Ok(oid::DEVICE_CERT));
    assert!(device.se.object_data(oid::DEVICE_CERT).is_some_and(|d| !d.is_empty()));
    assert_eq!(device.acks()[0]["status"], "success");
}

#[test]
fn test_csr_defers_other_commands() {
    let mut device = factory_device();
    let (responder, _) = platform_issuer(&device, Reply::Issue);
    device.respond_with(responder);
    let queue = device.drivers.queue.clone();
    queue.post(SubscriberMessage::new(
        SubscriberCommand::CheckCertificateResponse,
        br#"{"has_certificate":true}"#,
    ));

    assert_eq!(CsrWorkflowCmd::execute(&mut device.drivers), Ok(oid::DEVICE_CERT));
    assert!(!device.drivers.platform.check_received);
    assert_eq!(process_pending(&mut device.drivers), 1);
    assert!(device.drivers.platform.check_received);
    assert!(device.drivers.platform.has_certificate);
}

#[test]
fn test_pushed_certificate_is_installed() {
    let mut device = enrolled_device();
    let point = device.se.public_key(oid::DEVICE_KEY).unwrap();
    let renewed = device
        .ca
        .issue_certificate(DEVICE_UID_HEX, &point, NOT_BEFORE, NOT_AFTER + 86_400)
        .unwrap();

    let payload = certificate_pem(&renewed);
    assert_eq!(
        UpdateCertificateCmd::execute(&mut device.drivers, payload.as_bytes()),
        Ok(Some(oid::DEVICE_CERT))
    );
    assert_eq!(device.se.object_data(oid::DEVICE_CERT), Some(renewed));
    assert_eq!(device.acks()[0]["status"], "success");

    // Empty retained messages are no-ops
    assert_eq!(UpdateCertificateCmd::execute(&mut device.drivers, b""), Ok(None));
}
