// Licensed under the Apache-2.0 license

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use sdcle_drivers::{oid, SeKeyUsage};
use sdcle_emu_se::{EmulatedSe, PlatformCa};
use sdcle_error::SdcleResult;
use sdcle_runtime::{Drivers, ManualClock, MqttClient, QoS, SdcleConfig};
use sdcle_x509::{pem, point_from_bit_string, PemLabel};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEVICE_UID_HEX: &str = "CD16339301001C000500000A01BB820003009C002C801010712440";
pub const DEVICE_ID: &str = "3f1c9a52-7d4e-4b8a-9c61-0e2f5d7a8b90";

/// 2026-06-01T00:00:00Z
pub const NOW: i64 = 1_780_272_000;
/// 2025-01-01T00:00:00Z
pub const NOT_BEFORE: i64 = 1_735_689_600;
/// 2027-01-01T00:00:00Z
pub const NOT_AFTER: i64 = 1_798_761_600;

pub fn device_uid() -> [u8; oid::FACTORY_UID_LEN] {
    let mut uid = [0u8; oid::FACTORY_UID_LEN];
    hex::decode_to_slice(DEVICE_UID_HEX, &mut uid).unwrap();
    uid
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl Publish {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Debug, Default)]
pub struct MqttLog {
    pub connected: Option<u16>,
    pub connects: Vec<u16>,
    pub published: Vec<Publish>,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
}

pub type Responder = Box<dyn FnMut(&str, &[u8]) + Send>;

/// Broker stand-in. Every publish is logged; an installed responder sees
/// it and may answer through the device's router.
pub struct RecordingMqtt {
    log: Arc<Mutex<MqttLog>>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl MqttClient for RecordingMqtt {
    fn is_connected(&self) -> bool {
        self.log.lock().unwrap().connected.is_some()
    }

    fn connect(&mut self, cert_oid: u16) -> SdcleResult<()> {
        let mut log = self.log.lock().unwrap();
        log.connected = Some(cert_oid);
        log.connects.push(cert_oid);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> SdcleResult<()> {
        self.log.lock().unwrap().published.push(Publish {
            topic: topic.into(),
            payload: payload.to_vec(),
            qos,
        });
        if let Some(responder) = self.responder.lock().unwrap().as_mut() {
            responder(topic, payload);
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> SdcleResult<()> {
        self.log.lock().unwrap().subscribed.push(topic.into());
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> SdcleResult<()> {
        self.log.lock().unwrap().unsubscribed.push(topic.into());
        Ok(())
    }
}

#[derive(Default)]
pub struct DeviceOptions {
    /// Provision a platform issued certificate into the device slot.
    pub device_cert: bool,
    pub licensed: bool,
    pub config: Option<SdcleConfig>,
}

pub struct TestDevice {
    pub drivers: Drivers,
    pub se: EmulatedSe,
    pub ca: Arc<PlatformCa>,
    pub clock: Arc<ManualClock>,
    pub shared_secret: Vec<u8>,
    log: Arc<Mutex<MqttLog>>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl TestDevice {
    pub fn mqtt(&self) -> MutexGuard<'_, MqttLog> {
        self.log.lock().unwrap()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Publish> {
        self.mqtt()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Install-ACKs published on the system telemetry topic.
    pub fn acks(&self) -> Vec<serde_json::Value> {
        let topic = self.drivers.topics.telemetry_system.clone();
        self.published_on(&topic).iter().map(Publish::json).collect()
    }

    pub fn respond_with(&self, responder: Responder) {
        *self.responder.lock().unwrap() = Some(responder);
    }

    /// Certificate for `point` as the platform issues it to this device.
    pub fn issue_device_certificate(&self, point: &[u8]) -> Vec<u8> {
        self.ca
            .issue_certificate(DEVICE_UID_HEX, point, NOT_BEFORE, NOT_AFTER)
            .unwrap()
    }
}

/// Settings for a device on the fast emulated secure element.
pub fn fast_config() -> SdcleConfig {
    SdcleConfig {
        device_id: DEVICE_ID.into(),
        se_poll_interval_ms: 1,
        se_operation_timeout_ms: 500,
        metadata_write_timeout_ms: 500,
        se_mutex_timeout_ms: 1_000,
        csr_timeout_ms: 300,
        nvm_commit_wait_ms: 10,
        ..Default::default()
    }
}

pub fn license_config(mut config: SdcleConfig) -> SdcleConfig {
    let vendor = SigningKey::random(&mut rand::rngs::OsRng);
    let sig: Signature = vendor.sign(&device_uid());
    config.license_uid = DEVICE_UID_HEX.into();
    config.license_key = STANDARD.encode(sig.to_der().as_bytes());
    config.vendor_public_key =
        hex::encode(vendor.verifying_key().to_encoded_point(false).as_bytes());
    config
}

pub fn run_device_test(options: DeviceOptions) -> TestDevice {
    let ca = Arc::new(PlatformCa::new().unwrap());
    let profile = ca
        .factory_profile(device_uid(), NOT_BEFORE, NOT_AFTER)
        .unwrap();
    let shared_secret = profile.shared_secret.clone();
    let se = EmulatedSe::new(profile);

    let clock = Arc::new(ManualClock::at(NOW));
    let log = Arc::new(Mutex::new(MqttLog::default()));
    let responder = Arc::new(Mutex::new(None));
    let mqtt = RecordingMqtt {
        log: log.clone(),
        responder: responder.clone(),
    };

    let mut config = options.config.unwrap_or_else(fast_config);
    if options.licensed {
        config = license_config(config);
    }

    let drivers =
        Drivers::new(Box::new(se.clone()), Box::new(mqtt), clock.clone(), config).unwrap();
    let device = TestDevice {
        drivers,
        se,
        ca,
        clock,
        shared_secret,
        log,
        responder,
    };

    if options.device_cert {
        let bit_string = {
            let mut se = device.drivers.se.acquire().unwrap();
            se.create_crypt()
                .generate_keypair(
                    oid::DEVICE_KEY,
                    SeKeyUsage::SIGN | SeKeyUsage::AUTHENTICATION,
                )
                .unwrap()
        };
        let point = point_from_bit_string(&bit_string).unwrap();
        let der = device.issue_device_certificate(&point);
        device.se.provision_data(oid::DEVICE_CERT, &der);
    }
    device
}

/// Licensed device with only its factory certificate.
pub fn factory_device() -> TestDevice {
    run_device_test(DeviceOptions {
        licensed: true,
        ..Default::default()
    })
}

/// Licensed device with a valid platform certificate in the device slot.
pub fn enrolled_device() -> TestDevice {
    run_device_test(DeviceOptions {
        licensed: true,
        device_cert: true,
        ..Default::default()
    })
}

pub fn certificate_pem(der: &[u8]) -> String {
    pem::encode_to_string(PemLabel::Certificate, der)
}

pub fn certificate_envelope(correlation_id: &str, der: &[u8]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "correlation_id": correlation_id,
        "certificate": certificate_pem(der),
    }))
    .unwrap()
}
