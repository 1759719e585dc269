// Licensed under the Apache-2.0 license

use crate::common::{enrolled_device, factory_device, run_device_test, DeviceOptions};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sdcle_drivers::oid;
use sdcle_error::{ErrorKind, SdcleError};

#[test]
fn test_secure_store_write_beyond_capacity() {
    let device = factory_device();
    device.se.clear_journal();

    let err = device
        .drivers
        .crypto
        .secure_store_write(0, &[0xA5; oid::DATA_SLOT_CAPACITY + 1])
        .unwrap_err();
    assert_eq!(err, SdcleError::STORE_DATA_TOO_LARGE);
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(device.se.journal().is_empty());
}

#[test]
fn test_secure_store_round_trip() {
    let device = factory_device();
    let crypto = &device.drivers.crypto;

    let small = [0x5A; oid::DATA_SLOT_CAPACITY];
    crypto.secure_store_write(0, &small).unwrap();
    assert_eq!(crypto.secure_store_read(0).unwrap(), small);

    let large = vec![0x3C; oid::LARGE_DATA_SLOT_CAPACITY];
    crypto.secure_store_write(13, &large).unwrap();
    assert_eq!(crypto.secure_store_read(13).unwrap(), large);

    // Rewrites erase the previous contents
    crypto.secure_store_write(0, b"short").unwrap();
    assert_eq!(crypto.secure_store_read(0).unwrap(), b"short");
}

#[test]
fn test_secure_store_reserved_slot() {
    let device = factory_device();
    device.se.clear_journal();
    let crypto = &device.drivers.crypto;
    assert_eq!(
        crypto.secure_store_write(4, b"secret"),
        Err(SdcleError::STORE_RESERVED_SLOT)
    );
    assert_eq!(crypto.secure_store_read(4), Err(SdcleError::STORE_RESERVED_SLOT));
    assert_eq!(crypto.secure_store_read(14), Err(SdcleError::STORE_INVALID_SLOT));
    assert!(device.se.journal().is_empty());
}

#[test]
fn test_random_length_boundaries() {
    let device = factory_device();
    let crypto = &device.drivers.crypto;

    assert_eq!(
        crypto.random_generate(&mut [0u8; 7]),
        Err(SdcleError::CRYPTO_RANDOM_INVALID_LENGTH)
    );
    assert_eq!(
        crypto.random_generate(&mut [0u8; 257]),
        Err(SdcleError::CRYPTO_RANDOM_INVALID_LENGTH)
    );
    crypto.random_generate(&mut [0u8; 8]).unwrap();

    let mut a = [0u8; 256];
    let mut b = [0u8; 256];
    crypto.random_generate(&mut a).unwrap();
    crypto.random_generate(&mut b).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_sign_data_verifies_with_factory_key() {
    let device = factory_device();
    let message = b"telemetry frame 42";

    let mut sig = [0u8; 72];
    let len = device
        .drivers
        .crypto
        .sign_data(oid::FACTORY_KEY, message, &mut sig)
        .unwrap();

    let point = device.se.public_key(oid::FACTORY_KEY).unwrap();
    let key = VerifyingKey::from_sec1_bytes(&point).unwrap();
    let sig = Signature::from_der(&sig[..len]).unwrap();
    key.verify(message, &sig).unwrap();

    assert_eq!(
        device.drivers.crypto.sign_data(oid::FACTORY_KEY, message, &mut [0u8; 8]),
        Err(SdcleError::BUFFER_TOO_SMALL)
    );
}

#[test]
fn test_ecdh_matches_peer() {
    let device = factory_device();
    let peer = SecretKey::random(&mut rand::rngs::OsRng);
    let peer_point = peer.public_key().to_encoded_point(false);

    let shared = device
        .drivers
        .crypto
        .ecdh_shared_secret(oid::FACTORY_KEY, peer_point.as_bytes())
        .unwrap();

    let device_key =
        PublicKey::from_sec1_bytes(&device.se.public_key(oid::FACTORY_KEY).unwrap()).unwrap();
    let expected = p256::ecdh::diffie_hellman(peer.to_nonzero_scalar(), device_key.as_affine());
    assert_eq!(&shared[..], expected.raw_secret_bytes().as_slice());

    assert_eq!(
        device
            .drivers
            .crypto
            .ecdh_shared_secret(oid::FACTORY_KEY, &peer_point.as_bytes()[1..]),
        Err(SdcleError::CRYPTO_INVALID_PEER_KEY)
    );
}

#[test]
fn test_hkdf_and_hmac_are_deterministic() {
    let device = factory_device();
    let crypto = &device.drivers.crypto;
    crypto.secure_store_write(1, &[0x0B; 32]).unwrap();
    let secret_oid = oid::DATA_SLOT_BASE + 1;

    let mut first = [0u8; 42];
    let mut second = [0u8; 42];
    let mut other = [0u8; 42];
    crypto.hkdf_derive(secret_oid, b"salt", b"session", &mut first).unwrap();
    crypto.hkdf_derive(secret_oid, b"salt", b"session", &mut second).unwrap();
    crypto.hkdf_derive(secret_oid, b"salt", b"other", &mut other).unwrap();
    assert_eq!(first, second);
    assert_ne!(first, other);

    assert_eq!(
        crypto.hkdf_derive(secret_oid, b"", b"", &mut [0u8; 257]),
        Err(SdcleError::CRYPTO_HKDF_INVALID_LENGTH)
    );
    assert_eq!(
        crypto.hkdf_derive(oid::UPDATE_SHARED_SECRET, b"", b"", &mut first),
        Err(SdcleError::STORE_RESERVED_SLOT)
    );

    let mac = crypto.hmac_sha256(secret_oid, b"payload").unwrap();
    assert_eq!(crypto.hmac_sha256(secret_oid, b"payload").unwrap(), mac);
    assert_ne!(crypto.hmac_sha256(secret_oid, b"payloae").unwrap(), mac);
}

#[test]
fn test_aes_round_trip() {
    let device = factory_device();
    let crypto = &device.drivers.crypto;
    crypto.aes_generate_key(128).unwrap();

    let iv = [0x11; 16];
    let plaintext = [0x42; 48];
    let ciphertext = crypto.aes_encrypt(&iv, &plaintext).unwrap();
    assert_eq!(ciphertext.len(), plaintext.len());
    assert_ne!(ciphertext, plaintext);
    assert_eq!(crypto.aes_decrypt(&iv, &ciphertext).unwrap(), plaintext);

    assert_eq!(
        crypto.aes_encrypt(&iv[..8], &plaintext),
        Err(SdcleError::CRYPTO_AES_INVALID_IV)
    );
    assert_eq!(
        crypto.aes_encrypt(&iv, &plaintext[..20]),
        Err(SdcleError::CRYPTO_AES_INVALID_DATA_LENGTH)
    );
    assert_eq!(
        crypto.aes_generate_key(512),
        Err(SdcleError::CRYPTO_AES_INVALID_KEY_SIZE)
    );
}

#[test]
fn test_monotonic_counters() {
    let device = factory_device();
    let crypto = &device.drivers.crypto;
    assert_eq!(crypto.counter_read(2), Ok(0));
    crypto.counter_increment(2, 3).unwrap();
    crypto.counter_increment(2, 1).unwrap();
    assert_eq!(crypto.counter_read(2), Ok(4));
    assert_eq!(crypto.counter_read(0), Ok(0));

    assert_eq!(
        crypto.counter_read(4),
        Err(SdcleError::CRYPTO_COUNTER_INVALID_ID)
    );
    assert_eq!(
        crypto.counter_increment(2, 0),
        Err(SdcleError::CRYPTO_COUNTER_INVALID_STEP)
    );
}

#[test]
fn test_health_check() {
    let device = enrolled_device();
    let report = device
        .drivers
        .crypto
        .health_check(device.drivers.clock.as_ref(), true)
        .unwrap();
    assert!(report.se_ok);
    assert!(report.device_cert_ok);
    assert!(report.factory_cert_ok);
    assert!(report.license_ok);
    assert!(report.mqtt_ok);
    assert!(report.time_synced);
    assert_eq!(report.cert_days_left, 214);
    assert_eq!(report.lcso_value, 0x07);
}

#[test]
fn test_unlicensed_device_rejects_every_call() {
    let device = run_device_test(DeviceOptions::default());
    device.se.clear_journal();
    let crypto = &device.drivers.crypto;

    assert_eq!(
        crypto.random_generate(&mut [0u8; 32]),
        Err(SdcleError::NOT_LICENSED)
    );
    assert_eq!(
        crypto.secure_store_write(0, b"data"),
        Err(SdcleError::NOT_LICENSED)
    );
    assert_eq!(crypto.counter_read(0), Err(SdcleError::NOT_LICENSED));
    assert_eq!(crypto.hash(b"data"), Err(SdcleError::NOT_LICENSED));
    assert!(device.se.journal().is_empty());
}
