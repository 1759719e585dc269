/*++

Licensed under the Apache-2.0 license.

File Name:

    crypto.rs

Abstract:

    File contains the developer crypto facade: license gated wrappers over
    the secure element for randomness, slot storage, AES-CBC, HMAC, ECDH,
    HKDF, hashing, signing and monotonic counters.

--*/

use crate::clock::Clock;
use crate::health::HealthReport;
use crate::license::LicenseGate;
use sdcle_drivers::{cprintln, oid, AesKeySize, SeInstanceManager};
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::{EcdsaP256Signature, P256_POINT_LEN};
use std::sync::Arc;
use zeroize::Zeroizing;

pub const RANDOM_MIN_LEN: usize = 8;
pub const RANDOM_MAX_LEN: usize = 256;

/// Developer storage slots 0..=13.
pub const SECURE_STORE_SLOTS: u8 = 14;
/// Slot backed by the protected update shared secret.
pub const RESERVED_STORE_SLOT: u8 = 4;

pub const AES_BLOCK_LEN: usize = 16;
pub const HKDF_MAX_LEN: usize = 256;
pub const MONOTONIC_COUNTERS: u8 = 4;

/// Approximate NVM write endurance of a counter object.
pub const COUNTER_NVM_WRITE_BUDGET: u32 = 600_000;

/// Object id and capacity behind a developer storage slot.
pub fn store_slot(slot: u8) -> SdcleResult<(u16, usize)> {
    match slot {
        RESERVED_STORE_SLOT => Err(SdcleError::STORE_RESERVED_SLOT),
        0..=11 => Ok((
            oid::DATA_SLOT_BASE + u16::from(slot),
            oid::DATA_SLOT_CAPACITY,
        )),
        12 | 13 => Ok((
            oid::LARGE_DATA_SLOT_BASE + u16::from(slot - 12),
            oid::LARGE_DATA_SLOT_CAPACITY,
        )),
        _ => Err(SdcleError::STORE_INVALID_SLOT),
    }
}

/// Validate a secret object used for HMAC or HKDF.
fn secret_slot(secret_oid: u16) -> SdcleResult<()> {
    if secret_oid == oid::UPDATE_SHARED_SECRET {
        return Err(SdcleError::STORE_RESERVED_SLOT);
    }
    if (oid::DATA_SLOT_BASE..=oid::DATA_SLOT_LAST).contains(&secret_oid) {
        Ok(())
    } else {
        Err(SdcleError::CRYPTO_INVALID_SECRET_SLOT)
    }
}

fn ecc_key(key_oid: u16) -> SdcleResult<()> {
    if (oid::FACTORY_KEY..=oid::KEY_3).contains(&key_oid) {
        Ok(())
    } else {
        Err(SdcleError::CRYPTO_INVALID_KEY_OID)
    }
}

fn counter_oid(id: u8) -> SdcleResult<u16> {
    if id < MONOTONIC_COUNTERS {
        Ok(oid::COUNTER_BASE + u16::from(id))
    } else {
        Err(SdcleError::CRYPTO_COUNTER_INVALID_ID)
    }
}

fn aes_args(iv: &[u8], data: &[u8]) -> SdcleResult<()> {
    if iv.len() != AES_BLOCK_LEN {
        return Err(SdcleError::CRYPTO_AES_INVALID_IV);
    }
    if data.is_empty() || data.len() % AES_BLOCK_LEN != 0 {
        return Err(SdcleError::CRYPTO_AES_INVALID_DATA_LENGTH);
    }
    Ok(())
}

/// License gated developer crypto API.
///
/// Arguments are validated before the secure element is touched, so a
/// rejected call never issues a command.
#[derive(Clone)]
pub struct CryptoFacade {
    se: Arc<SeInstanceManager>,
    license: Arc<LicenseGate>,
}

impl CryptoFacade {
    pub fn new(se: Arc<SeInstanceManager>, license: Arc<LicenseGate>) -> Self {
        Self { se, license }
    }

    /// Fill `out` from the secure element TRNG. `out` must hold 8 to 256 bytes.
    pub fn random_generate(&self, out: &mut [u8]) -> SdcleResult<()> {
        self.license.check()?;
        if !(RANDOM_MIN_LEN..=RANDOM_MAX_LEN).contains(&out.len()) {
            return Err(SdcleError::CRYPTO_RANDOM_INVALID_LENGTH);
        }
        let len = out.len() as u16;
        let random = Zeroizing::new(self.se.acquire()?.create_crypt().random(len)?);
        out.copy_from_slice(&random);
        Ok(())
    }

    pub fn secure_store_write(&self, slot: u8, data: &[u8]) -> SdcleResult<()> {
        self.license.check()?;
        let (oid, capacity) = store_slot(slot)?;
        if data.is_empty() {
            return Err(SdcleError::STORE_EMPTY_DATA);
        }
        if data.len() > capacity {
            return Err(SdcleError::STORE_DATA_TOO_LARGE);
        }
        self.se.acquire()?.write_data(oid, data)
    }

    pub fn secure_store_read(&self, slot: u8) -> SdcleResult<Vec<u8>> {
        self.license.check()?;
        let (oid, _) = store_slot(slot)?;
        self.se.acquire()?.read_data(oid)
    }

    /// Generate a fresh AES key of `bits` in the session key object.
    pub fn aes_generate_key(&self, bits: u16) -> SdcleResult<()> {
        self.license.check()?;
        let size = AesKeySize::from_bits(bits).ok_or(SdcleError::CRYPTO_AES_INVALID_KEY_SIZE)?;
        self.se
            .acquire()?
            .create_crypt()
            .generate_symmetric_key(size, oid::SESSION_KEY)
    }

    pub fn aes_encrypt(&self, iv: &[u8], plaintext: &[u8]) -> SdcleResult<Vec<u8>> {
        self.license.check()?;
        aes_args(iv, plaintext)?;
        self.se
            .acquire()?
            .create_crypt()
            .aes_cbc_encrypt(oid::SESSION_KEY, iv, plaintext)
    }

    pub fn aes_decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> SdcleResult<Vec<u8>> {
        self.license.check()?;
        aes_args(iv, ciphertext)?;
        self.se
            .acquire()?
            .create_crypt()
            .aes_cbc_decrypt(oid::SESSION_KEY, iv, ciphertext)
    }

    /// HMAC-SHA256 keyed by the secret stored in a `0xF1Dx` data object.
    pub fn hmac_sha256(&self, secret_oid: u16, data: &[u8]) -> SdcleResult<[u8; 32]> {
        self.license.check()?;
        secret_slot(secret_oid)?;
        if data.is_empty() {
            return Err(SdcleError::CRYPTO_EMPTY_DATA);
        }
        self.se
            .acquire()?
            .create_crypt()
            .hmac_sha256(secret_oid, data)
    }

    pub fn ecdh_shared_secret(
        &self,
        key_oid: u16,
        peer_public: &[u8],
    ) -> SdcleResult<Zeroizing<Vec<u8>>> {
        self.license.check()?;
        ecc_key(key_oid)?;
        if peer_public.len() != P256_POINT_LEN || peer_public[0] != 0x04 {
            return Err(SdcleError::CRYPTO_INVALID_PEER_KEY);
        }
        self.se.acquire()?.create_crypt().ecdh(key_oid, peer_public)
    }

    /// RFC 5869 HKDF-SHA256 over the secret in `secret_oid`.
    ///
    /// # Arguments
    ///
    /// * `secret_oid` - Developer data object holding the input key material
    /// * `salt` - Optional salt, empty for none
    /// * `info` - Context information
    /// * `out` - Output keying material, 1 to 256 bytes
    pub fn hkdf_derive(
        &self,
        secret_oid: u16,
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> SdcleResult<()> {
        self.license.check()?;
        secret_slot(secret_oid)?;
        if out.is_empty() || out.len() > HKDF_MAX_LEN {
            return Err(SdcleError::CRYPTO_HKDF_INVALID_LENGTH);
        }
        let okm = self.se.acquire()?.create_crypt().hkdf_sha256(
            secret_oid,
            salt,
            info,
            out.len() as u16,
        )?;
        out.copy_from_slice(&okm);
        Ok(())
    }

    pub fn hash(&self, data: &[u8]) -> SdcleResult<[u8; 32]> {
        self.license.check()?;
        self.se.acquire()?.create_crypt().sha256(data)
    }

    /// Hash `data` and sign the digest with `key_oid`. Writes the DER
    /// `ECDSA-Sig-Value` into `sig` and returns its length.
    pub fn sign_data(&self, key_oid: u16, data: &[u8], sig: &mut [u8]) -> SdcleResult<usize> {
        self.license.check()?;
        ecc_key(key_oid)?;
        if data.is_empty() {
            return Err(SdcleError::CRYPTO_EMPTY_DATA);
        }
        let signature = {
            let mut guard = self.se.acquire()?;
            let mut crypt = guard.create_crypt();
            let digest = crypt.sha256(data)?;
            crypt.ecdsa_sign(key_oid, &digest)?
        };
        let signature = EcdsaP256Signature::from_integer_pair(&signature)?;
        if sig.len() < signature.der_len() {
            return Err(SdcleError::BUFFER_TOO_SMALL);
        }
        signature.to_der(sig)
    }

    pub fn counter_read(&self, id: u8) -> SdcleResult<u32> {
        self.license.check()?;
        let oid = counter_oid(id)?;
        let data = self.se.acquire()?.read_data(oid)?;
        match data.get(..4) {
            Some(count) => Ok(u32::from_be_bytes([count[0], count[1], count[2], count[3]])),
            None => Err(SdcleError::SE_INVALID_RESPONSE),
        }
    }

    /// Advance counter `id` by `step`.
    ///
    /// Every increment is an NVM write; a counter object sustains roughly
    /// [`COUNTER_NVM_WRITE_BUDGET`] of them over the device lifetime.
    pub fn counter_increment(&self, id: u8, step: u8) -> SdcleResult<()> {
        self.license.check()?;
        let oid = counter_oid(id)?;
        if step == 0 {
            return Err(SdcleError::CRYPTO_COUNTER_INVALID_STEP);
        }
        self.se.acquire()?.increment_counter(oid, step).map_err(|err| {
            cprintln!("[crypto] Counter {} increment failed", id);
            err
        })
    }

    /// Device health snapshot. Reads only.
    pub fn health_check(&self, clock: &dyn Clock, mqtt_ok: bool) -> SdcleResult<HealthReport> {
        self.license.check()?;
        Ok(HealthReport::collect(
            &self.se,
            self.license.is_licensed(),
            clock,
            mqtt_ok,
        ))
    }
}
