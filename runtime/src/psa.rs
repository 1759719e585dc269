/*++

Licensed under the Apache-2.0 license.

File Name:

    psa.rs

Abstract:

    File contains the PSA style key provider through which the TLS stack
    uses keys that never leave the secure element.

--*/

use sdcle_drivers::printer::Oid;
use sdcle_drivers::{cprintln, oid, SeInstanceManager};
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::{
    spki_from_point, EcdsaP256Signature, P256_POINT_LEN, P256_RAW_SIGNATURE_LEN, P256_SPKI_LEN,
};
use std::collections::BTreeMap;

pub const PSA_KEY_SLOTS: usize = 4;
/// Slot of the key handle the TLS stack opens once and keeps.
pub const TLS_KEY_SLOT: usize = 0;
pub const PSA_HASH_LEN: usize = 32;

bitflags::bitflags! {
    /// PSA key usage flags.
    pub struct KeyUsage: u32 {
        const EXPORT = 0x0000_0001;
        const COPY = 0x0000_0002;
        const ENCRYPT = 0x0000_0100;
        const DECRYPT = 0x0000_0200;
        const SIGN_MESSAGE = 0x0000_0400;
        const VERIFY_MESSAGE = 0x0000_0800;
        const SIGN_HASH = 0x0000_1000;
        const VERIFY_HASH = 0x0000_2000;
        const DERIVE = 0x0000_4000;
    }
}

impl KeyUsage {
    /// Usages a secure element key can serve.
    pub fn supported() -> Self {
        Self::SIGN_HASH
            | Self::SIGN_MESSAGE
            | Self::DERIVE
            | Self::VERIFY_HASH
            | Self::VERIFY_MESSAGE
            | Self::EXPORT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccFamily {
    SecpR1,
    SecpK1,
    Montgomery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAttributes {
    pub family: EccFamily,
    pub bits: u16,
    pub usage: KeyUsage,
}

impl KeyAttributes {
    /// P-256 signing key as opened by the TLS stack.
    pub fn p256_signing() -> Self {
        Self {
            family: EccFamily::SecpR1,
            bits: 256,
            usage: KeyUsage::SIGN_HASH | KeyUsage::VERIFY_HASH,
        }
    }

    fn is_supported(&self) -> bool {
        self.family == EccFamily::SecpR1
            && self.bits == 256
            && self
                .usage
                .intersects(KeyUsage::SIGN_HASH | KeyUsage::SIGN_MESSAGE | KeyUsage::DERIVE)
            && KeyUsage::supported().contains(self.usage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeySlot {
    key_oid: u16,
    attributes: KeyAttributes,
}

pub struct PsaDriver {
    slots: [Option<KeySlot>; PSA_KEY_SLOTS],
    default_oid: u16,
    /// SubjectPublicKeyInfo of keys whose public half is known.
    public_keys: BTreeMap<u16, [u8; P256_SPKI_LEN]>,
}

impl PsaDriver {
    /// Create the driver with the TLS handle already open in slot 0.
    pub fn new(default_oid: u16) -> Self {
        let mut slots = [None; PSA_KEY_SLOTS];
        slots[TLS_KEY_SLOT] = Some(KeySlot {
            key_oid: default_oid,
            attributes: KeyAttributes::p256_signing(),
        });
        Self {
            slots,
            default_oid,
            public_keys: BTreeMap::new(),
        }
    }

    /// Find the first free slot for a key with `attributes`.
    pub fn allocate(&mut self, attributes: KeyAttributes) -> SdcleResult<usize> {
        if !attributes.is_supported() {
            return Err(SdcleError::PSA_NOT_SUPPORTED);
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SdcleError::PSA_NO_FREE_SLOT)?;
        self.slots[slot] = Some(KeySlot {
            key_oid: self.default_oid,
            attributes,
        });
        Ok(slot)
    }

    /// Attach an allocated slot to the on-chip key in `key_oid`. No key is
    /// generated.
    pub fn generate(&mut self, slot: usize, key_oid: u16) -> SdcleResult<()> {
        let entry = self.slot_mut(slot)?;
        entry.key_oid = key_oid;
        Ok(())
    }

    /// Release `slot`. The TLS slot is never released.
    pub fn destroy(&mut self, slot: usize) -> SdcleResult<()> {
        if slot == TLS_KEY_SLOT {
            return Err(SdcleError::PSA_SLOT_PINNED);
        }
        self.slot_mut(slot)?;
        self.slots[slot] = None;
        Ok(())
    }

    /// Point the TLS handle at another key without reopening it.
    pub fn set_signing_key_oid(&mut self, key_oid: u16) {
        if self.default_oid != key_oid {
            cprintln!("[psa] Signing key remapped to {}", Oid(key_oid));
        }
        self.default_oid = key_oid;
        if let Some(entry) = self.slots[TLS_KEY_SLOT].as_mut() {
            entry.key_oid = key_oid;
        }
    }

    pub fn signing_key_oid(&self) -> u16 {
        self.default_oid
    }

    pub fn slot_key_oid(&self, slot: usize) -> SdcleResult<u16> {
        Ok(self.slot(slot)?.key_oid)
    }

    /// Remember the public half of `key_oid`.
    pub fn cache_public_key(&mut self, key_oid: u16, point: &[u8; P256_POINT_LEN]) {
        self.public_keys.insert(key_oid, spki_from_point(point));
    }

    /// Copy the DER SubjectPublicKeyInfo of the slot's key into `out`.
    pub fn export_public(&self, slot: usize, out: &mut [u8]) -> SdcleResult<usize> {
        let key_oid = self.slot(slot)?.key_oid;
        let spki = self
            .public_keys
            .get(&key_oid)
            .ok_or(SdcleError::PSA_PUBLIC_KEY_UNAVAILABLE)?;
        let out = out
            .get_mut(..spki.len())
            .ok_or(SdcleError::PSA_PUBLIC_KEY_BUFFER_TOO_SMALL)?;
        out.copy_from_slice(spki);
        Ok(spki.len())
    }

    /// Sign a SHA-256 digest with the slot's key. Writes raw `r || s`.
    ///
    /// # Arguments
    ///
    /// * `se` - Secure element, locked for the duration of the signature
    /// * `slot` - Allocated key slot
    /// * `hash` - 32 byte digest
    /// * `signature` - Output buffer of at least 64 bytes
    ///
    /// # Returns
    ///
    /// * The signature length
    pub fn sign_hash(
        &self,
        se: &SeInstanceManager,
        slot: usize,
        hash: &[u8],
        signature: &mut [u8],
    ) -> SdcleResult<usize> {
        let key_oid = self.slot(slot)?.key_oid;
        if hash.len() != PSA_HASH_LEN {
            return Err(SdcleError::PSA_INVALID_HASH_LENGTH);
        }
        let out = signature
            .get_mut(..P256_RAW_SIGNATURE_LEN)
            .ok_or(SdcleError::PSA_SIGNATURE_BUFFER_TOO_SMALL)?;
        let pair = se.acquire()?.create_crypt().ecdsa_sign(key_oid, hash)?;
        out.copy_from_slice(&EcdsaP256Signature::from_integer_pair(&pair)?.to_raw());
        Ok(P256_RAW_SIGNATURE_LEN)
    }

    fn slot(&self, slot: usize) -> SdcleResult<&KeySlot> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(SdcleError::PSA_INVALID_SLOT)
    }

    fn slot_mut(&mut self, slot: usize) -> SdcleResult<&mut KeySlot> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(SdcleError::PSA_INVALID_SLOT)
    }
}

impl Default for PsaDriver {
    fn default() -> Self {
        Self::new(oid::DEVICE_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use sdcle_drivers::SeManagerConfig;
    use sdcle_emu_se::{EmulatedSe, FactoryProfile};

    #[test]
    fn test_allocate_until_full() {
        let mut psa = PsaDriver::default();
        let attrs = KeyAttributes::p256_signing();
        assert_eq!(psa.allocate(attrs), Ok(1));
        assert_eq!(psa.allocate(attrs), Ok(2));
        assert_eq!(psa.allocate(attrs), Ok(3));
        assert_eq!(psa.allocate(attrs), Err(SdcleError::PSA_NO_FREE_SLOT));
        psa.destroy(2).unwrap();
        assert_eq!(psa.allocate(attrs), Ok(2));
    }

    #[test]
    fn test_unsupported_attributes() {
        let mut psa = PsaDriver::default();
        let mut attrs = KeyAttributes::p256_signing();
        attrs.bits = 384;
        assert_eq!(psa.allocate(attrs), Err(SdcleError::PSA_NOT_SUPPORTED));

        let attrs = KeyAttributes {
            family: EccFamily::Montgomery,
            ..KeyAttributes::p256_signing()
        };
        assert_eq!(psa.allocate(attrs), Err(SdcleError::PSA_NOT_SUPPORTED));

        let attrs = KeyAttributes {
            usage: KeyUsage::ENCRYPT | KeyUsage::SIGN_HASH,
            ..KeyAttributes::p256_signing()
        };
        assert_eq!(psa.allocate(attrs), Err(SdcleError::PSA_NOT_SUPPORTED));

        let attrs = KeyAttributes {
            usage: KeyUsage::DERIVE,
            ..KeyAttributes::p256_signing()
        };
        assert_eq!(psa.allocate(attrs), Ok(1));
    }

    #[test]
    fn test_tls_slot_is_pinned_and_remapped() {
        let mut psa = PsaDriver::new(oid::FACTORY_KEY);
        assert_eq!(psa.slot_key_oid(TLS_KEY_SLOT), Ok(oid::FACTORY_KEY));
        psa.set_signing_key_oid(oid::DEVICE_KEY);
        assert_eq!(psa.slot_key_oid(TLS_KEY_SLOT), Ok(oid::DEVICE_KEY));
        assert_eq!(psa.signing_key_oid(), oid::DEVICE_KEY);
        assert_eq!(psa.destroy(TLS_KEY_SLOT), Err(SdcleError::PSA_SLOT_PINNED));
        assert_eq!(psa.destroy(3), Err(SdcleError::PSA_INVALID_SLOT));
    }

    #[test]
    fn test_export_public() {
        let mut psa = PsaDriver::default();
        let mut out = [0u8; 128];
        assert_eq!(
            psa.export_public(0, &mut out),
            Err(SdcleError::PSA_PUBLIC_KEY_UNAVAILABLE)
        );
        let mut point = [0x11u8; P256_POINT_LEN];
        point[0] = 0x04;
        psa.cache_public_key(oid::DEVICE_KEY, &point);
        assert_eq!(psa.export_public(0, &mut out), Ok(P256_SPKI_LEN));
        assert_eq!(&out[P256_SPKI_LEN - P256_POINT_LEN..P256_SPKI_LEN], &point);
        assert_eq!(
            psa.export_public(0, &mut [0u8; 64]),
            Err(SdcleError::PSA_PUBLIC_KEY_BUFFER_TOO_SMALL)
        );
    }

    #[test]
    fn test_sign_hash() {
        let emu = EmulatedSe::new(FactoryProfile::random());
        let se = SeInstanceManager::init(Box::new(emu.clone()), SeManagerConfig::default())
            .unwrap();
        let psa = PsaDriver::new(oid::FACTORY_KEY);
        let digest = [0x42u8; 32];

        let mut sig = [0u8; 64];
        assert_eq!(psa.sign_hash(&se, 0, &digest, &mut sig), Ok(64));
        let public = emu.public_key(oid::FACTORY_KEY).unwrap();
        let key = VerifyingKey::from_sec1_bytes(&public).unwrap();
        let sig = Signature::from_slice(&sig).unwrap();
        assert!(key.verify_prehash(&digest, &sig).is_ok());

        emu.clear_journal();
        assert_eq!(
            psa.sign_hash(&se, 0, &digest[..31], &mut [0u8; 64]),
            Err(SdcleError::PSA_INVALID_HASH_LENGTH)
        );
        assert_eq!(
            psa.sign_hash(&se, 0, &digest, &mut [0u8; 63]),
            Err(SdcleError::PSA_SIGNATURE_BUFFER_TOO_SMALL)
        );
        assert!(emu.journal().is_empty());
    }
}
