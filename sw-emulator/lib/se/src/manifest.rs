/*++

Licensed under the Apache-2.0 license.

File Name:

    manifest.rs

Abstract:

    Protected update manifest payload and fragment protection.

    The manifest is a COSE_Sign1 (ES256) whose payload is the CBOR array
    [manifest_version, trust_anchor_oid, target_oid, secret_oid,
     payload_len, payload_digest, new_version].
    The fragment is AES-128-CBC (PKCS#7) under a key and IV derived with
    HKDF-SHA256 from the shared secret.

--*/

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use coset::cbor::value::Value;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const FRAGMENT_KEY_INFO: &[u8] = b"protected-update";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub manifest_version: u8,
    pub trust_anchor_oid: u16,
    pub target_oid: u16,
    pub secret_oid: u16,
    pub payload_len: u32,
    pub payload_digest: [u8; 32],
    pub new_version: u16,
}

impl UpdateManifest {
    pub fn for_fragment(
        trust_anchor_oid: u16,
        target_oid: u16,
        secret_oid: u16,
        fragment: &[u8],
        new_version: u16,
    ) -> Self {
        Self {
            manifest_version: 1,
            trust_anchor_oid,
            target_oid,
            secret_oid,
            payload_len: fragment.len() as u32,
            payload_digest: Sha256::digest(fragment).into(),
            new_version,
        }
    }

    pub fn to_cbor(&self) -> Vec<u8> {
        let value = Value::Array(vec![
            Value::from(u64::from(self.manifest_version)),
            Value::Bytes(self.trust_anchor_oid.to_be_bytes().to_vec()),
            Value::Bytes(self.target_oid.to_be_bytes().to_vec()),
            Value::Bytes(self.secret_oid.to_be_bytes().to_vec()),
            Value::from(u64::from(self.payload_len)),
            Value::Bytes(self.payload_digest.to_vec()),
            Value::from(u64::from(self.new_version)),
        ]);
        let mut out = Vec::new();
        // Writing into a Vec cannot fail
        let _ = coset::cbor::ser::into_writer(&value, &mut out);
        out
    }

    pub fn from_cbor(bytes: &[u8]) -> Option<Self> {
        let value: Value = coset::cbor::de::from_reader(bytes).ok()?;
        let items = match value {
            Value::Array(items) if items.len() == 7 => items,
            _ => return None,
        };

        let uint = |v: &Value| -> Option<u64> {
            match v {
                Value::Integer(i) => u64::try_from(*i).ok(),
                _ => None,
            }
        };
        let oid = |v: &Value| -> Option<u16> {
            match v {
                Value::Bytes(b) if b.len() == 2 => Some(u16::from_be_bytes([b[0], b[1]])),
                _ => None,
            }
        };
        let payload_digest = match &items[5] {
            Value::Bytes(b) => <[u8; 32]>::try_from(b.as_slice()).ok()?,
            _ => return None,
        };

        Some(Self {
            manifest_version: u8::try_from(uint(&items[0])?).ok()?,
            trust_anchor_oid: oid(&items[1])?,
            target_oid: oid(&items[2])?,
            secret_oid: oid(&items[3])?,
            payload_len: u32::try_from(uint(&items[4])?).ok()?,
            payload_digest,
            new_version: u16::try_from(uint(&items[6])?).ok()?,
        })
    }
}

/// Derive the fragment key and IV for `target_oid` from the shared secret.
pub fn derive_fragment_key(
    secret: &[u8],
    target_oid: u16,
) -> (Zeroizing<[u8; 16]>, Zeroizing<[u8; 16]>) {
    let mut info = FRAGMENT_KEY_INFO.to_vec();
    info.extend_from_slice(&target_oid.to_be_bytes());

    let mut okm = Zeroizing::new([0u8; 32]);
    // 32 bytes is well below the HKDF-SHA256 output limit
    let _ = Hkdf::<Sha256>::new(None, secret).expand(&info, &mut okm[..]);

    let mut key = Zeroizing::new([0u8; 16]);
    let mut iv = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&okm[..16]);
    iv.copy_from_slice(&okm[16..]);
    (key, iv)
}

pub fn encrypt_fragment(secret: &[u8], target_oid: u16, plaintext: &[u8]) -> Vec<u8> {
    let (key, iv) = derive_fragment_key(secret, target_oid);
    cbc::Encryptor::<Aes128>::new((&*key).into(), (&*iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt_fragment(secret: &[u8], target_oid: u16, ciphertext: &[u8]) -> Option<Vec<u8>> {
    let (key, iv) = derive_fragment_key(secret, target_oid);
    cbc::Decryptor::<Aes128>::new((&*key).into(), (&*iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()
}
