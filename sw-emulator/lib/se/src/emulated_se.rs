/*++

Licensed under the Apache-2.0 license.

File Name:

    emulated_se.rs

Abstract:

    Software secure element. Executes commands against the object store and
    reports completions immediately, after a delay, or never, depending on
    the injected faults.

--*/

use crate::manifest::{self, UpdateManifest};
use crate::object::{self, FactoryProfile, Object, COUNTER_LEN};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use coset::{CborSerializable, CoseSign1};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sdcle_drivers::{
    oid, status, Completion, DataObjectType, Metadata, SeCommand, SecureElement, WriteMode,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

type SeResult<T> = Result<T, u16>;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub name: &'static str,
    pub target: Option<u16>,
    pub status: u16,
}

#[derive(Default)]
struct Faults {
    completion_delay: Option<Duration>,
    dropped_write_callbacks: u32,
    status_overrides: VecDeque<(&'static str, u16)>,
    fail_open: Option<u16>,
}

struct PendingUpdate {
    manifest: UpdateManifest,
}

struct State {
    objects: BTreeMap<u16, Object>,
    pending_update: Option<PendingUpdate>,
    faults: Faults,
    journal: Vec<JournalEntry>,
    open: bool,
}

/// Handle to an emulated secure element.
///
/// Clones share the device, so a test can keep one handle for inspection
/// while another is owned by the instance manager.
#[derive(Clone)]
pub struct EmulatedSe {
    state: Arc<Mutex<State>>,
}

impl EmulatedSe {
    pub fn new(profile: FactoryProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: object::factory_layout(&profile),
                pending_update: None,
                faults: Faults::default(),
                journal: Vec::new(),
                open: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete every accepted command after `delay` on a helper thread.
    pub fn set_completion_delay(&self, delay: Option<Duration>) {
        self.lock().faults.completion_delay = delay;
    }

    /// Apply the next `count` data writes but never fire their callbacks.
    pub fn drop_write_callbacks(&self, count: u32) {
        self.lock().faults.dropped_write_callbacks = count;
    }

    /// Fail the next command named `name` with `status` without executing it.
    pub fn fail_next(&self, name: &'static str, status: u16) {
        self.lock().faults.status_overrides.push_back((name, status));
    }

    pub fn fail_open(&self, status: Option<u16>) {
        self.lock().faults.fail_open = status;
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Number of executed commands that changed `target`.
    pub fn writes_to(&self, target: u16) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|e| e.target == Some(target) && e.status == status::SUCCESS)
            .count()
    }

    pub fn object_data(&self, oid: u16) -> Option<Vec<u8>> {
        self.lock().objects.get(&oid).map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, oid: u16) -> Option<Metadata> {
        self.lock()
            .objects
            .get(&oid)
            .map(|o| o.reported_metadata())
    }

    /// Provisioning backdoor: replace object contents without access checks.
    pub fn provision_data(&self, oid: u16, data: &[u8]) {
        if let Some(o) = self.lock().objects.get_mut(&oid) {
            o.data = data.to_vec();
        }
    }

    /// Provisioning backdoor: merge metadata without access checks.
    pub fn provision_metadata(&self, oid: u16, metadata: &Metadata) {
        if let Some(o) = self.lock().objects.get_mut(&oid) {
            o.metadata.merge(metadata);
        }
    }

    /// Uncompressed public key of an ECC key object.
    pub fn public_key(&self, key_oid: u16) -> Option<[u8; 65]> {
        let state = self.lock();
        let key = state.objects.get(&key_oid)?.key.as_ref()?;
        key.public_key()
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .ok()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl SecureElement for EmulatedSe {
    fn open(&mut self) -> Result<(), u16> {
        let mut state = self.lock();
        match state.faults.fail_open {
            Some(failure) => Err(failure),
            None => {
                state.open = true;
                Ok(())
            }
        }
    }

    fn submit(&mut self, cmd: SeCommand, completion: Completion) -> Result<(), u16> {
        let mut state = self.lock();
        if !state.open {
            return Err(status::LIB_ERROR);
        }

        let name = cmd.name();
        let target = cmd.target_oid();
        let is_write = matches!(cmd, SeCommand::WriteData { .. });

        let forced = state
            .faults
            .status_overrides
            .iter()
            .position(|(n, _)| *n == name);
        let overridden = forced.and_then(|i| state.faults.status_overrides.remove(i));

        let (result_status, output) = match overridden {
            Some((_, forced)) => (forced, Vec::new()),
            None => match state.execute(cmd) {
                Ok(output) => (status::SUCCESS, output),
                Err(failure) => (failure, Vec::new()),
            },
        };
        state.journal.push(JournalEntry {
            name,
            target,
            status: result_status,
        });

        if is_write && state.faults.dropped_write_callbacks > 0 {
            state.faults.dropped_write_callbacks -= 1;
            return Ok(());
        }

        match state.faults.completion_delay {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    completion.complete(result_status, output);
                });
            }
            None => completion.complete(result_status, output),
        }
        Ok(())
    }
}

fn integer_pair(sig: &Signature) -> Vec<u8> {
    let mut out = vec![0u8; 2 * 35];
    let mut pos = 0;
    for scalar in [sig.r().to_bytes(), sig.s().to_bytes()] {
        pos += sdcle_x509::der_encode_uint(&scalar, &mut out[pos..]).unwrap_or(0);
    }
    out.truncate(pos);
    out
}

fn bit_string_public_key(key: &SecretKey) -> Vec<u8> {
    let point = key.public_key().to_encoded_point(false);
    let mut out = vec![0x03, 0x42, 0x00];
    out.extend_from_slice(point.as_bytes());
    out
}

impl State {
    fn object(&self, oid: u16) -> SeResult<&Object> {
        self.objects.get(&oid).ok_or(status::INVALID_OID)
    }

    fn object_mut(&mut self, oid: u16) -> SeResult<&mut Object> {
        self.objects.get_mut(&oid).ok_or(status::INVALID_OID)
    }

    /// Data of an object used as a secret, checked against execute access.
    fn secret(&self, oid: u16) -> SeResult<Vec<u8>> {
        let o = self.object(oid)?;
        if !o.execute_access().permits_plain(o.lcso()) {
            return Err(status::ACCESS_DENIED);
        }
        if o.data.is_empty() {
            return Err(status::INVALID_DATA);
        }
        Ok(o.data.clone())
    }

    fn signing_key(&self, key_oid: u16) -> SeResult<SecretKey> {
        let o = self.object(key_oid)?;
        if !o.execute_access().permits_plain(o.lcso()) {
            return Err(status::ACCESS_DENIED);
        }
        o.key.clone().ok_or(status::INVALID_DATA)
    }

    fn execute(&mut self, cmd: SeCommand) -> SeResult<Vec<u8>> {
        match cmd {
            SeCommand::ReadData { oid, offset } => {
                let o = self.object(oid)?;
                if !o.read_access().permits_plain(o.lcso()) {
                    return Err(status::ACCESS_DENIED);
                }
                let offset = usize::from(offset);
                if offset > o.data.len() {
                    return Err(status::INVALID_PARAMETER);
                }
                Ok(o.data[offset..].to_vec())
            }
            SeCommand::ReadMetadata { oid } => Ok(self.object(oid)?.reported_metadata().to_bytes()),
            SeCommand::WriteData {
                oid,
                mode,
                offset,
                data,
            } => {
                let o = self.object_mut(oid)?;
                if !o.change_access().permits_plain(o.lcso()) {
                    return Err(status::ACCESS_DENIED);
                }
                let offset = usize::from(offset);
                if offset + data.len() > o.capacity {
                    return Err(status::BOUNDARY_EXCEEDED);
                }
                match mode {
                    WriteMode::EraseAndWrite => o.data.clear(),
                    WriteMode::Write if offset > o.data.len() => {
                        return Err(status::INVALID_PARAMETER)
                    }
                    WriteMode::Write => {}
                }
                if o.data.len() < offset + data.len() {
                    o.data.resize(offset + data.len(), 0);
                }
                o.data[offset..offset + data.len()].copy_from_slice(&data);
                Ok(Vec::new())
            }
            SeCommand::WriteMetadata { oid, metadata } => {
                let update = Metadata::parse(&metadata).map_err(|_| status::INVALID_DATA)?;
                let o = self.object_mut(oid)?;
                if o.lcso() >= sdcle_drivers::lcso::OPERATIONAL {
                    return Err(status::ACCESS_DENIED);
                }
                if update.lcso.is_some_and(|next| next < o.lcso()) {
                    return Err(status::INVALID_PARAMETER);
                }
                o.metadata.merge(&update);
                Ok(Vec::new())
            }
            SeCommand::IncrementCounter { oid, step } => {
                if !(oid::COUNTER_BASE..oid::COUNTER_BASE + 4).contains(&oid) {
                    return Err(status::INVALID_OID);
                }
                let o = self.object_mut(oid)?;
                if o.data.len() != COUNTER_LEN {
                    return Err(status::INVALID_DATA);
                }
                let count = u32::from_be_bytes([o.data[0], o.data[1], o.data[2], o.data[3]]);
                let threshold = u32::from_be_bytes([o.data[4], o.data[5], o.data[6], o.data[7]]);
                let next = count
                    .checked_add(u32::from(step))
                    .filter(|n| *n <= threshold)
                    .ok_or(status::COUNTER_THRESHOLD)?;
                o.data[..4].copy_from_slice(&next.to_be_bytes());
                Ok(Vec::new())
            }
            SeCommand::ProtectedUpdateStart {
                manifest_version,
                manifest,
            } => {
                self.pending_update = None;
                let verified = self.verify_manifest(manifest_version, &manifest)?;
                self.pending_update = Some(PendingUpdate { manifest: verified });
                Ok(Vec::new())
            }
            SeCommand::ProtectedUpdateFinal { fragment } => {
                let pending = self.pending_update.take().ok_or(status::INVALID_SEQUENCE)?;
                self.apply_fragment(&pending.manifest, &fragment)?;
                Ok(Vec::new())
            }
            SeCommand::GetRandom { len } => {
                if !(8..=256).contains(&len) {
                    return Err(status::INVALID_PARAMETER);
                }
                let mut out = vec![0u8; usize::from(len)];
                rand::thread_rng().fill_bytes(&mut out);
                Ok(out)
            }
            SeCommand::GenerateKeyPair { key_oid, .. } => {
                if !(oid::FACTORY_KEY..=oid::KEY_3).contains(&key_oid) {
                    return Err(status::INVALID_OID);
                }
                let o = self.object_mut(key_oid)?;
                if !o.change_access().permits_plain(o.lcso()) {
                    return Err(status::ACCESS_DENIED);
                }
                let key = SecretKey::random(&mut rand::rngs::OsRng);
                let out = bit_string_public_key(&key);
                o.key = Some(key);
                Ok(out)
            }
            SeCommand::EcdsaSign { key_oid, digest } => {
                if digest.len() != 32 {
                    return Err(status::INVALID_LENGTH);
                }
                let key = SigningKey::from(self.signing_key(key_oid)?);
                let sig: Signature = key
                    .sign_prehash(&digest)
                    .map_err(|_| status::INTERNAL_ERROR)?;
                Ok(integer_pair(&sig))
            }
            SeCommand::Hash { data } => Ok(Sha256::digest(&data).to_vec()),
            SeCommand::Hmac { secret_oid, data } => {
                let secret = self.secret(secret_oid)?;
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&secret)
                    .map_err(|_| status::INVALID_DATA)?;
                mac.update(&data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            SeCommand::Ecdh {
                key_oid,
                peer_public,
            } => {
                if !(oid::FACTORY_KEY..=oid::KEY_3).contains(&key_oid) {
                    return Err(status::INVALID_OID);
                }
                let key = self.signing_key(key_oid)?;
                let peer = PublicKey::from_sec1_bytes(&peer_public)
                    .map_err(|_| status::INVALID_PARAMETER)?;
                let shared =
                    p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer.as_affine());
                Ok(shared.raw_secret_bytes().to_vec())
            }
            SeCommand::Hkdf {
                secret_oid,
                salt,
                info,
                len,
            } => {
                let secret = self.secret(secret_oid)?;
                let salt = (!salt.is_empty()).then_some(salt.as_slice());
                let mut out = vec![0u8; usize::from(len)];
                Hkdf::<Sha256>::new(salt, &secret)
                    .expand(&info, &mut out)
                    .map_err(|_| status::INVALID_LENGTH)?;
                Ok(out)
            }
            SeCommand::GenerateSymmetricKey { size, key_oid } => {
                if key_oid != oid::SESSION_KEY {
                    return Err(status::INVALID_OID);
                }
                let mut key = vec![0u8; size.key_len()];
                rand::thread_rng().fill_bytes(&mut key);
                self.object_mut(key_oid)?.data = key;
                Ok(Vec::new())
            }
            SeCommand::SymmetricEncrypt { key_oid, iv, data } => {
                self.aes_cbc(key_oid, &iv, data, true)
            }
            SeCommand::SymmetricDecrypt { key_oid, iv, data } => {
                self.aes_cbc(key_oid, &iv, data, false)
            }
        }
    }

    fn aes_cbc(
        &self,
        key_oid: u16,
        iv: &[u8],
        mut data: Vec<u8>,
        encrypt: bool,
    ) -> SeResult<Vec<u8>> {
        if key_oid != oid::SESSION_KEY {
            return Err(status::INVALID_OID);
        }
        let key = self.object(key_oid)?.data.clone();
        if iv.len() != 16 {
            return Err(status::INVALID_PARAMETER);
        }
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(status::INVALID_LENGTH);
        }

        macro_rules! run {
            ($cipher:ty) => {{
                let len = data.len();
                if encrypt {
                    cbc::Encryptor::<$cipher>::new_from_slices(&key, iv)
                        .map_err(|_| status::INVALID_DATA)?
                        .encrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut data, len)
                        .map_err(|_| status::INVALID_LENGTH)?;
                } else {
                    cbc::Decryptor::<$cipher>::new_from_slices(&key, iv)
                        .map_err(|_| status::INVALID_DATA)?
                        .decrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut data)
                        .map_err(|_| status::INVALID_LENGTH)?;
                }
            }};
        }

        match key.len() {
            16 => run!(aes::Aes128),
            24 => run!(aes::Aes192),
            32 => run!(aes::Aes256),
            // No key generated yet
            _ => return Err(status::INVALID_DATA),
        }
        Ok(data)
    }

    fn trust_anchor_key(&self, ta_oid: u16) -> SeResult<VerifyingKey> {
        let ta = self.object(ta_oid).map_err(|_| status::TRUST_ANCHOR_FAILURE)?;
        if ta.metadata.data_type != Some(DataObjectType::TrustAnchor) {
            return Err(status::TRUST_ANCHOR_FAILURE);
        }
        let (_, cert) = x509_parser::parse_x509_certificate(&ta.data)
            .map_err(|_| status::TRUST_ANCHOR_FAILURE)?;
        VerifyingKey::from_sec1_bytes(&cert.public_key().subject_public_key.data)
            .map_err(|_| status::TRUST_ANCHOR_FAILURE)
    }

    fn verify_manifest(&self, manifest_version: u8, manifest: &[u8]) -> SeResult<UpdateManifest> {
        if manifest_version != 1 {
            return Err(status::INVALID_PARAMETER);
        }
        let sign1 = CoseSign1::from_slice(manifest).map_err(|_| status::INVALID_DATA)?;
        let payload = sign1.payload.as_deref().ok_or(status::INVALID_DATA)?;
        let m = UpdateManifest::from_cbor(payload).ok_or(status::INVALID_DATA)?;

        // Target must be bound to the signing trust anchor
        let target = self.object(m.target_oid)?;
        match target.change_access().integrity_oid() {
            Some(ta) if ta == m.trust_anchor_oid => {}
            _ => return Err(status::ACCESS_DENIED),
        }

        let key = self.trust_anchor_key(m.trust_anchor_oid)?;
        sign1
            .verify_signature(b"", |sig, data| {
                let sig = Signature::from_slice(sig).map_err(|_| ())?;
                key.verify(data, &sig).map_err(|_| ())
            })
            .map_err(|_| status::TRUST_ANCHOR_FAILURE)?;

        let current = target.metadata.version.unwrap_or(0);
        if m.new_version <= current {
            return Err(status::INVALID_VERSION);
        }
        Ok(m)
    }

    fn apply_fragment(&mut self, m: &UpdateManifest, fragment: &[u8]) -> SeResult<()> {
        let digest: [u8; 32] = Sha256::digest(fragment).into();
        if fragment.len() != m.payload_len as usize || digest != m.payload_digest {
            return Err(status::UPDATE_SIGNATURE_MISMATCH);
        }

        let access = self.object(m.target_oid)?.change_access();
        let plaintext = match access.confidentiality_oid() {
            Some(secret_oid) if secret_oid == m.secret_oid => {
                let secret = self.secret(secret_oid)?;
                manifest::decrypt_fragment(&secret, m.target_oid, fragment)
                    .ok_or(status::UPDATE_SIGNATURE_MISMATCH)?
            }
            Some(_) => return Err(status::ACCESS_DENIED),
            None => fragment.to_vec(),
        };

        let target = self.object_mut(m.target_oid)?;
        if plaintext.len() > target.capacity {
            return Err(status::BOUNDARY_EXCEEDED);
        }
        target.data = plaintext;
        target.metadata.version = Some(m.new_version);
        Ok(())
    }
}
