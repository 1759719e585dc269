/*++

Licensed under the Apache-2.0 license.

File Name:

    se.rs

Abstract:

    File contains the secure element command model: object ids, status codes,
    commands, the completion record the SE callback fills in, and the
    transport trait a secure element implementation provides.

--*/

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroize;

/// Fixed object id map of the secure element.
pub mod oid {
    /// Global lifecycle state.
    pub const GLOBAL_LIFECYCLE: u16 = 0xE0C0;
    /// Factory UID, 27 bytes, read only.
    pub const FACTORY_UID: u16 = 0xE0C2;
    pub const FACTORY_CERT: u16 = 0xE0E0;
    /// Legacy device certificate slot. Locked on part of the fleet.
    pub const LEGACY_DEVICE_CERT: u16 = 0xE0E1;
    pub const DEVICE_CERT: u16 = 0xE0E2;
    pub const LEGACY_ROOT_CA: u16 = 0xE0E3;
    pub const TRUST_ANCHOR: u16 = 0xE0E8;
    pub const LEGACY_ROOT_CA_2: u16 = 0xE0E9;
    pub const FACTORY_KEY: u16 = 0xE0F0;
    pub const DEVICE_KEY: u16 = 0xE0F1;
    pub const KEY_2: u16 = 0xE0F2;
    pub const KEY_3: u16 = 0xE0F3;
    pub const COUNTER_BASE: u16 = 0xE120;
    pub const SESSION_KEY: u16 = 0xE200;
    pub const DATA_SLOT_BASE: u16 = 0xF1D0;
    /// Protected update confidentiality secret.
    pub const UPDATE_SHARED_SECRET: u16 = 0xF1D4;
    pub const DATA_SLOT_LAST: u16 = 0xF1DB;
    pub const LARGE_DATA_SLOT_BASE: u16 = 0xF1E0;
    pub const LARGE_DATA_SLOT_LAST: u16 = 0xF1E1;

    pub const FACTORY_UID_LEN: usize = 27;
    pub const DATA_SLOT_CAPACITY: usize = 140;
    pub const LARGE_DATA_SLOT_CAPACITY: usize = 1500;
}

/// Status codes reported by the secure element and its host library.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const BUSY: u16 = 0x0001;
    pub const LIB_ERROR: u16 = 0x0102;
    pub const INVALID_OID: u16 = 0x8001;
    pub const INVALID_PARAMETER: u16 = 0x8003;
    pub const INVALID_LENGTH: u16 = 0x8004;
    pub const INVALID_DATA: u16 = 0x8005;
    pub const INTERNAL_ERROR: u16 = 0x8006;
    pub const ACCESS_DENIED: u16 = 0x8007;
    pub const BOUNDARY_EXCEEDED: u16 = 0x8008;
    pub const INVALID_SEQUENCE: u16 = 0x800A;
    pub const COUNTER_THRESHOLD: u16 = 0x8021;
    pub const TRUST_ANCHOR_FAILURE: u16 = 0x8029;
    pub const INVALID_VERSION: u16 = 0x802A;
    pub const UPDATE_SIGNATURE_MISMATCH: u16 = 0x802C;
}

/// Lifecycle values stored under metadata tag `C0`.
pub mod lcso {
    pub const CREATION: u8 = 0x01;
    pub const INITIALIZATION: u8 = 0x03;
    pub const OPERATIONAL: u8 = 0x07;
    pub const TERMINATION: u8 = 0x0F;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Erase the whole object, then write from offset 0.
    EraseAndWrite,
    /// Overwrite in place at the given offset.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    P256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesKeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKeySize {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            128 => Some(Self::Aes128),
            192 => Some(Self::Aes192),
            256 => Some(Self::Aes256),
            _ => None,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }
}

bitflags::bitflags! {
    /// On-chip key usage bits.
    pub struct SeKeyUsage: u8 {
        const AUTHENTICATION = 0x01;
        const ENCRYPTION = 0x02;
        const SIGN = 0x10;
        const KEY_AGREEMENT = 0x20;
    }
}

/// A single secure element operation.
///
/// Commands own their input so an implementation may complete them from a
/// different thread after `submit` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeCommand {
    ReadData {
        oid: u16,
        offset: u16,
    },
    ReadMetadata {
        oid: u16,
    },
    WriteData {
        oid: u16,
        mode: WriteMode,
        offset: u16,
        data: Vec<u8>,
    },
    WriteMetadata {
        oid: u16,
        metadata: Vec<u8>,
    },
    IncrementCounter {
        oid: u16,
        step: u8,
    },
    /// Verify a signed manifest against the trust anchor it names.
    ProtectedUpdateStart {
        manifest_version: u8,
        manifest: Vec<u8>,
    },
    /// Decrypt and commit the last payload block of a started update.
    ProtectedUpdateFinal {
        fragment: Vec<u8>,
    },
    GetRandom {
        len: u16,
    },
    /// Output: public key as a BIT STRING TLV (`03 42 00 04 X Y`).
    GenerateKeyPair {
        curve: EccCurve,
        usage: SeKeyUsage,
        key_oid: u16,
    },
    /// Output: `02 len r 02 len s`.
    EcdsaSign {
        key_oid: u16,
        digest: Vec<u8>,
    },
    Hash {
        data: Vec<u8>,
    },
    Hmac {
        secret_oid: u16,
        data: Vec<u8>,
    },
    /// Output: the 32 byte shared secret.
    Ecdh {
        key_oid: u16,
        peer_public: Vec<u8>,
    },
    Hkdf {
        secret_oid: u16,
        salt: Vec<u8>,
        info: Vec<u8>,
        len: u16,
    },
    GenerateSymmetricKey {
        size: AesKeySize,
        key_oid: u16,
    },
    /// AES-CBC without padding.
    SymmetricEncrypt {
        key_oid: u16,
        iv: Vec<u8>,
        data: Vec<u8>,
    },
    SymmetricDecrypt {
        key_oid: u16,
        iv: Vec<u8>,
        data: Vec<u8>,
    },
}

impl SeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadData { .. } => "read_data",
            Self::ReadMetadata { .. } => "read_metadata",
            Self::WriteData { .. } => "write_data",
            Self::WriteMetadata { .. } => "write_metadata",
            Self::IncrementCounter { .. } => "increment_counter",
            Self::ProtectedUpdateStart { .. } => "protected_update_start",
            Self::ProtectedUpdateFinal { .. } => "protected_update_final",
            Self::GetRandom { .. } => "get_random",
            Self::GenerateKeyPair { .. } => "generate_keypair",
            Self::EcdsaSign { .. } => "ecdsa_sign",
            Self::Hash { .. } => "hash",
            Self::Hmac { .. } => "hmac",
            Self::Ecdh { .. } => "ecdh",
            Self::Hkdf { .. } => "hkdf",
            Self::GenerateSymmetricKey { .. } => "generate_symmetric_key",
            Self::SymmetricEncrypt { .. } => "symmetric_encrypt",
            Self::SymmetricDecrypt { .. } => "symmetric_decrypt",
        }
    }

    /// Object written by this command, if any.
    pub fn target_oid(&self) -> Option<u16> {
        match self {
            Self::WriteData { oid, .. }
            | Self::WriteMetadata { oid, .. }
            | Self::IncrementCounter { oid, .. } => Some(*oid),
            Self::GenerateKeyPair { key_oid, .. } | Self::GenerateSymmetricKey { key_oid, .. } => {
                Some(*key_oid)
            }
            _ => None,
        }
    }
}

struct CompletionState {
    status: AtomicU16,
    output: Mutex<Vec<u8>>,
}

impl Drop for CompletionState {
    fn drop(&mut self) {
        if let Ok(output) = self.output.get_mut() {
            output.zeroize();
        }
    }
}

/// Result slot shared between a waiting task and the SE callback.
///
/// The status starts as `BUSY`. The callback stores the output first and then
/// publishes the status with release ordering, so a poller that observes a
/// non-busy status also observes the output.
#[derive(Clone)]
pub struct Completion(Arc<CompletionState>);

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self(Arc::new(CompletionState {
            status: AtomicU16::new(status::BUSY),
            output: Mutex::new(Vec::new()),
        }))
    }

    /// SE callback entry point.
    pub fn complete(&self, status: u16, output: Vec<u8>) {
        let mut slot = self.0.output.lock().unwrap_or_else(PoisonError::into_inner);
        slot.zeroize();
        *slot = output;
        drop(slot);
        self.0.status.store(status, Ordering::Release);
    }

    pub fn status(&self) -> u16 {
        self.0.status.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.status() == status::BUSY
    }

    pub fn take_output(&self) -> Vec<u8> {
        let mut slot = self.0.output.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *slot)
    }
}

/// Transport to a secure element.
///
/// `submit` either rejects the command synchronously with a status, or
/// accepts it and later reports the outcome through `Completion::complete`,
/// possibly from another thread. An accepted command is never cancelled.
pub trait SecureElement: Send {
    /// Open the application context on the device.
    fn open(&mut self) -> Result<(), u16>;

    fn submit(&mut self, cmd: SeCommand, completion: Completion) -> Result<(), u16>;
}
