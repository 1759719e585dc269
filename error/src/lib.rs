/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the error codes shared by every SDCLE crate.

--*/
#![cfg_attr(not(feature = "std"), no_std)]
use core::convert::From;
use core::num::{NonZeroU32, TryFromIntError};

/// SDCLE Error Type
/// Derives debug, copy, clone, eq, and partial eq
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SdcleError(pub NonZeroU32);

/// Abstract error kinds. The high 16 bits of every code select one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    NotLicensed,
    ReservedOid,
    BufferTooSmall,
    Timeout,
    SeHardware,
    Protocol,
    Network,
    NotSupported,
    Internal,
}

/// Macro to define error constants ensuring uniqueness
///
/// This macro takes a list of (name, value, doc) tuples and generates
/// constant definitions for each error code, plus a lookup from code to
/// its description.
#[macro_export]
macro_rules! define_error_constants {
    ($(($name:ident, $value:expr, $doc:expr)),* $(,)?) => {
        $(
            #[doc = $doc]
            pub const $name: SdcleError = SdcleError::new_const($value);
        )*

        fn named_message(val: u32) -> Option<&'static str> {
            match val {
                $(
                    $value => Some($doc),
                )*
                _ => None,
            }
        }

        #[cfg(test)]
        /// Returns a vector of all defined error constants for testing uniqueness
        pub fn all_constants() -> Vec<(&'static str, u32)> {
            vec![
                $(
                    (stringify!($name), $value),
                )*
            ]
        }
    };
}

impl SdcleError {
    const KIND_SHIFT: u32 = 16;
    const SE_HARDWARE_BASE: u32 = 0x0006_0000;

    /// Create an error; intended to only be used from const contexts, as we don't want
    /// runtime panics if val is zero. The preferred way to get an SdcleError from a u32 is to
    /// use `SdcleError::try_from()` from the `TryFrom` trait impl.
    const fn new_const(val: u32) -> Self {
        match NonZeroU32::new(val) {
            Some(val) => Self(val),
            None => panic!("SdcleError cannot be 0"),
        }
    }

    /// Wrap a non-success status returned by the secure element. The status
    /// is carried verbatim in the low 16 bits.
    pub const fn from_se_status(status: u16) -> Self {
        Self::new_const(Self::SE_HARDWARE_BASE | status as u32)
    }

    /// Status reported by the secure element, for hardware errors.
    pub fn se_status(&self) -> Option<u16> {
        match self.kind() {
            ErrorKind::SeHardware => Some((self.0.get() & 0xffff) as u16),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.0.get() >> Self::KIND_SHIFT {
            0x0001 => ErrorKind::InvalidArgument,
            0x0002 => ErrorKind::NotLicensed,
            0x0003 => ErrorKind::ReservedOid,
            0x0004 => ErrorKind::BufferTooSmall,
            0x0005 => ErrorKind::Timeout,
            0x0006 => ErrorKind::SeHardware,
            0x0007 => ErrorKind::Protocol,
            0x0008 => ErrorKind::Network,
            0x0009 => ErrorKind::NotSupported,
            _ => ErrorKind::Internal,
        }
    }

    /// Human readable description, used in failure acknowledgements.
    pub fn message(&self) -> &'static str {
        if let Some(msg) = Self::named_message(self.0.get()) {
            return msg;
        }
        match self.kind() {
            ErrorKind::SeHardware => "Secure element returned an error status",
            _ => "Unknown error",
        }
    }

    /// Code reported on the wire: the raw SE status for hardware errors,
    /// the full error code otherwise.
    pub fn wire_code(&self) -> u32 {
        match self.se_status() {
            Some(status) => status.into(),
            None => self.0.get(),
        }
    }

    // Use the macro to define all error constants
    define_error_constants![
        (INVALID_ARGUMENT, 0x0001_0001, "Invalid argument"),
        (
            CRYPTO_RANDOM_INVALID_LENGTH,
            0x0001_0002,
            "Random length must be within 8..=256 bytes"
        ),
        (
            STORE_INVALID_SLOT,
            0x0001_0003,
            "Secure storage slot out of range"
        ),
        (
            STORE_DATA_TOO_LARGE,
            0x0001_0004,
            "Data exceeds secure storage slot capacity"
        ),
        (STORE_EMPTY_DATA, 0x0001_0005, "Secure storage data is empty"),
        (
            PSA_INVALID_HASH_LENGTH,
            0x0001_0006,
            "Sign-hash input must be 32 bytes"
        ),
        (
            PSA_INVALID_SLOT,
            0x0001_0007,
            "PSA key slot out of range or not allocated"
        ),
        (
            CRYPTO_AES_INVALID_KEY_SIZE,
            0x0001_0008,
            "AES key size must be 128, 192 or 256 bits"
        ),
        (CRYPTO_AES_INVALID_IV, 0x0001_0009, "AES-CBC IV must be 16 bytes"),
        (
            CRYPTO_AES_INVALID_DATA_LENGTH,
            0x0001_000A,
            "AES-CBC data must be a non-empty multiple of 16 bytes"
        ),
        (
            CRYPTO_INVALID_KEY_OID,
            0x0001_000B,
            "Key OID must be within 0xE0F0..=0xE0F3"
        ),
        (
            CRYPTO_INVALID_PEER_KEY,
            0x0001_000C,
            "Peer public key must be an uncompressed P-256 point"
        ),
        (
            CRYPTO_INVALID_SECRET_SLOT,
            0x0001_000D,
            "Secret slot must be a developer data slot"
        ),
        (
            CRYPTO_HKDF_INVALID_LENGTH,
            0x0001_000E,
            "HKDF output length must be within 1..=256 bytes"
        ),
        (
            CRYPTO_COUNTER_INVALID_ID,
            0x0001_000F,
            "Monotonic counter id out of range"
        ),
        (
            CRYPTO_COUNTER_INVALID_STEP,
            0x0001_0010,
            "Monotonic counter step must be non-zero"
        ),
        (
            X509_INVALID_SUBJECT,
            0x0001_0011,
            "CSR subject is empty"
        ),
        (
            X509_INVALID_PUBLIC_KEY,
            0x0001_0012,
            "Public key is not an uncompressed P-256 point"
        ),
        (CRYPTO_EMPTY_DATA, 0x0001_0013, "Input data is empty"),
        (NOT_LICENSED, 0x0002_0001, "License gate closed"),
        (
            STORE_RESERVED_SLOT,
            0x0003_0001,
            "Slot 4 (0xF1D4) is reserved for the update shared secret"
        ),
        (BUFFER_TOO_SMALL, 0x0004_0001, "Output buffer too small"),
        (DER_BUFFER_TOO_SMALL, 0x0004_0002, "DER output buffer too small"),
        (PEM_BUFFER_TOO_SMALL, 0x0004_0003, "PEM output buffer too small"),
        (
            PSA_SIGNATURE_BUFFER_TOO_SMALL,
            0x0004_0004,
            "Signature buffer must hold 64 bytes"
        ),
        (
            PSA_PUBLIC_KEY_BUFFER_TOO_SMALL,
            0x0004_0005,
            "Public key buffer too small"
        ),
        (
            SE_OPERATION_TIMEOUT,
            0x0005_0001,
            "Secure element callback did not fire before the deadline"
        ),
        (
            SE_MUTEX_TIMEOUT,
            0x0005_0002,
            "Timed out acquiring the secure element"
        ),
        (
            CSR_CERTIFICATE_TIMEOUT,
            0x0005_0003,
            "No certificate received for the CSR before the deadline"
        ),
        (
            PLATFORM_RESPONSE_TIMEOUT,
            0x0005_0004,
            "No platform response before the deadline"
        ),
        (
            SE_ACCESS_DENIED,
            0x0006_8007,
            "Access conditions not satisfied (metadata not programmed)"
        ),
        (
            SE_TRUST_ANCHOR_VERIFICATION,
            0x0006_8029,
            "Manifest trust anchor verification failed"
        ),
        (
            SE_UPDATE_SIGNATURE_MISMATCH,
            0x0006_802C,
            "Protected update payload does not match the manifest"
        ),
        (PROTOCOL_INVALID_JSON, 0x0007_0001, "Malformed JSON payload"),
        (
            PU_MISSING_FIELD,
            0x0007_0002,
            "Protected update bundle is missing a required field"
        ),
        (
            PU_BASE64_DECODE,
            0x0007_0003,
            "Protected update field is not valid Base64"
        ),
        (
            PU_TOO_MANY_FRAGMENTS,
            0x0007_0004,
            "Protected update bundle carries more than three fragments"
        ),
        (
            CORRELATION_MISMATCH,
            0x0007_0005,
            "Correlation id does not match the pending request"
        ),
        (
            CSR_CERT_SUBJECT_MISMATCH,
            0x0007_0006,
            "Certificate subject CN does not match the device UID"
        ),
        (X509_MALFORMED, 0x0007_0007, "Malformed X.509 certificate"),
        (PEM_MALFORMED, 0x0007_0008, "Malformed PEM armor"),
        (
            DER_LENGTH_UNSUPPORTED,
            0x0007_0009,
            "DER length exceeds the two-byte long form"
        ),
        (
            SE_READBACK_MISMATCH,
            0x0007_000A,
            "Readback differs from the written data"
        ),
        (
            CSR_UNEXPECTED_STATE,
            0x0007_000B,
            "CSR workflow is not in the expected state"
        ),
        (
            PU_WORKFLOW_BUSY,
            0x0007_000C,
            "A protected update is already in progress"
        ),
        (SE_METADATA_MALFORMED, 0x0007_000D, "Malformed SE metadata"),
        (
            X509_SIGNATURE_MALFORMED,
            0x0007_000E,
            "Malformed ECDSA signature encoding"
        ),
        (
            CERT_NO_VALID_CERTIFICATE,
            0x0007_000F,
            "Neither the device nor the factory certificate is valid"
        ),
        (
            CERT_EMPTY_PAYLOAD,
            0x0007_0010,
            "Certificate payload is empty"
        ),
        (
            NETWORK_CONNECT_FAILED,
            0x0008_0001,
            "MQTT/TLS connection failed"
        ),
        (NETWORK_PUBLISH_FAILED, 0x0008_0002, "MQTT publish failed"),
        (NETWORK_SUBSCRIBE_FAILED, 0x0008_0003, "MQTT subscribe failed"),
        (NETWORK_NOT_CONNECTED, 0x0008_0004, "MQTT session is down"),
        (
            PSA_NOT_SUPPORTED,
            0x0009_0001,
            "Only ECC P-256 keys with sign/derive usage are supported"
        ),
        (
            PU_SPLIT_FRAGMENTS_UNSUPPORTED,
            0x0009_0002,
            "Split continue/final fragment submission is not supported"
        ),
        (SE_NOT_INITIALIZED, 0x000A_0001, "Secure element not initialized"),
        (
            SE_MUTEX_RECURSIVE,
            0x000A_0002,
            "Secure element mutex acquired twice from the same thread"
        ),
        (PSA_NO_FREE_SLOT, 0x000A_0003, "All PSA key slots are in use"),
        (
            PSA_SLOT_PINNED,
            0x000A_0004,
            "PSA key slot 0 is pinned to the TLS handle"
        ),
        (
            PSA_PUBLIC_KEY_UNAVAILABLE,
            0x000A_0005,
            "No public key cached for the slot's OID"
        ),
        (QUEUE_CLOSED, 0x000A_0006, "Subscriber queue closed"),
        (SE_INVALID_RESPONSE, 0x000A_0007, "Unexpected secure element response"),
    ];
}

impl From<core::num::NonZeroU32> for crate::SdcleError {
    fn from(val: core::num::NonZeroU32) -> Self {
        crate::SdcleError(val)
    }
}

impl From<SdcleError> for core::num::NonZeroU32 {
    fn from(val: SdcleError) -> Self {
        val.0
    }
}

impl From<SdcleError> for u32 {
    fn from(val: SdcleError) -> Self {
        core::num::NonZeroU32::from(val).get()
    }
}

impl TryFrom<u32> for SdcleError {
    type Error = TryFromIntError;
    fn try_from(val: u32) -> Result<Self, TryFromIntError> {
        match NonZeroU32::try_from(val) {
            Ok(val) => Ok(SdcleError(val)),
            Err(err) => Err(err),
        }
    }
}

impl core::fmt::Display for SdcleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08X} ({})", self.0.get(), self.message())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SdcleError {}

pub type SdcleResult<T> = Result<T, SdcleError>;
