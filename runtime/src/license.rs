/*++

Licensed under the Apache-2.0 license.

File Name:

    license.rs

Abstract:

    File contains the license gate. A license is an ECDSA-P256 signature by
    the vendor over the secure element's factory UID; every developer API
    stays closed until it verifies.

--*/

use crate::config::{SdcleConfig, LICENSE_PLACEHOLDER};
use crate::identity;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sdcle_drivers::{cprintln, SeInstanceManager};
use sdcle_error::{SdcleError, SdcleResult};
use std::sync::atomic::{AtomicU8, Ordering};

/// Library version reported with the license status.
pub const SDCLE_VERSION: &str = "2.8.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseStatus {
    Ok,
    /// The factory UID could not be read.
    SeError,
    /// UID, key or vendor key is missing or still a placeholder.
    InvalidConfig,
    /// The license was issued for another device.
    InvalidUid,
    /// The signature does not verify.
    InvalidKey,
    NotInitialized,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SeError => "SE_ERROR",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::InvalidUid => "INVALID_UID",
            Self::InvalidKey => "INVALID_KEY",
            Self::NotInitialized => "NOT_INITIALIZED",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::SeError => 1,
            Self::InvalidConfig => 2,
            Self::InvalidUid => 3,
            Self::InvalidKey => 4,
            Self::NotInitialized => 5,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Ok,
            1 => Self::SeError,
            2 => Self::InvalidConfig,
            3 => Self::InvalidUid,
            4 => Self::InvalidKey,
            _ => Self::NotInitialized,
        }
    }
}

struct LicenseMaterial {
    uid_hex: String,
    signature: Vec<u8>,
    vendor_key: VerifyingKey,
}

fn is_unset(val: &str) -> bool {
    let val = val.trim();
    val.is_empty() || val == LICENSE_PLACEHOLDER
}

impl LicenseMaterial {
    fn from_config(config: &SdcleConfig) -> Result<Self, LicenseStatus> {
        if is_unset(&config.license_uid) || is_unset(&config.license_key) {
            return Err(LicenseStatus::InvalidConfig);
        }
        let vendor_key = hex::decode(config.vendor_public_key.trim())
            .ok()
            .and_then(|sec1| VerifyingKey::from_sec1_bytes(&sec1).ok())
            .ok_or(LicenseStatus::InvalidConfig)?;
        let signature = STANDARD
            .decode(config.license_key.trim())
            .map_err(|_| LicenseStatus::InvalidKey)?;
        Ok(Self {
            uid_hex: config.license_uid.trim().to_string(),
            signature,
            vendor_key,
        })
    }
}

/// Boot-time license state, readable from every task.
#[derive(Debug)]
pub struct LicenseGate {
    status: AtomicU8,
}

impl Default for LicenseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LicenseGate {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(LicenseStatus::NotInitialized.to_u8()),
        }
    }

    /// Verify the configured license against the device.
    ///
    /// Once a verification has succeeded the gate stays open for the rest of
    /// the boot and later calls do not touch the secure element.
    pub fn verify(&self, se: &SeInstanceManager, config: &SdcleConfig) -> LicenseStatus {
        if self.status() == LicenseStatus::Ok {
            return LicenseStatus::Ok;
        }
        let status = Self::evaluate(se, config);
        self.status.store(status.to_u8(), Ordering::Release);
        match status {
            LicenseStatus::Ok => cprintln!("[lic] License valid, SDCLE {}", SDCLE_VERSION),
            failed => cprintln!("[lic] License check failed: {}", failed.as_str()),
        }
        status
    }

    fn evaluate(se: &SeInstanceManager, config: &SdcleConfig) -> LicenseStatus {
        let material = match LicenseMaterial::from_config(config) {
            Ok(material) => material,
            Err(status) => return status,
        };
        let uid = match identity::read_factory_uid(se) {
            Ok(uid) => uid,
            Err(_) => return LicenseStatus::SeError,
        };
        if !material.uid_hex.eq_ignore_ascii_case(&hex::encode(uid)) {
            return LicenseStatus::InvalidUid;
        }
        let verified = Signature::from_der(&material.signature)
            .ok()
            .is_some_and(|sig| material.vendor_key.verify(&uid, &sig).is_ok());
        if verified {
            LicenseStatus::Ok
        } else {
            LicenseStatus::InvalidKey
        }
    }

    pub fn status(&self) -> LicenseStatus {
        LicenseStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_licensed(&self) -> bool {
        self.status() == LicenseStatus::Ok
    }

    /// Entry check of every gated API.
    pub fn check(&self) -> SdcleResult<()> {
        if self.is_licensed() {
            Ok(())
        } else {
            Err(SdcleError::NOT_LICENSED)
        }
    }
}
