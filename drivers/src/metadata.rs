/*++

Licensed under the Apache-2.0 license.

File Name:

    metadata.rs

Abstract:

    File contains the encoder and decoder for the secure element metadata
    container and its access conditions.

--*/

use crate::se::lcso;
use sdcle_error::{SdcleError, SdcleResult};

pub mod tag {
    pub const CONTAINER: u8 = 0x20;
    pub const LCSO: u8 = 0xC0;
    pub const VERSION: u8 = 0xC1;
    pub const MAX_SIZE: u8 = 0xC4;
    pub const USED_SIZE: u8 = 0xC5;
    pub const CHANGE: u8 = 0xD0;
    pub const READ: u8 = 0xD1;
    pub const EXECUTE: u8 = 0xD3;
    pub const DATA_TYPE: u8 = 0xE8;
}

const AC_ALWAYS: u8 = 0x00;
const AC_NEVER: u8 = 0xFF;
const AC_CONFIDENTIALITY: u8 = 0x20;
const AC_INTEGRITY: u8 = 0x21;
const AC_LCSO: u8 = 0xE1;
const OP_LESS_THAN: u8 = 0xFC;
const OP_AND: u8 = 0xFD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataObjectType {
    ByteString,
    UpdateCounter,
    TrustAnchor,
    DeviceCertificate,
    PlatformBinding,
    UpdateSecret,
    AuthReference,
}

impl DataObjectType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ByteString => 0x00,
            Self::UpdateCounter => 0x01,
            Self::TrustAnchor => 0x11,
            Self::DeviceCertificate => 0x12,
            Self::PlatformBinding => 0x21,
            Self::UpdateSecret => 0x22,
            Self::AuthReference => 0x23,
        }
    }

    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(Self::ByteString),
            0x01 => Some(Self::UpdateCounter),
            0x11 => Some(Self::TrustAnchor),
            0x12 => Some(Self::DeviceCertificate),
            0x21 => Some(Self::PlatformBinding),
            0x22 => Some(Self::UpdateSecret),
            0x23 => Some(Self::AuthReference),
            _ => None,
        }
    }
}

/// One term of an access condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Object lifecycle strictly below the given value.
    LcsoLessThan(u8),
    /// Integrity protected by a signature verified with the key in this object.
    Integrity(u16),
    /// Confidentiality protected by the secret in this object.
    Confidentiality(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCondition {
    Always,
    Never,
    /// Every condition must hold.
    All(Vec<Condition>),
}

impl AccessCondition {
    pub fn integrity_oid(&self) -> Option<u16> {
        match self {
            Self::All(terms) => terms.iter().find_map(|t| match t {
                Condition::Integrity(oid) => Some(*oid),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn confidentiality_oid(&self) -> Option<u16> {
        match self {
            Self::All(terms) => terms.iter().find_map(|t| match t {
                Condition::Confidentiality(oid) => Some(*oid),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Whether a plain (unsigned) command may pass this condition on an
    /// object in lifecycle state `lcso`.
    pub fn permits_plain(&self, lcso: u8) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::All(terms) => terms.iter().all(|t| match t {
                Condition::LcsoLessThan(limit) => lcso < *limit,
                Condition::Integrity(_) | Condition::Confidentiality(_) => false,
            }),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Always => out.push(AC_ALWAYS),
            Self::Never => out.push(AC_NEVER),
            Self::All(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        out.push(OP_AND);
                    }
                    match term {
                        Condition::LcsoLessThan(limit) => {
                            out.extend_from_slice(&[AC_LCSO, OP_LESS_THAN, *limit])
                        }
                        Condition::Integrity(oid) => {
                            out.push(AC_INTEGRITY);
                            out.extend_from_slice(&oid.to_be_bytes());
                        }
                        Condition::Confidentiality(oid) => {
                            out.push(AC_CONFIDENTIALITY);
                            out.extend_from_slice(&oid.to_be_bytes());
                        }
                    }
                }
            }
        }
    }

    fn decode(bytes: &[u8]) -> SdcleResult<Self> {
        match bytes {
            [AC_ALWAYS] => return Ok(Self::Always),
            [AC_NEVER] => return Ok(Self::Never),
            [] => return Err(SdcleError::SE_METADATA_MALFORMED),
            _ => {}
        }
        let mut terms = Vec::new();
        let mut rest = bytes;
        loop {
            let (term, tail) = match rest {
                [AC_LCSO, OP_LESS_THAN, limit, tail @ ..] => {
                    (Condition::LcsoLessThan(*limit), tail)
                }
                [AC_INTEGRITY, hi, lo, tail @ ..] => {
                    (Condition::Integrity(u16::from_be_bytes([*hi, *lo])), tail)
                }
                [AC_CONFIDENTIALITY, hi, lo, tail @ ..] => (
                    Condition::Confidentiality(u16::from_be_bytes([*hi, *lo])),
                    tail,
                ),
                _ => return Err(SdcleError::SE_METADATA_MALFORMED),
            };
            terms.push(term);
            match tail {
                [] => break,
                [OP_AND, next @ ..] => rest = next,
                _ => return Err(SdcleError::SE_METADATA_MALFORMED),
            }
        }
        Ok(Self::All(terms))
    }
}

/// Decoded metadata container. Absent tags are `None`; a write only
/// replaces the tags it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub lcso: Option<u8>,
    pub version: Option<u16>,
    pub max_size: Option<u16>,
    pub used_size: Option<u16>,
    pub change: Option<AccessCondition>,
    pub read: Option<AccessCondition>,
    pub execute: Option<AccessCondition>,
    pub data_type: Option<DataObjectType>,
}

impl Metadata {
    /// Change access `LcsO < operational`, used to reopen a key slot.
    pub fn key_slot_reset() -> Self {
        Self {
            change: Some(AccessCondition::All(vec![Condition::LcsoLessThan(
                lcso::OPERATIONAL,
            )])),
            ..Default::default()
        }
    }

    /// Marks an object as a trust anchor usable for manifest verification.
    pub fn trust_anchor() -> Self {
        Self {
            execute: Some(AccessCondition::Always),
            data_type: Some(DataObjectType::TrustAnchor),
            ..Default::default()
        }
    }

    /// Binds the target object's change access to the trust anchor and the
    /// update secret, and resets its version counter.
    pub fn protected_update_target(trust_anchor_oid: u16, secret_oid: u16) -> Self {
        Self {
            version: Some(0),
            change: Some(AccessCondition::All(vec![
                Condition::Integrity(trust_anchor_oid),
                Condition::Confidentiality(secret_oid),
            ])),
            ..Default::default()
        }
    }

    pub fn update_secret() -> Self {
        Self {
            read: Some(AccessCondition::All(vec![Condition::LcsoLessThan(
                lcso::OPERATIONAL,
            )])),
            execute: Some(AccessCondition::Always),
            data_type: Some(DataObjectType::AuthReference),
            ..Default::default()
        }
    }

    pub fn device_certificate() -> Self {
        Self {
            execute: Some(AccessCondition::Always),
            data_type: Some(DataObjectType::DeviceCertificate),
            ..Default::default()
        }
    }

    pub fn parse(bytes: &[u8]) -> SdcleResult<Self> {
        let body = match bytes {
            [tag::CONTAINER, len, body @ ..] if usize::from(*len) == body.len() => body,
            _ => return Err(SdcleError::SE_METADATA_MALFORMED),
        };

        let mut md = Metadata::default();
        let mut rest = body;
        while let [t, len, tail @ ..] = rest {
            let len = usize::from(*len);
            let value = tail.get(..len).ok_or(SdcleError::SE_METADATA_MALFORMED)?;
            match *t {
                tag::LCSO => md.lcso = Some(single_byte(value)?),
                tag::VERSION => md.version = Some(be_u16(value)?),
                tag::MAX_SIZE => md.max_size = Some(be_u16(value)?),
                tag::USED_SIZE => md.used_size = Some(be_u16(value)?),
                tag::CHANGE => md.change = Some(AccessCondition::decode(value)?),
                tag::READ => md.read = Some(AccessCondition::decode(value)?),
                tag::EXECUTE => md.execute = Some(AccessCondition::decode(value)?),
                tag::DATA_TYPE => {
                    md.data_type = Some(
                        DataObjectType::from_u8(single_byte(value)?)
                            .ok_or(SdcleError::SE_METADATA_MALFORMED)?,
                    )
                }
                // Unknown tags are skipped.
                _ => {}
            }
            rest = &tail[len..];
        }
        if !rest.is_empty() {
            return Err(SdcleError::SE_METADATA_MALFORMED);
        }
        Ok(md)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(v) = self.lcso {
            body.extend_from_slice(&[tag::LCSO, 1, v]);
        }
        for (t, v) in [
            (tag::VERSION, self.version),
            (tag::MAX_SIZE, self.max_size),
            (tag::USED_SIZE, self.used_size),
        ] {
            if let Some(v) = v {
                body.extend_from_slice(&[t, 2]);
                body.extend_from_slice(&v.to_be_bytes());
            }
        }
        for (t, ac) in [
            (tag::CHANGE, &self.change),
            (tag::READ, &self.read),
            (tag::EXECUTE, &self.execute),
        ] {
            if let Some(ac) = ac {
                let mut value = Vec::new();
                ac.encode(&mut value);
                body.push(t);
                body.push(value.len() as u8);
                body.extend_from_slice(&value);
            }
        }
        if let Some(ty) = self.data_type {
            body.extend_from_slice(&[tag::DATA_TYPE, 1, ty.to_u8()]);
        }

        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(tag::CONTAINER);
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
        out
    }

    /// Apply the tags present in `update` on top of `self`.
    pub fn merge(&mut self, update: &Metadata) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        take(&mut self.lcso, &update.lcso);
        take(&mut self.version, &update.version);
        take(&mut self.max_size, &update.max_size);
        take(&mut self.used_size, &update.used_size);
        take(&mut self.change, &update.change);
        take(&mut self.read, &update.read);
        take(&mut self.execute, &update.execute);
        take(&mut self.data_type, &update.data_type);
    }
}

fn single_byte(value: &[u8]) -> SdcleResult<u8> {
    match value {
        [v] => Ok(*v),
        _ => Err(SdcleError::SE_METADATA_MALFORMED),
    }
}

fn be_u16(value: &[u8]) -> SdcleResult<u16> {
    match value {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(SdcleError::SE_METADATA_MALFORMED),
    }
}
