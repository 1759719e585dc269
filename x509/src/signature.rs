/*++

Licensed under the Apache-2.0 license.

File Name:

    signature.rs

Abstract:

    ECDSA P-256 signature shapes: raw r||s, the integer pair returned by the
    secure element, and the DER SEQUENCE used in X.509 structures.

--*/

use crate::der_helper::{self, tag, DerWriter};
use sdcle_error::{SdcleError, SdcleResult};

pub const P256_SCALAR_LEN: usize = 32;
pub const P256_RAW_SIGNATURE_LEN: usize = 2 * P256_SCALAR_LEN;

/// Upper bound of the DER form: `30 46 02 21 00 r 02 21 00 s`.
pub const P256_MAX_DER_SIGNATURE_LEN: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaP256Signature {
    pub r: [u8; P256_SCALAR_LEN],
    pub s: [u8; P256_SCALAR_LEN],
}

/// Strip leading zeros from `int` and left pad it to 32 bytes.
fn scalar_from_integer(int: &[u8]) -> SdcleResult<[u8; P256_SCALAR_LEN]> {
    let start = int.iter().position(|&b| b != 0).unwrap_or(int.len());
    let trimmed = &int[start..];
    if trimmed.len() > P256_SCALAR_LEN {
        return Err(SdcleError::X509_SIGNATURE_MALFORMED);
    }
    let mut out = [0u8; P256_SCALAR_LEN];
    out[P256_SCALAR_LEN - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

impl EcdsaP256Signature {
    pub fn from_raw(raw: &[u8]) -> SdcleResult<Self> {
        if raw.len() != P256_RAW_SIGNATURE_LEN {
            return Err(SdcleError::X509_SIGNATURE_MALFORMED);
        }
        let (r_bytes, s_bytes) = raw.split_at(P256_SCALAR_LEN);
        let mut r = [0u8; P256_SCALAR_LEN];
        let mut s = [0u8; P256_SCALAR_LEN];
        r.copy_from_slice(r_bytes);
        s.copy_from_slice(s_bytes);
        Ok(Self { r, s })
    }

    pub fn to_raw(&self) -> [u8; P256_RAW_SIGNATURE_LEN] {
        let mut raw = [0u8; P256_RAW_SIGNATURE_LEN];
        raw[..P256_SCALAR_LEN].copy_from_slice(&self.r);
        raw[P256_SCALAR_LEN..].copy_from_slice(&self.s);
        raw
    }

    /// Parse the `02 len r 02 len s` pair emitted by the sign command.
    pub fn from_integer_pair(tlvs: &[u8]) -> SdcleResult<Self> {
        let map = |_| SdcleError::X509_SIGNATURE_MALFORMED;
        let (r, rest) = der_helper::expect_tlv(tlvs, tag::INTEGER).map_err(map)?;
        let (s, rest) = der_helper::expect_tlv(rest, tag::INTEGER).map_err(map)?;
        if !rest.is_empty() {
            return Err(SdcleError::X509_SIGNATURE_MALFORMED);
        }
        Ok(Self {
            r: scalar_from_integer(r)?,
            s: scalar_from_integer(s)?,
        })
    }

    /// Parse `SEQUENCE { INTEGER r, INTEGER s }`.
    pub fn from_der(der: &[u8]) -> SdcleResult<Self> {
        let (seq, rest) = der_helper::expect_tlv(der, tag::SEQUENCE)
            .map_err(|_| SdcleError::X509_SIGNATURE_MALFORMED)?;
        if !rest.is_empty() {
            return Err(SdcleError::X509_SIGNATURE_MALFORMED);
        }
        Self::from_integer_pair(seq)
    }

    fn encode_pair(&self, w: &mut DerWriter) -> SdcleResult<()> {
        w.nested(tag::SEQUENCE, |w| {
            w.uint(&self.r)?;
            w.uint(&self.s)
        })
    }

    pub fn der_len(&self) -> usize {
        let mut w = DerWriter::measure();
        // Two 35 byte integers at most, never above the short form limit
        let _ = self.encode_pair(&mut w);
        w.len()
    }

    /// Encode the DER SEQUENCE form into `buf`, returning the bytes written.
    pub fn to_der(&self, buf: &mut [u8]) -> SdcleResult<usize> {
        let mut w = DerWriter::exact(buf);
        self.encode_pair(&mut w)?;
        Ok(w.len())
    }

    pub fn to_der_vec(&self) -> Vec<u8> {
        let mut buf = [0u8; P256_MAX_DER_SIGNATURE_LEN];
        let len = self.to_der(&mut buf).unwrap_or(0);
        buf[..len].to_vec()
    }
}
