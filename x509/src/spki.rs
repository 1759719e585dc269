/*++

Licensed under the Apache-2.0 license.

File Name:

    spki.rs

Abstract:

    SubjectPublicKeyInfo for uncompressed P-256 points.

--*/

use crate::der_helper::{self, tag, DerWriter};
use crate::oids;
use sdcle_error::{SdcleError, SdcleResult};

/// `0x04 || X || Y`
pub const P256_POINT_LEN: usize = 65;

/// Length of the DER SubjectPublicKeyInfo of a P-256 key.
pub const P256_SPKI_LEN: usize = 91;

pub(crate) fn encode_spki(w: &mut DerWriter, point: &[u8; P256_POINT_LEN]) -> SdcleResult<()> {
    w.nested(tag::SEQUENCE, |w| {
        w.nested(tag::SEQUENCE, |w| {
            w.tlv(tag::OID, oids::EC_PUBLIC_KEY)?;
            w.tlv(tag::OID, oids::PRIME256V1)
        })?;
        w.header(tag::BIT_STRING, P256_POINT_LEN + 1)?;
        w.raw(&[0x00])?;
        w.raw(point)
    })
}

/// Wrap an uncompressed point into a DER SubjectPublicKeyInfo.
pub fn spki_from_point(point: &[u8; P256_POINT_LEN]) -> [u8; P256_SPKI_LEN] {
    let mut out = [0u8; P256_SPKI_LEN];
    let mut w = DerWriter::exact(&mut out);
    // Fixed size structure that always fits
    let _ = encode_spki(&mut w, point);
    out
}

fn point_from_slice(bytes: &[u8]) -> SdcleResult<[u8; P256_POINT_LEN]> {
    if bytes.len() != P256_POINT_LEN || bytes[0] != 0x04 {
        return Err(SdcleError::X509_INVALID_PUBLIC_KEY);
    }
    let mut point = [0u8; P256_POINT_LEN];
    point.copy_from_slice(bytes);
    Ok(point)
}

/// Extract the point from a key generation result.
///
/// The secure element returns the public key as a BIT STRING TLV
/// (`03 42 00 04 X Y`); a bare 65 byte point is accepted as well.
pub fn point_from_bit_string(bytes: &[u8]) -> SdcleResult<[u8; P256_POINT_LEN]> {
    if bytes.len() == P256_POINT_LEN {
        return point_from_slice(bytes);
    }
    let (value, rest) = der_helper::expect_tlv(bytes, tag::BIT_STRING)
        .map_err(|_| SdcleError::X509_INVALID_PUBLIC_KEY)?;
    match value.split_first() {
        Some((0, point)) if rest.is_empty() => point_from_slice(point),
        _ => Err(SdcleError::X509_INVALID_PUBLIC_KEY),
    }
}

/// Extract the point from a DER SubjectPublicKeyInfo.
pub fn point_from_spki(spki: &[u8]) -> SdcleResult<[u8; P256_POINT_LEN]> {
    let map = |_| SdcleError::X509_INVALID_PUBLIC_KEY;
    let (seq, _) = der_helper::expect_tlv(spki, tag::SEQUENCE).map_err(map)?;
    let (alg, rest) = der_helper::expect_tlv(seq, tag::SEQUENCE).map_err(map)?;
    let (alg_oid, params) = der_helper::expect_tlv(alg, tag::OID).map_err(map)?;
    let (curve, _) = der_helper::expect_tlv(params, tag::OID).map_err(map)?;
    if alg_oid != oids::EC_PUBLIC_KEY || curve != oids::PRIME256V1 {
        return Err(SdcleError::X509_INVALID_PUBLIC_KEY);
    }
    point_from_bit_string(rest)
}
