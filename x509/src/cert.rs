/*++

Licensed under the Apache-2.0 license.

File Name:

    cert.rs

Abstract:

    X.509 read side: subject and issuer common names, validity window,
    serial number and public key of a DER certificate.

--*/

use crate::der_helper::{self, tag};
use crate::oids;
use crate::spki::{self, P256_POINT_LEN};
use chrono::NaiveDate;
use sdcle_error::{SdcleError, SdcleResult};
use x509_parser::prelude::{FromDer, X509Certificate};

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject_cn: String,
    pub issuer_cn: String,
    /// Seconds since the Unix epoch.
    pub not_before: i64,
    /// Seconds since the Unix epoch.
    pub not_after: i64,
    pub serial: Vec<u8>,
    pub public_key: Option<[u8; P256_POINT_LEN]>,
}

impl CertificateInfo {
    /// Parse a DER certificate.
    ///
    /// x509-parser is tried first. When it rejects the input the minimal
    /// walker below extracts the same fields.
    pub fn parse(der: &[u8]) -> SdcleResult<Self> {
        match Self::parse_full(der) {
            Some(info) => Ok(info),
            None => Self::parse_minimal(der),
        }
    }

    fn parse_full(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der).ok()?;
        let cn = |name: &x509_parser::x509::X509Name| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let public_key = cert.public_key();
        let point = spki::point_from_spki(public_key.raw).ok();
        Some(Self {
            subject_cn: cn(cert.subject()),
            issuer_cn: cn(cert.issuer()),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            serial: cert.raw_serial().to_vec(),
            public_key: point,
        })
    }

    /// Walk the TBSCertificate by hand.
    pub fn parse_minimal(der: &[u8]) -> SdcleResult<Self> {
        let (cert, _) = der_helper::expect_tlv(der, tag::SEQUENCE)?;
        let (tbs, _) = der_helper::expect_tlv(cert, tag::SEQUENCE)?;

        let mut fields = tbs;
        let (first, rest) = der_helper::read_tlv(fields)?;
        if first.tag == tag::CONTEXT_0 {
            fields = rest;
        }
        let (serial, rest) = der_helper::expect_tlv(fields, tag::INTEGER)?;
        let (_sig_alg, rest) = der_helper::expect_tlv(rest, tag::SEQUENCE)?;
        let (issuer, rest) = der_helper::expect_tlv(rest, tag::SEQUENCE)?;
        let (validity, rest) = der_helper::expect_tlv(rest, tag::SEQUENCE)?;
        let (subject, rest) = der_helper::expect_tlv(rest, tag::SEQUENCE)?;
        let (_, after_spki) = der_helper::expect_tlv(rest, tag::SEQUENCE)?;
        let spki_der = &rest[..rest.len() - after_spki.len()];

        let (not_before, validity_rest) = der_helper::read_tlv(validity)?;
        let (not_after, _) = der_helper::read_tlv(validity_rest)?;
        let public_key = spki::point_from_spki(spki_der).ok();

        Ok(Self {
            subject_cn: common_name(subject)?.unwrap_or_default(),
            issuer_cn: common_name(issuer)?.unwrap_or_default(),
            not_before: parse_time(not_before.tag, not_before.value)?,
            not_after: parse_time(not_after.tag, not_after.value)?,
            serial: serial.to_vec(),
            public_key,
        })
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whole days left before `not_after`, clamped at zero.
    pub fn days_until_expiry(&self, now: i64) -> i64 {
        (self.not_after - now).max(0).div_euclid(SECONDS_PER_DAY)
    }
}

/// First commonName attribute in a Name.
fn common_name(name: &[u8]) -> SdcleResult<Option<String>> {
    let mut rdns = name;
    while !rdns.is_empty() {
        let (set, rest) = der_helper::expect_tlv(rdns, tag::SET)?;
        rdns = rest;
        let mut atvs = set;
        while !atvs.is_empty() {
            let (atv, rest) = der_helper::expect_tlv(atvs, tag::SEQUENCE)?;
            atvs = rest;
            let (oid, value) = der_helper::expect_tlv(atv, tag::OID)?;
            if oid != oids::COMMON_NAME {
                continue;
            }
            let (value, _) = der_helper::read_tlv(value)?;
            return match value.tag {
                tag::UTF8_STRING
                | tag::PRINTABLE_STRING
                | tag::IA5_STRING
                | tag::T61_STRING => Ok(Some(String::from_utf8_lossy(value.value).into_owned())),
                _ => Err(SdcleError::X509_MALFORMED),
            };
        }
    }
    Ok(None)
}

fn digits(bytes: &[u8]) -> SdcleResult<i64> {
    bytes.iter().try_fold(0i64, |acc, &b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + i64::from(b - b'0'))
        } else {
            Err(SdcleError::X509_MALFORMED)
        }
    })
}

/// Parse a UTCTime (`YYMMDDHHMMSSZ`) or GeneralizedTime
/// (`YYYYMMDDHHMMSSZ`) into Unix seconds.
pub fn parse_time(time_tag: u8, value: &[u8]) -> SdcleResult<i64> {
    let (year, rest) = match (time_tag, value.len()) {
        (tag::UTC_TIME, 13) => {
            let yy = digits(&value[..2])?;
            // Two digit years pivot at 1950
            (if yy < 50 { 2000 + yy } else { 1900 + yy }, &value[2..])
        }
        (tag::GENERALIZED_TIME, 15) => (digits(&value[..4])?, &value[4..]),
        _ => return Err(SdcleError::X509_MALFORMED),
    };
    if rest[10] != b'Z' {
        return Err(SdcleError::X509_MALFORMED);
    }

    let date = |r: std::ops::Range<usize>| -> SdcleResult<u32> {
        u32::try_from(digits(&rest[r])?).map_err(|_| SdcleError::X509_MALFORMED)
    };
    let year = i32::try_from(year).map_err(|_| SdcleError::X509_MALFORMED)?;
    NaiveDate::from_ymd_opt(year, date(0..2)?, date(2..4)?)
        .and_then(|d| d.and_hms_opt(date(4..6).ok()?, date(6..8).ok()?, date(8..10).ok()?))
        .map(|dt| dt.and_utc().timestamp())
        .ok_or(SdcleError::X509_MALFORMED)
}
