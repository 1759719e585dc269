/*++

Licensed under the Apache-2.0 license.

File Name:

    pem.rs

Abstract:

    PEM armor for certificates and certificate signing requests.

--*/

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sdcle_error::{SdcleError, SdcleResult};

const LINE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemLabel {
    Certificate,
    CertificateRequest,
}

impl PemLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PemLabel::Certificate => "CERTIFICATE",
            PemLabel::CertificateRequest => "CERTIFICATE REQUEST",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "CERTIFICATE" => Some(PemLabel::Certificate),
            "CERTIFICATE REQUEST" => Some(PemLabel::CertificateRequest),
            _ => None,
        }
    }
}

fn begin_len(label: PemLabel) -> usize {
    "-----BEGIN -----\n".len() + label.as_str().len()
}

fn end_len(label: PemLabel) -> usize {
    "-----END -----\n".len() + label.as_str().len()
}

/// Size of the PEM encoding of `der_len` bytes.
pub fn encoded_len(label: PemLabel, der_len: usize) -> usize {
    let b64_len = der_len.div_ceil(3) * 4;
    let lines = b64_len.div_ceil(LINE_LEN);
    begin_len(label) + b64_len + lines + end_len(label)
}

/// Armor `der` into `buf` with 64 character lines.
///
/// # Returns
///
/// * Number of bytes written, or `PEM_BUFFER_TOO_SMALL`
pub fn encode(label: PemLabel, der: &[u8], buf: &mut [u8]) -> SdcleResult<usize> {
    if buf.len() < encoded_len(label, der.len()) {
        return Err(SdcleError::PEM_BUFFER_TOO_SMALL);
    }

    let b64 = STANDARD.encode(der);
    let mut pos = 0;
    let mut put = |bytes: &[u8]| {
        buf[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += bytes.len();
    };

    put(b"-----BEGIN ");
    put(label.as_str().as_bytes());
    put(b"-----\n");
    for line in b64.as_bytes().chunks(LINE_LEN) {
        put(line);
        put(b"\n");
    }
    put(b"-----END ");
    put(label.as_str().as_bytes());
    put(b"-----\n");

    Ok(pos)
}

pub fn encode_to_string(label: PemLabel, der: &[u8]) -> String {
    let mut buf = vec![0u8; encoded_len(label, der.len())];
    let len = encode(label, der, &mut buf).unwrap_or(0);
    buf.truncate(len);
    String::from_utf8(buf).unwrap_or_default()
}

/// Strip the armor of the first PEM block in `pem`.
pub fn decode(pem: &str) -> SdcleResult<(PemLabel, Vec<u8>)> {
    let start = pem.find("-----BEGIN ").ok_or(SdcleError::PEM_MALFORMED)?;
    let rest = &pem[start + "-----BEGIN ".len()..];
    let label_end = rest.find("-----").ok_or(SdcleError::PEM_MALFORMED)?;
    let label = PemLabel::from_label(&rest[..label_end]).ok_or(SdcleError::PEM_MALFORMED)?;

    let body = &rest[label_end + "-----".len()..];
    let footer = format!("-----END {}-----", label.as_str());
    let body_end = body.find(&footer).ok_or(SdcleError::PEM_MALFORMED)?;

    let b64: String = body[..body_end]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let der = STANDARD
        .decode(b64)
        .map_err(|_| SdcleError::PEM_MALFORMED)?;
    Ok((label, der))
}

/// Accept a certificate as either DER or PEM bytes and return DER.
pub fn certificate_der(bytes: &[u8]) -> SdcleResult<Vec<u8>> {
    match bytes.first() {
        None => Err(SdcleError::CERT_EMPTY_PAYLOAD),
        Some(0x30) => Ok(bytes.to_vec()),
        Some(_) => {
            let text = core::str::from_utf8(bytes).map_err(|_| SdcleError::PEM_MALFORMED)?;
            match decode(text)? {
                (PemLabel::Certificate, der) => Ok(der),
                _ => Err(SdcleError::PEM_MALFORMED),
            }
        }
    }
}
