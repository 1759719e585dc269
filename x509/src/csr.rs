/*++

Licensed under the Apache-2.0 license.

File Name:

    csr.rs

Abstract:

    PKCS#10 Certificate Signing Request builder for P-256 device keys.

--*/

use crate::der_helper::{tag, DerWriter};
use crate::oids;
use crate::pem::{self, PemLabel};
use crate::signature::EcdsaP256Signature;
use crate::spki::{self, P256_POINT_LEN};
use sdcle_error::{SdcleError, SdcleResult};

/// Worst case DER size of a P-256 CSR with a CN and O subject.
pub const MAX_CSR_DER_LEN: usize = 512;

/// Worst case PEM size of [`MAX_CSR_DER_LEN`] bytes of DER.
pub const MAX_CSR_PEM_LEN: usize = 800;

/// Distinguished name of the request, parsed from `"CN=...,O=..."`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrSubject<'a> {
    pub common_name: Option<&'a str>,
    pub organization: Option<&'a str>,
}

impl<'a> CsrSubject<'a> {
    /// Parse a comma separated subject string.
    ///
    /// Components other than `CN=` and `O=` are ignored. A string with
    /// neither component is taken as the organization name as a whole.
    pub fn parse(subject: &'a str) -> SdcleResult<Self> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(SdcleError::X509_INVALID_SUBJECT);
        }

        let mut result = Self {
            common_name: None,
            organization: None,
        };
        for part in subject.split(',').map(str::trim) {
            if let Some(cn) = part.strip_prefix("CN=") {
                result.common_name = Some(cn);
            } else if let Some(o) = part.strip_prefix("O=") {
                result.organization = Some(o);
            }
        }

        if result.common_name.is_none() && result.organization.is_none() {
            result.organization = Some(subject);
        }
        Ok(result)
    }

    fn encode_rdn(w: &mut DerWriter, oid: &[u8], value: &str) -> SdcleResult<()> {
        w.nested(tag::SET, |w| {
            w.nested(tag::SEQUENCE, |w| {
                w.tlv(tag::OID, oid)?;
                w.tlv(tag::UTF8_STRING, value.as_bytes())
            })
        })
    }

    fn encode(&self, w: &mut DerWriter) -> SdcleResult<()> {
        w.nested(tag::SEQUENCE, |w| {
            if let Some(cn) = self.common_name {
                Self::encode_rdn(w, oids::COMMON_NAME, cn)?;
            }
            if let Some(o) = self.organization {
                Self::encode_rdn(w, oids::ORGANIZATION_NAME, o)?;
            }
            Ok(())
        })
    }
}

/// Builds `CertificationRequestInfo` and the signed `CertificationRequest`.
#[derive(Debug)]
pub struct CsrBuilder<'a> {
    subject: CsrSubject<'a>,
    public_key: [u8; P256_POINT_LEN],
}

impl<'a> CsrBuilder<'a> {
    /// Create an instance of `CsrBuilder`
    ///
    /// # Arguments
    ///
    /// * `subject` - Subject string such as `"CN=<uid>,O=TESAIoT"`
    /// * `public_key` - Uncompressed P-256 point
    pub fn new(subject: &'a str, public_key: &[u8; P256_POINT_LEN]) -> SdcleResult<Self> {
        Ok(Self {
            subject: CsrSubject::parse(subject)?,
            public_key: *public_key,
        })
    }

    pub fn subject(&self) -> &CsrSubject<'a> {
        &self.subject
    }

    fn write_cri(&self, w: &mut DerWriter) -> SdcleResult<()> {
        w.nested(tag::SEQUENCE, |w| {
            w.uint(&[0])?;
            self.subject.encode(w)?;
            spki::encode_spki(w, &self.public_key)?;
            // Empty attributes
            w.raw(&[tag::CONTEXT_0, 0x00])
        })
    }

    /// Length of the encoded `CertificationRequestInfo`.
    pub fn cri_len(&self) -> SdcleResult<usize> {
        let mut w = DerWriter::measure();
        self.write_cri(&mut w)?;
        Ok(w.len())
    }

    /// Encode the `CertificationRequestInfo` (the signed portion).
    pub fn encode_cri(&self, buf: &mut [u8]) -> SdcleResult<usize> {
        let mut w = DerWriter::exact(buf);
        self.write_cri(&mut w)?;
        Ok(w.len())
    }

    fn write_csr(w: &mut DerWriter, cri: &[u8], sig: &EcdsaP256Signature) -> SdcleResult<()> {
        let sig_len = sig.der_len();
        w.nested(tag::SEQUENCE, |w| {
            w.raw(cri)?;
            w.nested(tag::SEQUENCE, |w| w.tlv(tag::OID, oids::ECDSA_WITH_SHA256))?;
            w.header(tag::BIT_STRING, sig_len + 1)?;
            w.raw(&[0x00])?;
            w.raw(&sig.to_der_vec())
        })
    }

    /// Length of the signed request for a given CRI and signature.
    pub fn csr_len(cri: &[u8], sig: &EcdsaP256Signature) -> SdcleResult<usize> {
        let mut w = DerWriter::measure();
        Self::write_csr(&mut w, cri, sig)?;
        Ok(w.len())
    }

    /// Wrap `cri` and its signature into a `CertificationRequest`.
    pub fn encode_csr(
        cri: &[u8],
        sig: &EcdsaP256Signature,
        buf: &mut [u8],
    ) -> SdcleResult<usize> {
        let mut w = DerWriter::exact(buf);
        Self::write_csr(&mut w, cri, sig)?;
        Ok(w.len())
    }
}

/// Scratch buffers for one CSR build.
///
/// Only one request is in flight at a time, so a single instance is owned
/// by the CSR workflow and reused.
pub struct CsrScratch {
    der: [u8; MAX_CSR_DER_LEN],
    der_len: usize,
    pem: [u8; MAX_CSR_PEM_LEN],
    pem_len: usize,
}

impl Default for CsrScratch {
    fn default() -> Self {
        Self {
            der: [0u8; MAX_CSR_DER_LEN],
            der_len: 0,
            pem: [0u8; MAX_CSR_PEM_LEN],
            pem_len: 0,
        }
    }
}

impl CsrScratch {
    /// Build the signed request and its PEM armor.
    ///
    /// `sign` receives the encoded `CertificationRequestInfo` and returns
    /// its ECDSA signature.
    pub fn build<F>(&mut self, builder: &CsrBuilder, mut sign: F) -> SdcleResult<()>
    where
        F: FnMut(&[u8]) -> SdcleResult<EcdsaP256Signature>,
    {
        self.der_len = 0;
        self.pem_len = 0;

        let mut cri = [0u8; MAX_CSR_DER_LEN];
        let cri_len = builder.encode_cri(&mut cri)?;
        let sig = sign(&cri[..cri_len])?;

        self.der_len = CsrBuilder::encode_csr(&cri[..cri_len], &sig, &mut self.der)?;
        self.pem_len = pem::encode(
            PemLabel::CertificateRequest,
            &self.der[..self.der_len],
            &mut self.pem,
        )
        .map_err(|_| SdcleError::PEM_BUFFER_TOO_SMALL)?;
        Ok(())
    }

    pub fn der(&self) -> &[u8] {
        &self.der[..self.der_len]
    }

    pub fn pem(&self) -> &str {
        core::str::from_utf8(&self.pem[..self.pem_len]).unwrap_or("")
    }
}
