/*++

Licensed under the Apache-2.0 license.

File Name:

    platform.rs

Abstract:

    Platform side of the certificate lifecycle: a P-256 device CA that
    issues certificates from CSRs, and the update signer that builds
    protected update bundles.

--*/

use crate::manifest::{self, UpdateManifest};
use crate::object::FactoryProfile;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use coset::{iana, CborSerializable, CoseError, CoseSign1Builder, HeaderBuilder};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, BigNumContext, MsbOption};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sha::sha256;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509Req, X509};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sdcle_drivers::oid;
use serde_json::{json, Value};

#[derive(Debug)]
pub enum PlatformError {
    Openssl(ErrorStack),
    CsrSignature,
    Cose(CoseError),
}

impl From<ErrorStack> for PlatformError {
    fn from(err: ErrorStack) -> Self {
        PlatformError::Openssl(err)
    }
}

impl From<CoseError> for PlatformError {
    fn from(err: CoseError) -> Self {
        PlatformError::Cose(err)
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Inputs of one protected update bundle.
pub struct BundleParams<'a> {
    pub certificate_der: &'a [u8],
    pub target_oid: u16,
    pub shared_secret: &'a [u8],
    pub new_version: u16,
    pub correlation_id: &'a str,
    /// Number of `fragment_N` fields the ciphertext is split across.
    pub fragment_count: usize,
}

fn name(common_name: &str, organization: &str) -> Result<X509Name, ErrorStack> {
    let mut b = X509NameBuilder::new()?;
    b.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    b.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
    Ok(b.build())
}

fn p256_group() -> Result<EcGroup, ErrorStack> {
    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
}

fn self_signed(key: &PKey<Private>, common_name: &str) -> Result<X509, ErrorStack> {
    let subject = name(common_name, "TESAIoT")?;
    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial = BigNum::from_u32(1)?;
    b.set_serial_number(&*Asn1Integer::from_bn(&serial)?)?;
    b.set_subject_name(&subject)?;
    b.set_issuer_name(&subject)?;
    b.set_not_before(&*Asn1Time::from_unix(0)?)?;
    b.set_not_after(&*Asn1Time::from_str("20491231235959Z")?)?;
    b.set_pubkey(key)?;
    b.sign(key, MessageDigest::sha256())?;
    Ok(b.build())
}

pub struct PlatformCa {
    ca_key: PKey<Private>,
    ca_cert: X509,
    update_key: EcKey<Private>,
    update_cert: X509,
}

impl PlatformCa {
    pub fn new() -> PlatformResult<Self> {
        let group = p256_group()?;
        let ca_key = PKey::from_ec_key(EcKey::generate(&group)?)?;
        let ca_cert = self_signed(&ca_key, "TESAIoT Device CA")?;
        let update_key = EcKey::generate(&group)?;
        let update_cert = self_signed(
            &PKey::from_ec_key(update_key.clone())?,
            "TESAIoT Update Signer",
        )?;
        Ok(Self {
            ca_key,
            ca_cert,
            update_key,
            update_cert,
        })
    }

    pub fn ca_certificate_der(&self) -> PlatformResult<Vec<u8>> {
        Ok(self.ca_cert.to_der()?)
    }

    /// Certificate whose key signs update manifests.
    pub fn signing_certificate_der(&self) -> PlatformResult<Vec<u8>> {
        Ok(self.update_cert.to_der()?)
    }

    /// Issue a certificate for an uncompressed P-256 point.
    pub fn issue_certificate(
        &self,
        common_name: &str,
        point: &[u8],
        not_before: i64,
        not_after: i64,
    ) -> PlatformResult<Vec<u8>> {
        let group = p256_group()?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, point, &mut ctx)?;
        let key = PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?;

        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

        let mut b = X509Builder::new()?;
        b.set_version(2)?;
        b.set_serial_number(&*Asn1Integer::from_bn(&serial)?)?;
        b.set_subject_name(&*name(common_name, "TESAIoT")?)?;
        b.set_issuer_name(self.ca_cert.subject_name())?;
        b.set_not_before(&*Asn1Time::from_unix(not_before)?)?;
        b.set_not_after(&*Asn1Time::from_unix(not_after)?)?;
        b.set_pubkey(&key)?;
        b.sign(&self.ca_key, MessageDigest::sha256())?;
        Ok(b.build().to_der()?)
    }

    /// Verify a PEM or DER CSR and issue a certificate for its key and CN.
    pub fn issue_from_csr(
        &self,
        csr: &[u8],
        not_before: i64,
        not_after: i64,
    ) -> PlatformResult<Vec<u8>> {
        let req = if csr.first() == Some(&0x30) {
            X509Req::from_der(csr)?
        } else {
            X509Req::from_pem(csr)?
        };
        let public_key = req.public_key()?;
        if !req.verify(&public_key)? {
            return Err(PlatformError::CsrSignature);
        }

        let common_name = req
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let group = p256_group()?;
        let mut ctx = BigNumContext::new()?;
        let point = public_key.ec_key()?.public_key().to_bytes(
            &group,
            openssl::ec::PointConversionForm::UNCOMPRESSED,
            &mut ctx,
        )?;
        self.issue_certificate(&common_name, &point, not_before, not_after)
    }

    /// Factory contents with a certificate issued for the factory key.
    pub fn factory_profile(
        &self,
        uid: [u8; oid::FACTORY_UID_LEN],
        not_before: i64,
        not_after: i64,
    ) -> PlatformResult<FactoryProfile> {
        let mut profile = FactoryProfile::random();
        profile.uid = uid;
        let point = profile.factory_key.public_key().to_encoded_point(false);
        let uid_hex: String = uid.iter().map(|b| format!("{b:02X}")).collect();
        profile.factory_cert =
            self.issue_certificate(&uid_hex, point.as_bytes(), not_before, not_after)?;
        Ok(profile)
    }

    /// COSE_Sign1 (ES256) over the manifest payload.
    pub fn sign_manifest(&self, manifest: &UpdateManifest) -> PlatformResult<Vec<u8>> {
        let mut failure = None;
        let sign1 = CoseSign1Builder::new()
            .protected(HeaderBuilder::new().algorithm(iana::Algorithm::ES256).build())
            .payload(manifest.to_cbor())
            .create_signature(b"", |data| match self.sign_raw(data) {
                Ok(sig) => sig,
                Err(err) => {
                    failure = Some(err);
                    Vec::new()
                }
            })
            .build();
        if let Some(err) = failure {
            return Err(err.into());
        }
        Ok(sign1.to_vec()?)
    }

    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let sig = EcdsaSig::sign(&sha256(data), &self.update_key)?;
        let mut raw = sig.r().to_vec_padded(32)?;
        raw.extend_from_slice(&sig.s().to_vec_padded(32)?);
        Ok(raw)
    }

    /// Build the JSON bundle delivered on `commands/protected_update`.
    pub fn update_bundle(&self, params: &BundleParams) -> PlatformResult<Value> {
        let fragment = manifest::encrypt_fragment(
            params.shared_secret,
            params.target_oid,
            params.certificate_der,
        );
        let m = UpdateManifest::for_fragment(
            oid::TRUST_ANCHOR,
            params.target_oid,
            oid::UPDATE_SHARED_SECRET,
            &fragment,
            params.new_version,
        );

        let mut bundle = json!({
            "signing_certificate": STANDARD.encode(self.signing_certificate_der()?),
            "manifest": STANDARD.encode(self.sign_manifest(&m)?),
            "fragment_count": params.fragment_count,
            "correlation_id": params.correlation_id,
        });

        let count = params.fragment_count.max(1);
        let chunk = fragment.len().div_ceil(count).max(1);
        for i in 0..count {
            let start = (i * chunk).min(fragment.len());
            let end = ((i + 1) * chunk).min(fragment.len());
            bundle[format!("fragment_{i}")] = Value::from(STANDARD.encode(&fragment[start..end]));
        }
        Ok(bundle)
    }
}
