/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Main entry point for SDCLE X509 related functionality

--*/

mod cert;
mod csr;
mod der_helper;
pub mod oids;
pub mod pem;
mod signature;
mod spki;

pub use cert::{parse_time, CertificateInfo, SECONDS_PER_DAY};
pub use csr::{CsrBuilder, CsrScratch, CsrSubject, MAX_CSR_DER_LEN, MAX_CSR_PEM_LEN};
pub use der_helper::{
    der_encode_len, der_encode_uint, der_len_field_size, der_uint_len, expect_tlv, read_tlv,
    tag, DerWriter, Tlv,
};
pub use pem::PemLabel;
pub use signature::{
    EcdsaP256Signature, P256_MAX_DER_SIGNATURE_LEN, P256_RAW_SIGNATURE_LEN, P256_SCALAR_LEN,
};
pub use spki::{
    point_from_bit_string, point_from_spki, spki_from_point, P256_POINT_LEN, P256_SPKI_LEN,
};
