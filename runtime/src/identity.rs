/*++

Licensed under the Apache-2.0 license.

File Name:

    identity.rs

Abstract:

    File contains the factory identity helpers: factory UID, factory
    certificate and lifecycle diagnostics.

--*/

use sdcle_drivers::{cprintln, oid, SeInstanceManager};
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::{pem, PemLabel};

pub fn read_factory_uid(se: &SeInstanceManager) -> SdcleResult<[u8; oid::FACTORY_UID_LEN]> {
    let uid = se.acquire()?.read_data(oid::FACTORY_UID)?;
    uid.as_slice().try_into().map_err(|_| {
        cprintln!("[se] Factory UID has unexpected length {}", uid.len());
        SdcleError::SE_INVALID_RESPONSE
    })
}

/// Factory UID as 54 uppercase hex characters.
pub fn factory_uid_hex(se: &SeInstanceManager) -> SdcleResult<String> {
    Ok(hex::encode_upper(read_factory_uid(se)?))
}

pub fn read_factory_certificate_der(se: &SeInstanceManager) -> SdcleResult<Vec<u8>> {
    let der = se.acquire()?.read_data(oid::FACTORY_CERT)?;
    if der.is_empty() {
        return Err(SdcleError::CERT_EMPTY_PAYLOAD);
    }
    Ok(der)
}

pub fn read_factory_certificate_pem(se: &SeInstanceManager) -> SdcleResult<String> {
    let der = read_factory_certificate_der(se)?;
    Ok(pem::encode_to_string(PemLabel::Certificate, &der))
}

/// Lifecycle state of `oid`. Objects that report no `C0` tag are still in
/// the creation state.
pub fn read_lcso(se: &SeInstanceManager, oid: u16) -> SdcleResult<u8> {
    Ok(se
        .acquire()?
        .lcso(oid)?
        .unwrap_or(sdcle_drivers::lcso::CREATION))
}

/// Global lifecycle state stored in `0xE0C0`.
pub fn read_global_lifecycle(se: &SeInstanceManager) -> SdcleResult<u8> {
    let data = se.acquire()?.read_data(oid::GLOBAL_LIFECYCLE)?;
    data.first()
        .copied()
        .ok_or(SdcleError::SE_INVALID_RESPONSE)
}
