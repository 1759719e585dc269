/*++

Licensed under the Apache-2.0 license.

File Name:

    oids.rs

Abstract:

    DER encoded object identifiers (content octets only).

--*/

/// ecdsa-with-SHA256 (1.2.840.10045.4.3.2)
pub const ECDSA_WITH_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];

/// id-ecPublicKey (1.2.840.10045.2.1)
pub const EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];

/// prime256v1 (1.2.840.10045.3.1.7)
pub const PRIME256V1: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];

/// id-at-commonName (2.5.4.3)
pub const COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// id-at-organizationName (2.5.4.10)
pub const ORGANIZATION_NAME: &[u8] = &[0x55, 0x04, 0x0A];
