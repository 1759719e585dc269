/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the SDCLE secure element emulator.

--*/

mod emulated_se;
mod manifest;
mod object;
mod platform;

pub use emulated_se::{EmulatedSe, JournalEntry};
pub use manifest::{decrypt_fragment, derive_fragment_key, encrypt_fragment, UpdateManifest};
pub use object::FactoryProfile;
pub use platform::{BundleParams, PlatformCa, PlatformError, PlatformResult};
