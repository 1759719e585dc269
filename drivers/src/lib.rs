/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the secure element access layer.

--*/

mod async_bridge;
pub mod metadata;
pub mod printer;
pub mod se;
mod se_manager;
pub mod wait;

pub use async_bridge::{AsyncBridge, BridgeTimeouts};
pub use metadata::{AccessCondition, Condition, DataObjectType, Metadata};
pub use se::{
    lcso, oid, status, AesKeySize, Completion, EccCurve, SeCommand, SeKeyUsage, SecureElement,
    WriteMode,
};
pub use se_manager::{CryptSession, SeGuard, SeInstanceManager, SeManagerConfig};
