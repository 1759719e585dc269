/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the SDCLE runtime library and the subscriber
    command handling logic.

--*/
mod ack;
pub mod clock;
pub mod config;
mod crypto;
mod csr_workflow;
mod drivers;
mod health;
pub mod identity;
mod license;
pub mod mqtt;
mod platform;
mod protected_update;
pub mod psa;
mod router;
mod selector;
mod session;
mod subscriber;

pub use ack::{oid_string, InstallAck, Workflow};
pub use clock::{iso8601_millis, Clock, ManualClock, SystemClock, MIN_SYNCED_UNIX_TIME};
pub use config::SdcleConfig;
pub use crypto::{
    store_slot, CryptoFacade, AES_BLOCK_LEN, COUNTER_NVM_WRITE_BUDGET, HKDF_MAX_LEN,
    MONOTONIC_COUNTERS, RANDOM_MAX_LEN, RANDOM_MIN_LEN, RESERVED_STORE_SLOT, SECURE_STORE_SLOTS,
};
pub use csr_workflow::{
    install_certificate, validate_certificate, CertificateMessage, CsrState, CsrTransaction,
    CsrWorkflowCmd, CSR_KEY_OID,
};
pub use drivers::Drivers;
pub use health::HealthReport;
pub use license::{LicenseGate, LicenseStatus, SDCLE_VERSION};
pub use mqtt::{MqttClient, QoS, Topics};
pub use platform::{PlatformCertStatus, PlatformRequest, PlatformRequestCmd};
pub use protected_update::{
    DecodedBundle, ProtectedUpdateCmd, UpdateBundle, UpdateOutcome, UpdateState,
    UpdateTransaction, MANIFEST_VERSION, MAX_FRAGMENTS,
};
pub use psa::{KeyAttributes, PsaDriver};
pub use router::{
    subscriber_queue, MqttRouter, RouterCounters, RouterStats, SubscriberCommand,
    SubscriberHandle, SubscriberMessage,
};
pub use selector::{
    key_oid_for, CertRecord, CertSelector, CertValidityReport, FACTORY_CERT_OID, PRIMARY_CERT_OID,
};
pub use session::{SessionCmd, SessionFlags};
pub use subscriber::{Inbox, UpdateCertificateCmd};

use sdcle_drivers::cprintln;
use sdcle_error::SdcleResult;

/// Handles one subscriber command
///
/// # Arguments
///
/// * `drivers` - Subscriber task state
/// * `msg` - Command dequeued from the subscriber queue
///
/// # Returns
///
/// * `SdcleResult<()>` - Error of the command's workflow, if any
pub fn handle_command(drivers: &mut Drivers, msg: SubscriberMessage) -> SdcleResult<()> {
    match msg.cmd {
        SubscriberCommand::SubscribeToTopic => drivers
            .mqtt
            .subscribe(&drivers.topics.commands, QoS::AtLeastOnce),
        SubscriberCommand::UnsubscribeFromTopic => {
            drivers.mqtt.unsubscribe(&drivers.topics.commands)
        }
        SubscriberCommand::UpdateDeviceCertificates => {
            UpdateCertificateCmd::execute(drivers, &msg.payload).map(|_| ())
        }
        SubscriberCommand::UpdateProtectedUpdateBundle => {
            ProtectedUpdateCmd::execute(drivers, &msg.payload).map(|_| ())
        }
        SubscriberCommand::CheckCertificateResponse => {
            drivers.platform.record(PlatformRequest::Check, &msg.payload);
            Ok(())
        }
        SubscriberCommand::UploadCertificateResponse => {
            drivers.platform.record(PlatformRequest::Upload, &msg.payload);
            Ok(())
        }
        SubscriberCommand::SyncCertificateResponse => {
            drivers.platform.record(PlatformRequest::Sync, &msg.payload);
            Ok(())
        }
    }
}

/// Handle one command and log its failure. Workflows report failures to the
/// platform themselves, so nothing is returned.
pub fn dispatch(drivers: &mut Drivers, msg: SubscriberMessage) {
    let cmd = msg.cmd;
    if let Err(err) = handle_command(drivers, msg) {
        cprintln!(
            "[sub] {} failed: 0x{:08X}",
            cmd.as_str(),
            u32::from(err)
        );
    }
}

/// Handle every queued command without blocking.
///
/// # Returns
///
/// * Number of commands handled
pub fn process_pending(drivers: &mut Drivers) -> usize {
    let mut handled = 0;
    while let Some(msg) = drivers.inbox.try_next() {
        dispatch(drivers, msg);
        handled += 1;
    }
    handled
}
