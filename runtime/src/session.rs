/*++

Licensed under the Apache-2.0 license.

File Name:

    session.rs

Abstract:

    File contains the per-session workflow flags that gate the publisher
    task and stray certificate commands, and the MQTT session bring-up.

--*/

use crate::csr_workflow::CsrWorkflowCmd;
use crate::drivers::Drivers;
use crate::router::{SubscriberCommand, SubscriberMessage};
use sdcle_drivers::cprintln;
use sdcle_drivers::printer::Oid;
use sdcle_error::{SdcleError, SdcleResult};
use std::sync::atomic::{AtomicBool, Ordering};

/// Written by the subscriber task only, read by every task.
#[derive(Debug, Default)]
pub struct SessionFlags {
    protected_update_active: AtomicBool,
    protected_update_just_completed: AtomicBool,
    csr_workflow_active: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new MQTT session began.
    pub fn on_new_session(&self) {
        self.protected_update_just_completed
            .store(false, Ordering::Relaxed);
    }

    pub fn set_protected_update_active(&self, active: bool) {
        self.protected_update_active.store(active, Ordering::Relaxed);
    }

    pub fn protected_update_active(&self) -> bool {
        self.protected_update_active.load(Ordering::Relaxed)
    }

    pub fn mark_protected_update_completed(&self) {
        self.protected_update_just_completed
            .store(true, Ordering::Relaxed);
        self.protected_update_active.store(false, Ordering::Relaxed);
    }

    pub fn protected_update_just_completed(&self) -> bool {
        self.protected_update_just_completed.load(Ordering::Relaxed)
    }

    pub fn set_csr_workflow_active(&self, active: bool) {
        self.csr_workflow_active.store(active, Ordering::Relaxed);
    }

    pub fn csr_workflow_active(&self) -> bool {
        self.csr_workflow_active.load(Ordering::Relaxed)
    }

    /// Whether the publisher task may be started.
    pub fn publisher_allowed(&self) -> bool {
        !self.protected_update_active() && !self.protected_update_just_completed()
    }
}

pub struct SessionCmd;
impl SessionCmd {
    /// Bring up an MQTT session.
    ///
    /// Selects the TLS certificate, connects, subscribes to the command
    /// topics and, when the device came up on its factory certificate with
    /// automatic renewal enabled, enrolls a new device certificate.
    ///
    /// # Returns
    ///
    /// * The certificate object id presented to the broker
    pub fn start(drivers: &mut Drivers) -> SdcleResult<u16> {
        drivers.license.check()?;

        let selected = match drivers.selector.select_mqtt_certificate(
            &drivers.se,
            drivers.clock.as_ref(),
            &mut drivers.psa,
        ) {
            Ok(oid) => oid,
            Err(SdcleError::CERT_NO_VALID_CERTIFICATE) => drivers.selector.selected_oid(),
            Err(err) => return Err(err),
        };

        drivers.mqtt.connect(selected)?;
        cprintln!("[mqtt] Connected with {}", Oid(selected));
        drivers.session.on_new_session();

        if !drivers
            .queue
            .post(SubscriberMessage::new(SubscriberCommand::SubscribeToTopic, &[]))
        {
            return Err(SdcleError::QUEUE_CLOSED);
        }
        crate::process_pending(drivers);

        if drivers.selector.take_renewal_request() {
            cprintln!("[mqtt] Enrolling a device certificate");
            if let Err(err) = CsrWorkflowCmd::execute(drivers) {
                cprintln!("[mqtt] Enrollment failed: 0x{:08X}", u32::from(err));
            }
        }
        Ok(selected)
    }
}
