/*++

Licensed under the Apache-2.0 license.

File Name:

    subscriber.rs

Abstract:

    File contains the consumer side of the subscriber queue and the
    handler for certificates pushed on `commands/certificate`.

--*/

use crate::ack::{InstallAck, Workflow};
use crate::csr_workflow::{install_certificate, validate_certificate, CertificateMessage};
use crate::drivers::Drivers;
use crate::router::{SubscriberCommand, SubscriberMessage};
use crate::selector::PRIMARY_CERT_OID;
use sdcle_drivers::cprintln;
use sdcle_error::SdcleResult;
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::time::Instant;

/// Subscriber queue as seen by the subscriber task.
///
/// A workflow waiting for one command sets the others aside; they are
/// handed out again, in arrival order, before anything newer.
pub struct Inbox {
    rx: Receiver<SubscriberMessage>,
    deferred: VecDeque<SubscriberMessage>,
}

impl Inbox {
    pub fn new(rx: Receiver<SubscriberMessage>) -> Self {
        Self {
            rx,
            deferred: VecDeque::new(),
        }
    }

    /// Next message without blocking.
    pub fn try_next(&mut self) -> Option<SubscriberMessage> {
        self.deferred
            .pop_front()
            .or_else(|| self.rx.try_recv().ok())
    }

    /// Next message, waiting until `deadline` at most.
    pub fn recv_until(&mut self, deadline: Instant) -> Option<SubscriberMessage> {
        if let Some(msg) = self.deferred.pop_front() {
            return Some(msg);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.rx.recv_timeout(remaining).ok()
    }

    /// Wait until `deadline` for a message carrying `cmd`. Every other
    /// message received meanwhile is deferred.
    pub fn wait_for(
        &mut self,
        deadline: Instant,
        cmd: SubscriberCommand,
    ) -> Option<SubscriberMessage> {
        if let Some(pos) = self.deferred.iter().position(|m| m.cmd == cmd) {
            return self.deferred.remove(pos);
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(msg) if msg.cmd == cmd => return Some(msg),
                Ok(msg) => self.deferred.push_back(msg),
                Err(_) => return None,
            }
        }
    }

    /// Messages set aside by a wait.
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }
}

pub struct UpdateCertificateCmd;
impl UpdateCertificateCmd {
    /// Install a certificate the platform pushed outside of an enrollment
    /// wait.
    ///
    /// # Returns
    ///
    /// * `Some(oid)` when the certificate was written
    /// * `None` when the message was ignored
    pub fn execute(drivers: &mut Drivers, payload: &[u8]) -> SdcleResult<Option<u16>> {
        if drivers.session.protected_update_just_completed() {
            cprintln!("[sub] Certificate ignored, protected update just completed");
            return Ok(None);
        }
        if payload.is_empty() {
            return Ok(None);
        }
        drivers.license.check()?;

        let message = CertificateMessage::parse(payload)?;
        if !message.matches(drivers.csr.correlation_id.as_deref()) {
            return Ok(None);
        }

        let started = drivers.clock.now_millis();
        let result = validate_certificate(&message.der, &drivers.device_uid)
            .and_then(|_| install_certificate(drivers, PRIMARY_CERT_OID, &message.der));

        let correlation_id = message.correlation_id.unwrap_or_default();
        let now = drivers.clock.now_millis();
        let duration = u64::try_from(now - started).unwrap_or(0);
        let ack = match result {
            Ok(()) => InstallAck::success(
                Workflow::Csr,
                PRIMARY_CERT_OID,
                &correlation_id,
                now,
                duration,
            ),
            Err(err) => InstallAck::failure(
                Workflow::Csr,
                PRIMARY_CERT_OID,
                &correlation_id,
                now,
                duration,
                err,
            ),
        };
        ack.publish(drivers.mqtt.as_mut(), &drivers.topics.telemetry_system);
        result.map(|_| Some(PRIMARY_CERT_OID))
    }
}
