/*++

Licensed under the Apache-2.0 license.

File Name:

    router.rs

Abstract:

    File contains the MQTT router: it maps inbound topics to subscriber
    commands and hands copied payloads to the subscriber queue without
    ever blocking the MQTT receive thread.

--*/

use crate::mqtt::suffix;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberCommand {
    SubscribeToTopic,
    UnsubscribeFromTopic,
    UpdateDeviceCertificates,
    UpdateProtectedUpdateBundle,
    CheckCertificateResponse,
    UploadCertificateResponse,
    SyncCertificateResponse,
}

impl SubscriberCommand {
    /// Command for an inbound topic, matched on its suffix.
    pub fn from_topic(topic: &str) -> Option<Self> {
        [
            (suffix::PROTECTED_UPDATE, Self::UpdateProtectedUpdateBundle),
            (suffix::CERTIFICATE, Self::UpdateDeviceCertificates),
            (
                suffix::CHECK_CERTIFICATE_RESPONSE,
                Self::CheckCertificateResponse,
            ),
            (
                suffix::UPLOAD_CERTIFICATE_RESPONSE,
                Self::UploadCertificateResponse,
            ),
            (
                suffix::SYNC_CERTIFICATE_RESPONSE,
                Self::SyncCertificateResponse,
            ),
        ]
        .into_iter()
        .find(|(suffix, _)| topic.ends_with(suffix))
        .map(|(_, cmd)| cmd)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscribeToTopic => "subscribe",
            Self::UnsubscribeFromTopic => "unsubscribe",
            Self::UpdateDeviceCertificates => "certificate",
            Self::UpdateProtectedUpdateBundle => "protected_update",
            Self::CheckCertificateResponse => "check_certificate_response",
            Self::UploadCertificateResponse => "upload_certificate_response",
            Self::SyncCertificateResponse => "sync_certificate_response",
        }
    }
}

/// One queued command. The payload is owned by the message and freed when
/// the consumer drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberMessage {
    pub cmd: SubscriberCommand,
    pub payload: Vec<u8>,
}

impl SubscriberMessage {
    pub fn new(cmd: SubscriberCommand, payload: &[u8]) -> Self {
        Self {
            cmd,
            payload: payload.to_vec(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RouterStats {
    total: AtomicU32,
    certificate: AtomicU32,
    protected_update: AtomicU32,
    check_response: AtomicU32,
    upload_response: AtomicU32,
    sync_response: AtomicU32,
    unknown_topic: AtomicU32,
    dropped: AtomicU32,
}

/// Copy of the router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCounters {
    pub total: u32,
    pub certificate: u32,
    pub protected_update: u32,
    pub check_response: u32,
    pub upload_response: u32,
    pub sync_response: u32,
    pub unknown_topic: u32,
    /// Messages lost to a full queue.
    pub dropped: u32,
}

impl RouterStats {
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn counter(&self, cmd: SubscriberCommand) -> Option<&AtomicU32> {
        match cmd {
            SubscriberCommand::UpdateDeviceCertificates => Some(&self.certificate),
            SubscriberCommand::UpdateProtectedUpdateBundle => Some(&self.protected_update),
            SubscriberCommand::CheckCertificateResponse => Some(&self.check_response),
            SubscriberCommand::UploadCertificateResponse => Some(&self.upload_response),
            SubscriberCommand::SyncCertificateResponse => Some(&self.sync_response),
            SubscriberCommand::SubscribeToTopic | SubscriberCommand::UnsubscribeFromTopic => None,
        }
    }

    pub fn snapshot(&self) -> RouterCounters {
        let get = |c: &AtomicU32| c.load(Ordering::Relaxed);
        RouterCounters {
            total: get(&self.total),
            certificate: get(&self.certificate),
            protected_update: get(&self.protected_update),
            check_response: get(&self.check_response),
            upload_response: get(&self.upload_response),
            sync_response: get(&self.sync_response),
            unknown_topic: get(&self.unknown_topic),
            dropped: get(&self.dropped),
        }
    }
}

/// Create the subscriber queue with room for `depth` messages.
pub fn subscriber_queue(depth: usize) -> (SubscriberHandle, Receiver<SubscriberMessage>) {
    let (tx, rx) = mpsc::sync_channel(depth);
    (SubscriberHandle { tx }, rx)
}

/// Producer side of the subscriber queue.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    tx: SyncSender<SubscriberMessage>,
}

impl SubscriberHandle {
    /// Enqueue without blocking. Returns `false` when the message was
    /// dropped because the queue is full or closed.
    pub fn post(&self, msg: SubscriberMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Runs on the MQTT receive thread. Never logs and never blocks.
#[derive(Debug, Clone)]
pub struct MqttRouter {
    queue: SubscriberHandle,
    stats: Arc<RouterStats>,
}

impl MqttRouter {
    pub fn new(queue: SubscriberHandle) -> Self {
        Self {
            queue,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Inbound publish callback.
    pub fn route(&self, topic: &str, payload: &[u8]) {
        RouterStats::bump(&self.stats.total);
        let Some(cmd) = SubscriberCommand::from_topic(topic) else {
            RouterStats::bump(&self.stats.unknown_topic);
            return;
        };
        if let Some(counter) = self.stats.counter(cmd) {
            RouterStats::bump(counter);
        }
        if !self.queue.post(SubscriberMessage::new(cmd, payload)) {
            RouterStats::bump(&self.stats.dropped);
        }
    }
}
