/*++

Licensed under the Apache-2.0 license.

File Name:

    clock.rs

Abstract:

    File contains the wall clock abstraction used for certificate validity
    and acknowledgement timestamps.

--*/

use chrono::{SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// 2020-01-01T00:00:00Z. Earlier readings mean NTP has not synchronized yet.
pub const MIN_SYNCED_UNIX_TIME: i64 = 1_577_836_800;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    fn now(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }

    fn is_synced(&self) -> bool {
        self.now() >= MIN_SYNCED_UNIX_TIME
    }
}

/// System time, set by the NTP collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn at(unix_secs: i64) -> Self {
        Self(AtomicI64::new(unix_secs * 1000))
    }

    pub fn set(&self, unix_secs: i64) {
        self.0.store(unix_secs * 1000, Ordering::Relaxed);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// ISO 8601 UTC with millisecond precision, e.g. `2026-06-01T00:00:00.000Z`.
pub fn iso8601_millis(unix_millis: i64) -> String {
    match Utc.timestamp_millis_opt(unix_millis).single() {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => String::from("1970-01-01T00:00:00.000Z"),
    }
}
