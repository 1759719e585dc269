/*++

Licensed under the Apache-2.0 license.

File Name:

    selector.rs

Abstract:

    File contains the certificate selector that picks the client
    certificate of every TLS bring-up, tracks the factory fallback and
    schedules automatic renewal.

--*/

use crate::clock::Clock;
use crate::psa::PsaDriver;
use sdcle_drivers::printer::Oid;
use sdcle_drivers::{cprintln, oid, SeInstanceManager};
use sdcle_error::{SdcleError, SdcleResult};
use sdcle_x509::CertificateInfo;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, PoisonError};

/// Certificate issued to the device through enrollment or update.
pub const PRIMARY_CERT_OID: u16 = oid::DEVICE_CERT;
/// Certificate written at manufacture.
pub const FACTORY_CERT_OID: u16 = oid::FACTORY_CERT;

/// Private key paired with a certificate slot.
pub fn key_oid_for(cert_oid: u16) -> u16 {
    match cert_oid {
        oid::FACTORY_CERT => oid::FACTORY_KEY,
        _ => oid::DEVICE_KEY,
    }
}

/// Contents of a certificate slot as last read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub der: Vec<u8>,
    pub info: Option<CertificateInfo>,
}

impl CertRecord {
    fn from_der(der: Vec<u8>) -> Self {
        let info = if der.is_empty() {
            None
        } else {
            CertificateInfo::parse(&der).ok()
        };
        Self { der, info }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertValidityReport {
    pub exists: bool,
    pub parsed: bool,
    pub expired: bool,
    pub not_yet_valid: bool,
    pub time_synced: bool,
    pub days_remaining: i64,
    pub subject_cn: String,
    pub issuer_cn: String,
    pub not_before: i64,
    pub not_after: i64,
}

impl CertValidityReport {
    fn new(record: &CertRecord, clock: &dyn Clock) -> Self {
        let now = clock.now();
        let time_synced = clock.is_synced();
        let mut report = Self {
            exists: !record.der.is_empty(),
            time_synced,
            ..Default::default()
        };
        if let Some(info) = &record.info {
            report.parsed = true;
            report.subject_cn = info.subject_cn.clone();
            report.issuer_cn = info.issuer_cn.clone();
            report.not_before = info.not_before;
            report.not_after = info.not_after;
            if time_synced {
                report.expired = now > info.not_after;
                report.not_yet_valid = now < info.not_before;
                report.days_remaining = info.days_until_expiry(now);
            }
        }
        report
    }

    /// Present, parseable and inside its validity window. An unsynchronized
    /// clock cannot prove the latter.
    pub fn is_valid(&self) -> bool {
        self.exists && self.parsed && self.time_synced && !self.expired && !self.not_yet_valid
    }
}

pub struct CertSelector {
    selected: AtomicU16,
    using_fallback: AtomicBool,
    force_factory: AtomicBool,
    pending_renewal: AtomicBool,
    auto_renewal: bool,
    cache: Mutex<BTreeMap<u16, CertRecord>>,
}

impl CertSelector {
    pub fn new(auto_renewal: bool) -> Self {
        Self {
            selected: AtomicU16::new(PRIMARY_CERT_OID),
            using_fallback: AtomicBool::new(false),
            force_factory: AtomicBool::new(false),
            pending_renewal: AtomicBool::new(false),
            auto_renewal,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, BTreeMap<u16, CertRecord>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot contents, from the cache when the slot has not been written
    /// since the last read.
    pub fn record(&self, se: &SeInstanceManager, cert_oid: u16) -> SdcleResult<CertRecord> {
        if let Some(record) = self.cache().get(&cert_oid) {
            return Ok(record.clone());
        }
        let der = se.acquire()?.read_data(cert_oid)?;
        let record = CertRecord::from_der(der);
        self.cache().insert(cert_oid, record.clone());
        Ok(record)
    }

    /// Forget what is known about `cert_oid`. Called after every write that
    /// touches the slot.
    pub fn invalidate(&self, cert_oid: u16) {
        self.cache().remove(&cert_oid);
    }

    /// Re-read `cert_oid` from the secure element.
    pub fn refresh(&self, se: &SeInstanceManager, cert_oid: u16) -> SdcleResult<CertRecord> {
        self.invalidate(cert_oid);
        self.record(se, cert_oid)
    }

    pub fn check_certificate_validity(
        &self,
        se: &SeInstanceManager,
        clock: &dyn Clock,
        cert_oid: u16,
    ) -> CertValidityReport {
        match self.record(se, cert_oid) {
            Ok(record) => CertValidityReport::new(&record, clock),
            Err(err) => {
                cprintln!("[cert] Read of {} failed: 0x{:08X}", Oid(cert_oid), u32::from(err));
                CertValidityReport {
                    time_synced: clock.is_synced(),
                    ..Default::default()
                }
            }
        }
    }

    /// Choose the certificate for the next TLS bring-up and point the TLS
    /// key handle at its private key.
    ///
    /// # Returns
    ///
    /// * The selected certificate object id
    /// * `CERT_NO_VALID_CERTIFICATE` when neither slot holds a valid
    ///   certificate; the primary slot is selected anyway
    pub fn select_mqtt_certificate(
        &self,
        se: &SeInstanceManager,
        clock: &dyn Clock,
        psa: &mut PsaDriver,
    ) -> SdcleResult<u16> {
        if self.force_factory() {
            cprintln!("[cert] Factory certificate forced");
            self.using_fallback.store(true, Ordering::Relaxed);
            self.choose(se, psa, FACTORY_CERT_OID);
            return Ok(FACTORY_CERT_OID);
        }

        let primary = self.check_certificate_validity(se, clock, PRIMARY_CERT_OID);
        if primary.is_valid() {
            self.using_fallback.store(false, Ordering::Relaxed);
            self.choose(se, psa, PRIMARY_CERT_OID);
            return Ok(PRIMARY_CERT_OID);
        }

        let factory = self.check_certificate_validity(se, clock, FACTORY_CERT_OID);
        if factory.is_valid() {
            cprintln!("[cert] Device certificate unusable, falling back to factory");
            self.using_fallback.store(true, Ordering::Relaxed);
            self.pending_renewal.store(true, Ordering::Relaxed);
            self.choose(se, psa, FACTORY_CERT_OID);
            return Ok(FACTORY_CERT_OID);
        }

        cprintln!("[cert] No valid certificate");
        self.choose(se, psa, PRIMARY_CERT_OID);
        Err(SdcleError::CERT_NO_VALID_CERTIFICATE)
    }

    fn choose(&self, se: &SeInstanceManager, psa: &mut PsaDriver, cert_oid: u16) {
        let key_oid = key_oid_for(cert_oid);
        if let Ok(CertRecord {
            info: Some(CertificateInfo {
                public_key: Some(point),
                ..
            }),
            ..
        }) = self.record(se, cert_oid)
        {
            psa.cache_public_key(key_oid, &point);
        }
        psa.set_signing_key_oid(key_oid);
        if self.selected.swap(cert_oid, Ordering::Relaxed) != cert_oid {
            cprintln!("[cert] Selected {}", Oid(cert_oid));
        }
    }

    pub fn selected_oid(&self) -> u16 {
        self.selected.load(Ordering::Relaxed)
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    pub fn set_force_factory(&self, force: bool) {
        self.force_factory.store(force, Ordering::Relaxed);
    }

    pub fn force_factory(&self) -> bool {
        self.force_factory.load(Ordering::Relaxed)
    }

    pub fn pending_renewal(&self) -> bool {
        self.pending_renewal.load(Ordering::Relaxed)
    }

    /// Consume a pending renewal.
    ///
    /// Returns `true` when the CSR workflow should run now. With automatic
    /// renewal disabled the request stays pending for a manual trigger.
    pub fn take_renewal_request(&self) -> bool {
        if !self.pending_renewal() {
            return false;
        }
        if !self.auto_renewal {
            cprintln!("[cert] Running on factory certificate, renewal must be triggered manually");
            return false;
        }
        self.pending_renewal.store(false, Ordering::Relaxed);
        true
    }

    /// Leave fallback mode after a certificate write so the next TLS
    /// bring-up selects afresh.
    pub fn reset_fallback_state(&self) {
        self.using_fallback.store(false, Ordering::Relaxed);
        self.pending_renewal.store(false, Ordering::Relaxed);
        self.cache().clear();
    }
}
