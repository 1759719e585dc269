/*++

Licensed under the Apache-2.0 license.

File Name:

    health.rs

Abstract:

    File contains the device health report.

--*/

use crate::clock::Clock;
use crate::identity;
use sdcle_drivers::{oid, SeInstanceManager};
use sdcle_x509::CertificateInfo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub se_ok: bool,
    pub factory_cert_ok: bool,
    pub device_cert_ok: bool,
    pub license_ok: bool,
    pub mqtt_ok: bool,
    pub time_synced: bool,
    /// Days left on the device certificate, or on the factory certificate
    /// when the device certificate is unusable.
    pub cert_days_left: i64,
    /// Global lifecycle state.
    pub lcso_value: u8,
}

fn certificate(se: &SeInstanceManager, cert_oid: u16) -> Option<CertificateInfo> {
    let der = se.acquire().ok()?.read_data(cert_oid).ok()?;
    if der.is_empty() {
        return None;
    }
    CertificateInfo::parse(&der).ok()
}

impl HealthReport {
    /// Gather the report. Nothing is written and no cache is touched.
    pub fn collect(
        se: &SeInstanceManager,
        license_ok: bool,
        clock: &dyn Clock,
        mqtt_ok: bool,
    ) -> Self {
        let lifecycle = identity::read_global_lifecycle(se);
        let time_synced = clock.is_synced();
        let now = clock.now();
        let usable = |info: &Option<CertificateInfo>| {
            time_synced && info.as_ref().is_some_and(|i| i.is_valid_at(now))
        };

        let device = certificate(se, oid::DEVICE_CERT);
        let factory = certificate(se, oid::FACTORY_CERT);
        let device_cert_ok = usable(&device);
        let factory_cert_ok = usable(&factory);
        let days_source = if device_cert_ok { &device } else { &factory };
        let cert_days_left = match days_source {
            Some(info) if time_synced => info.days_until_expiry(now),
            _ => 0,
        };

        Self {
            se_ok: lifecycle.is_ok(),
            factory_cert_ok,
            device_cert_ok,
            license_ok,
            mqtt_ok,
            time_synced,
            cert_days_left,
            lcso_value: lifecycle.unwrap_or(0),
        }
    }
}
