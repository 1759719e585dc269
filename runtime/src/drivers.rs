/*++

Licensed under the Apache-2.0 license.

File Name:

    drivers.rs

Abstract:

    File contains the state owned by the subscriber task: the secure
    element, the MQTT session and every workflow record.

--*/

use crate::clock::Clock;
use crate::config::SdcleConfig;
use crate::crypto::CryptoFacade;
use crate::csr_workflow::CsrTransaction;
use crate::identity;
use crate::license::LicenseGate;
use crate::mqtt::{MqttClient, Topics};
use crate::platform::PlatformCertStatus;
use crate::protected_update::UpdateTransaction;
use crate::psa::PsaDriver;
use crate::router::{subscriber_queue, MqttRouter, SubscriberHandle};
use crate::selector::{key_oid_for, CertSelector, PRIMARY_CERT_OID};
use crate::session::SessionFlags;
use crate::subscriber::Inbox;
use sdcle_drivers::{SeInstanceManager, SecureElement};
use sdcle_error::SdcleResult;
use std::sync::Arc;

pub struct Drivers {
    pub config: SdcleConfig,

    /// Process-wide secure element owner
    pub se: Arc<SeInstanceManager>,

    pub license: Arc<LicenseGate>,

    /// License gated developer operations
    pub crypto: CryptoFacade,

    /// Key provider of the TLS stack
    pub psa: PsaDriver,

    pub selector: Arc<CertSelector>,

    pub session: Arc<SessionFlags>,

    pub mqtt: Box<dyn MqttClient>,

    pub clock: Arc<dyn Clock>,

    pub topics: Topics,

    /// Inbound publish callback, to be registered with the MQTT client
    pub router: MqttRouter,

    /// Producer side of the subscriber queue, for the MQTT client task
    pub queue: SubscriberHandle,

    pub inbox: Inbox,

    pub csr: CsrTransaction,

    pub pu: UpdateTransaction,

    pub platform: PlatformCertStatus,

    /// Device UUID used in topics and request envelopes
    pub device_id: String,

    /// Factory UID in uppercase hex, the subject CN of the device
    pub device_uid: String,
}

impl Drivers {
    /// Open the secure element, check the license and read the device
    /// identity.
    ///
    /// A failed license check is not an error here: the gate stays closed
    /// and every gated operation reports it.
    pub fn new(
        se: Box<dyn SecureElement>,
        mqtt: Box<dyn MqttClient>,
        clock: Arc<dyn Clock>,
        config: SdcleConfig,
    ) -> SdcleResult<Self> {
        let se = Arc::new(SeInstanceManager::init(se, config.se_manager_config())?);

        let license = Arc::new(LicenseGate::new());
        license.verify(&se, &config);

        let device_uid = identity::factory_uid_hex(&se)?;
        let device_id = if config.device_id.is_empty() {
            device_uid.clone()
        } else {
            config.device_id.clone()
        };

        let (queue, rx) = subscriber_queue(config.queue_depth);
        let version_seed = u64::try_from(clock.now()).unwrap_or(0);

        Ok(Self {
            crypto: CryptoFacade::new(se.clone(), license.clone()),
            psa: PsaDriver::new(key_oid_for(PRIMARY_CERT_OID)),
            selector: Arc::new(CertSelector::new(config.auto_renewal)),
            session: Arc::new(SessionFlags::new()),
            topics: Topics::new(&device_id),
            router: MqttRouter::new(queue.clone()),
            queue,
            inbox: Inbox::new(rx),
            csr: CsrTransaction::new(version_seed),
            pu: UpdateTransaction::default(),
            platform: PlatformCertStatus::default(),
            se,
            license,
            mqtt,
            clock,
            config,
            device_id,
            device_uid,
        })
    }
}
