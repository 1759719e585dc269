/*++

Licensed under the Apache-2.0 license.

File Name:

    object.rs

Abstract:

    Object store of the emulated secure element and its factory layout.

--*/

use p256::SecretKey;
use sdcle_drivers::{
    lcso, oid, AccessCondition, Condition, DataObjectType, Metadata,
};
use std::collections::BTreeMap;

pub(crate) const CERT_SLOT_CAPACITY: usize = 1728;
pub(crate) const COUNTER_LEN: usize = 8;
const SHARED_SECRET_LEN: usize = 64;

/// One numbered object.
pub(crate) struct Object {
    pub data: Vec<u8>,
    pub capacity: usize,
    pub metadata: Metadata,
    /// Private key of ECC key objects.
    pub key: Option<SecretKey>,
}

impl Object {
    fn data(capacity: usize, metadata: Metadata) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            metadata,
            key: None,
        }
    }

    pub fn lcso(&self) -> u8 {
        self.metadata.lcso.unwrap_or(lcso::CREATION)
    }

    /// Metadata as reported by a read: stored tags plus sizes.
    pub fn reported_metadata(&self) -> Metadata {
        let mut md = self.metadata.clone();
        md.lcso = Some(self.lcso());
        md.max_size = Some(self.capacity as u16);
        md.used_size = Some(self.data.len() as u16);
        md
    }

    pub fn change_access(&self) -> AccessCondition {
        self.metadata.change.clone().unwrap_or(AccessCondition::Always)
    }

    pub fn read_access(&self) -> AccessCondition {
        self.metadata.read.clone().unwrap_or(AccessCondition::Always)
    }

    pub fn execute_access(&self) -> AccessCondition {
        self.metadata
            .execute
            .clone()
            .unwrap_or(AccessCondition::Always)
    }
}

/// Contents written at manufacture.
pub struct FactoryProfile {
    pub uid: [u8; oid::FACTORY_UID_LEN],
    pub factory_cert: Vec<u8>,
    pub factory_key: SecretKey,
    pub shared_secret: Vec<u8>,
    /// Whether `0xE0E1` is locked, as it is on part of the fleet.
    pub lock_legacy_cert: bool,
}

impl FactoryProfile {
    /// Random UID, key and secret, and no factory certificate.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut uid = [0u8; oid::FACTORY_UID_LEN];
        rng.fill_bytes(&mut uid);
        let mut shared_secret = vec![0u8; SHARED_SECRET_LEN];
        rng.fill_bytes(&mut shared_secret);
        Self {
            uid,
            factory_cert: Vec::new(),
            factory_key: SecretKey::random(&mut rand::rngs::OsRng),
            shared_secret,
            lock_legacy_cert: true,
        }
    }
}

fn locked(data_type: Option<DataObjectType>) -> Metadata {
    Metadata {
        lcso: Some(lcso::OPERATIONAL),
        change: Some(AccessCondition::Never),
        execute: Some(AccessCondition::Always),
        data_type,
        ..Default::default()
    }
}

fn open_key_slot() -> Metadata {
    Metadata {
        lcso: Some(lcso::INITIALIZATION),
        change: Some(AccessCondition::All(vec![Condition::LcsoLessThan(
            lcso::OPERATIONAL,
        )])),
        execute: Some(AccessCondition::Always),
        ..Default::default()
    }
}

/// Build the object map of a freshly manufactured device.
pub(crate) fn factory_layout(profile: &FactoryProfile) -> BTreeMap<u16, Object> {
    let mut objects = BTreeMap::new();

    let mut lifecycle = Object::data(1, locked(None));
    lifecycle.data = vec![lcso::OPERATIONAL];
    objects.insert(oid::GLOBAL_LIFECYCLE, lifecycle);

    let mut uid = Object::data(oid::FACTORY_UID_LEN, locked(None));
    uid.data = profile.uid.to_vec();
    objects.insert(oid::FACTORY_UID, uid);

    let mut factory_cert = Object::data(
        CERT_SLOT_CAPACITY,
        locked(Some(DataObjectType::DeviceCertificate)),
    );
    factory_cert.data = profile.factory_cert.clone();
    objects.insert(oid::FACTORY_CERT, factory_cert);

    let legacy = if profile.lock_legacy_cert {
        locked(Some(DataObjectType::DeviceCertificate))
    } else {
        Metadata::device_certificate()
    };
    objects.insert(
        oid::LEGACY_DEVICE_CERT,
        Object::data(CERT_SLOT_CAPACITY, legacy),
    );
    objects.insert(
        oid::DEVICE_CERT,
        Object::data(CERT_SLOT_CAPACITY, Metadata::device_certificate()),
    );
    objects.insert(
        oid::LEGACY_ROOT_CA,
        Object::data(CERT_SLOT_CAPACITY, locked(None)),
    );
    objects.insert(
        oid::LEGACY_ROOT_CA_2,
        Object::data(CERT_SLOT_CAPACITY, locked(None)),
    );
    objects.insert(
        oid::TRUST_ANCHOR,
        Object::data(CERT_SLOT_CAPACITY, Metadata::default()),
    );

    let mut factory_key = Object::data(0, locked(None));
    factory_key.key = Some(profile.factory_key.clone());
    objects.insert(oid::FACTORY_KEY, factory_key);
    for key_oid in [oid::DEVICE_KEY, oid::KEY_2, oid::KEY_3] {
        objects.insert(key_oid, Object::data(0, open_key_slot()));
    }

    for id in 0..4u16 {
        let mut counter = Object::data(
            COUNTER_LEN,
            Metadata {
                data_type: Some(DataObjectType::UpdateCounter),
                ..Default::default()
            },
        );
        counter.data = [0u32.to_be_bytes(), u32::MAX.to_be_bytes()].concat();
        objects.insert(oid::COUNTER_BASE + id, counter);
    }

    objects.insert(
        oid::SESSION_KEY,
        Object::data(
            32,
            Metadata {
                read: Some(AccessCondition::Never),
                ..Default::default()
            },
        ),
    );

    for slot in oid::DATA_SLOT_BASE..=oid::DATA_SLOT_LAST {
        objects.insert(slot, Object::data(oid::DATA_SLOT_CAPACITY, Metadata::default()));
    }
    let mut secret = Object::data(oid::DATA_SLOT_CAPACITY, Metadata::update_secret());
    secret.metadata.lcso = Some(lcso::OPERATIONAL);
    secret.metadata.change = Some(AccessCondition::Never);
    secret.data = profile.shared_secret.clone();
    objects.insert(oid::UPDATE_SHARED_SECRET, secret);

    for slot in oid::LARGE_DATA_SLOT_BASE..=oid::LARGE_DATA_SLOT_LAST {
        objects.insert(
            slot,
            Object::data(oid::LARGE_DATA_SLOT_CAPACITY, Metadata::default()),
        );
    }

    objects
}
