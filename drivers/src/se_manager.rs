/*++

Licensed under the Apache-2.0 license.

File Name:

    se_manager.rs

Abstract:

    File contains the process-wide owner of the secure element: a single
    long-lived transport behind a non-recursive mutex with an acquisition
    deadline, and the scoped guards through which every command is issued.

--*/

use crate::async_bridge::{AsyncBridge, BridgeTimeouts};
use crate::cprintln;
use crate::metadata::Metadata;
use crate::printer::Oid;
use crate::se::{AesKeySize, EccCurve, SeCommand, SeKeyUsage, SecureElement, WriteMode};
use core::time::Duration;
use sdcle_error::{SdcleError, SdcleResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeManagerConfig {
    pub mutex_timeout: Duration,
    pub timeouts: BridgeTimeouts,
}

impl Default for SeManagerConfig {
    fn default() -> Self {
        Self {
            mutex_timeout: Duration::from_secs(10),
            timeouts: BridgeTimeouts::default(),
        }
    }
}

/// Owns the secure element transport for the lifetime of the process.
///
/// The transport is opened once in [`SeInstanceManager::init`] and reused by
/// every workflow; it is never torn down and recreated.
pub struct SeInstanceManager {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    se: Mutex<Box<dyn SecureElement>>,
    bridge: AsyncBridge,
    mutex_timeout: Duration,
}

impl SeInstanceManager {
    pub fn init(mut se: Box<dyn SecureElement>, config: SeManagerConfig) -> SdcleResult<Self> {
        se.open().map_err(|status| {
            cprintln!("[se] Open failed: 0x{:04X}", status);
            SdcleError::from_se_status(status)
        })?;
        cprintln!("[se] Instance manager ready");
        Ok(Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            se: Mutex::new(se),
            bridge: AsyncBridge::new(config.timeouts),
            mutex_timeout: config.mutex_timeout,
        })
    }

    /// Lock the secure element for the calling thread.
    ///
    /// Blocks until the current holder releases it or the mutex deadline
    /// expires. Acquiring twice from the same thread fails immediately.
    pub fn acquire(&self) -> SdcleResult<SeGuard<'_>> {
        let me = thread::current().id();
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(me) {
            cprintln!("[se] Recursive acquire rejected");
            return Err(SdcleError::SE_MUTEX_RECURSIVE);
        }

        let (mut owner, _) = self
            .released
            .wait_timeout_while(owner, self.mutex_timeout, |holder| holder.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if owner.is_some() {
            cprintln!("[se] Acquire timed out");
            return Err(SdcleError::SE_MUTEX_TIMEOUT);
        }
        *owner = Some(me);
        drop(owner);

        let se = self.se.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(SeGuard {
            manager: self,
            se: Some(se),
        })
    }

    /// Whether any thread currently holds the secure element.
    pub fn is_held(&self) -> bool {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn timeouts(&self) -> &BridgeTimeouts {
        self.bridge.timeouts()
    }

    fn release(&self) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        drop(owner);
        self.released.notify_one();
    }
}

/// Exclusive access to the secure element. Dropping the guard unlocks it.
pub struct SeGuard<'a> {
    manager: &'a SeInstanceManager,
    se: Option<MutexGuard<'a, Box<dyn SecureElement>>>,
}

impl Drop for SeGuard<'_> {
    fn drop(&mut self) {
        self.se.take();
        self.manager.release();
    }
}

impl<'a> SeGuard<'a> {
    pub fn execute(&mut self, cmd: SeCommand) -> SdcleResult<Vec<u8>> {
        let se = self.se.as_mut().ok_or(SdcleError::SE_NOT_INITIALIZED)?;
        self.manager.bridge.execute(&mut ***se, cmd)
    }

    pub fn read_data(&mut self, oid: u16) -> SdcleResult<Vec<u8>> {
        self.execute(SeCommand::ReadData { oid, offset: 0 })
    }

    pub fn read_metadata(&mut self, oid: u16) -> SdcleResult<Metadata> {
        let raw = self.execute(SeCommand::ReadMetadata { oid })?;
        Metadata::parse(&raw)
    }

    /// Lifecycle state of `oid`, if its metadata carries one.
    pub fn lcso(&mut self, oid: u16) -> SdcleResult<Option<u8>> {
        Ok(self.read_metadata(oid)?.lcso)
    }

    /// Erase `oid` and write `data` from offset 0.
    pub fn write_data(&mut self, oid: u16, data: &[u8]) -> SdcleResult<()> {
        self.execute(SeCommand::WriteData {
            oid,
            mode: WriteMode::EraseAndWrite,
            offset: 0,
            data: data.to_vec(),
        })
        .map(|_| ())
    }

    pub fn write_metadata(&mut self, oid: u16, metadata: &Metadata) -> SdcleResult<()> {
        self.execute(SeCommand::WriteMetadata {
            oid,
            metadata: metadata.to_bytes(),
        })
        .map(|_| ())
    }

    pub fn increment_counter(&mut self, oid: u16, step: u8) -> SdcleResult<()> {
        self.execute(SeCommand::IncrementCounter { oid, step })
            .map(|_| ())
    }

    pub fn protected_update_start(
        &mut self,
        manifest_version: u8,
        manifest: &[u8],
    ) -> SdcleResult<()> {
        self.execute(SeCommand::ProtectedUpdateStart {
            manifest_version,
            manifest: manifest.to_vec(),
        })
        .map(|_| ())
    }

    pub fn protected_update_final(&mut self, fragment: &[u8]) -> SdcleResult<()> {
        self.execute(SeCommand::ProtectedUpdateFinal {
            fragment: fragment.to_vec(),
        })
        .map(|_| ())
    }

    /// Open a crypt session on top of this lock. The session borrows the
    /// guard, so it always ends before the lock is released.
    pub fn create_crypt(&mut self) -> CryptSession<'_, 'a> {
        CryptSession { guard: self }
    }
}

/// Cryptographic commands, issued while the outer lock is held.
pub struct CryptSession<'g, 'a> {
    guard: &'g mut SeGuard<'a>,
}

impl CryptSession<'_, '_> {
    pub fn random(&mut self, len: u16) -> SdcleResult<Vec<u8>> {
        let out = self.guard.execute(SeCommand::GetRandom { len })?;
        expect_len(out, len.into())
    }

    /// Generate a P-256 key pair in `key_oid`. Returns the public key as
    /// the BIT STRING TLV reported by the device.
    pub fn generate_keypair(&mut self, key_oid: u16, usage: SeKeyUsage) -> SdcleResult<Vec<u8>> {
        cprintln!("[se] Generating key pair in {}", Oid(key_oid));
        self.guard.execute(SeCommand::GenerateKeyPair {
            curve: EccCurve::P256,
            usage,
            key_oid,
        })
    }

    /// Sign a 32 byte digest. Returns `02 len r 02 len s`.
    pub fn ecdsa_sign(&mut self, key_oid: u16, digest: &[u8]) -> SdcleResult<Vec<u8>> {
        self.guard.execute(SeCommand::EcdsaSign {
            key_oid,
            digest: digest.to_vec(),
        })
    }

    pub fn sha256(&mut self, data: &[u8]) -> SdcleResult<[u8; 32]> {
        let out = self.guard.execute(SeCommand::Hash {
            data: data.to_vec(),
        })?;
        out.try_into().map_err(|_| SdcleError::SE_INVALID_RESPONSE)
    }

    pub fn hmac_sha256(&mut self, secret_oid: u16, data: &[u8]) -> SdcleResult<[u8; 32]> {
        let out = self.guard.execute(SeCommand::Hmac {
            secret_oid,
            data: data.to_vec(),
        })?;
        out.try_into().map_err(|_| SdcleError::SE_INVALID_RESPONSE)
    }

    pub fn ecdh(&mut self, key_oid: u16, peer_public: &[u8]) -> SdcleResult<Zeroizing<Vec<u8>>> {
        let out = self.guard.execute(SeCommand::Ecdh {
            key_oid,
            peer_public: peer_public.to_vec(),
        })?;
        Ok(Zeroizing::new(expect_len(out, 32)?))
    }

    pub fn hkdf_sha256(
        &mut self,
        secret_oid: u16,
        salt: &[u8],
        info: &[u8],
        len: u16,
    ) -> SdcleResult<Zeroizing<Vec<u8>>> {
        let out = self.guard.execute(SeCommand::Hkdf {
            secret_oid,
            salt: salt.to_vec(),
            info: info.to_vec(),
            len,
        })?;
        Ok(Zeroizing::new(expect_len(out, len.into())?))
    }

    pub fn generate_symmetric_key(&mut self, size: AesKeySize, key_oid: u16) -> SdcleResult<()> {
        self.guard
            .execute(SeCommand::GenerateSymmetricKey { size, key_oid })
            .map(|_| ())
    }

    pub fn aes_cbc_encrypt(
        &mut self,
        key_oid: u16,
        iv: &[u8],
        data: &[u8],
    ) -> SdcleResult<Vec<u8>> {
        let out = self.guard.execute(SeCommand::SymmetricEncrypt {
            key_oid,
            iv: iv.to_vec(),
            data: data.to_vec(),
        })?;
        expect_len(out, data.len())
    }

    pub fn aes_cbc_decrypt(
        &mut self,
        key_oid: u16,
        iv: &[u8],
        data: &[u8],
    ) -> SdcleResult<Vec<u8>> {
        let out = self.guard.execute(SeCommand::SymmetricDecrypt {
            key_oid,
            iv: iv.to_vec(),
            data: data.to_vec(),
        })?;
        expect_len(out, data.len())
    }
}

fn expect_len(out: Vec<u8>, len: usize) -> SdcleResult<Vec<u8>> {
    if out.len() == len {
        Ok(out)
    } else {
        Err(SdcleError::SE_INVALID_RESPONSE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::{status, Completion};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Echo {
        submitted: Arc<AtomicU32>,
    }

    impl SecureElement for Echo {
        fn open(&mut self) -> Result<(), u16> {
            Ok(())
        }

        fn submit(&mut self, cmd: SeCommand, completion: Completion) -> Result<(), u16> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            let out = match cmd {
                SeCommand::GetRandom { len } => vec![0x5A; len.into()],
                SeCommand::Hash { .. } => vec![0; 32],
                _ => vec![],
            };
            completion.complete(status::SUCCESS, out);
            Ok(())
        }
    }

    fn manager(mutex_timeout: Duration) -> (SeInstanceManager, Arc<AtomicU32>) {
        let submitted = Arc::new(AtomicU32::new(0));
        let se = Box::new(Echo {
            submitted: submitted.clone(),
        });
        let config = SeManagerConfig {
            mutex_timeout,
            timeouts: BridgeTimeouts {
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
        };
        (SeInstanceManager::init(se, config).unwrap(), submitted)
    }

    #[test]
    fn test_recursive_acquire_fails() {
        let (mgr, _) = manager(Duration::from_millis(50));
        let _guard = mgr.acquire().unwrap();
        assert_eq!(mgr.acquire().err(), Some(SdcleError::SE_MUTEX_RECURSIVE));
    }

    #[test]
    fn test_release_on_drop() {
        let (mgr, _) = manager(Duration::from_millis(50));
        {
            let _guard = mgr.acquire().unwrap();
            assert!(mgr.is_held());
        }
        assert!(!mgr.is_held());
        assert!(mgr.acquire().is_ok());
    }

    #[test]
    fn test_acquire_times_out_while_held_elsewhere() {
        let (mgr, _) = manager(Duration::from_millis(20));
        let mgr = Arc::new(mgr);
        let _guard = mgr.acquire().unwrap();
        let other = mgr.clone();
        let result = thread::spawn(move || other.acquire().map(|_| ()))
            .join()
            .unwrap();
        assert_eq!(result, Err(SdcleError::SE_MUTEX_TIMEOUT));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let (mgr, _) = manager(Duration::from_secs(2));
        let mgr = Arc::new(mgr);
        let guard = mgr.acquire().unwrap();
        let other = mgr.clone();
        let waiter = thread::spawn(move || other.acquire().map(|_| ()));
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_crypt_session_under_guard() {
        let (mgr, submitted) = manager(Duration::from_millis(50));
        let mut guard = mgr.acquire().unwrap();
        let mut crypt = guard.create_crypt();
        assert_eq!(crypt.random(16).unwrap(), vec![0x5A; 16]);
        assert_eq!(crypt.sha256(b"abc").unwrap(), [0; 32]);
        assert_eq!(submitted.load(Ordering::SeqCst), 2);
    }
}
