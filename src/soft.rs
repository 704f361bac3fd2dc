//! In-process key store.
//!
//! Serves the [`SecurityTier::Software`] tier, and optionally pretends to
//! have a secure element so that both tiers can be exercised without real
//! hardware. It also exposes the device events the vault has to cope with:
//! lock state changes and new biometric enrollments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::crypt::{GcmCipher, VaultKey};
use crate::keystore::{
    Direction, HardwareKeyStore, KeyHandle, KeyPolicy, KeyStoreError, ProviderCipher,
    SecurityTier,
};

struct SoftEntry {
    key: VaultKey,
    policy: KeyPolicy,
    generation: u64,
    invalidated: bool,
}

impl SoftEntry {
    fn handle(&self) -> KeyHandle {
        KeyHandle::new(&self.policy.alias, self.policy.tier, self.generation)
    }
}

/// Key store keeping key material in process memory.
///
/// Keys do not survive the process.
pub struct SoftwareKeyStore {
    entries: Mutex<HashMap<String, SoftEntry>>,
    secure_element: AtomicBool,
    device_locked: AtomicBool,
    fail_creation: AtomicBool,
    next_generation: AtomicU64,
    creation_attempts: Mutex<Vec<SecurityTier>>,
}

impl Default for SoftwareKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareKeyStore {
    /// A store that only offers the software tier.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            secure_element: AtomicBool::new(false),
            device_locked: AtomicBool::new(false),
            fail_creation: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            creation_attempts: Mutex::new(Vec::new()),
        }
    }

    /// A store that also accepts [`SecurityTier::HardwareIsolated`] keys.
    pub fn with_secure_element() -> Self {
        let store = Self::new();
        store.secure_element.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_secure_element_available(&self, available: bool) {
        self.secure_element.store(available, Ordering::SeqCst);
    }

    pub fn set_device_locked(&self, locked: bool) {
        debug!(locked, "Device lock state changed");
        self.device_locked.store(locked, Ordering::SeqCst);
    }

    /// Makes every subsequent `create_key` fail, whatever the tier.
    pub fn set_creation_failure(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Tiers requested from `create_key`, in call order.
    pub fn creation_attempts(&self) -> Vec<SecurityTier> {
        self.creation_attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A new biometric credential was enrolled on the device.
    ///
    /// Every key created with `invalidate_on_enrollment` becomes permanently
    /// unusable. Returns how many keys were invalidated.
    pub fn enroll_new_biometric(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for entry in entries.values_mut() {
            if entry.policy.invalidate_on_enrollment && !entry.invalidated {
                entry.invalidated = true;
                count += 1;
            }
        }
        if count > 0 {
            warn!(count, "New biometric enrollment invalidated keys");
        }
        count
    }
}

impl HardwareKeyStore for SoftwareKeyStore {
    #[instrument(level = "debug", skip(self, policy), fields(alias = %policy.alias, tier = %policy.tier))]
    fn create_key(&self, policy: &KeyPolicy) -> Result<KeyHandle, KeyStoreError> {
        self.creation_attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(policy.tier);

        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(KeyStoreError::Backend("key generation failed".into()));
        }
        if policy.tier == SecurityTier::HardwareIsolated
            && !self.secure_element.load(Ordering::SeqCst)
        {
            return Err(KeyStoreError::TierUnavailable(policy.tier));
        }
        policy.validate()?;

        let entry = SoftEntry {
            key: VaultKey::generate(),
            policy: policy.clone(),
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            invalidated: false,
        };
        let handle = entry.handle();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(policy.alias.clone(), entry);

        info!(generation = handle.generation(), "Created vault key");
        Ok(handle)
    }

    fn get_key(&self, alias: &str) -> Option<KeyHandle> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .map(SoftEntry::handle)
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyStoreError> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
            .is_some();
        debug!(alias, removed, "Deleted key entry");
        Ok(())
    }

    fn init_cipher(
        &self,
        key: &KeyHandle,
        direction: Direction,
        iv: Option<&[u8]>,
    ) -> Result<Box<dyn ProviderCipher>, KeyStoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(key.alias())
            .filter(|entry| entry.generation == key.generation())
            .ok_or_else(|| KeyStoreError::NotFound(key.alias().to_string()))?;

        if entry.invalidated {
            return Err(KeyStoreError::KeyPermanentlyInvalidated);
        }
        if entry.policy.require_unlocked_device && self.device_locked.load(Ordering::SeqCst) {
            return Err(KeyStoreError::DeviceLocked);
        }

        let cipher = GcmCipher::init(
            entry.key.clone(),
            direction,
            iv,
            entry.policy.authorization_required,
        )?;
        Ok(Box::new(cipher))
    }
}
