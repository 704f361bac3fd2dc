//! Vault key lifecycle: creation with tier fallback, lookup, liveness check
//! and deletion.

use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::VaultConfig;
use crate::keystore::{
    Direction, HardwareKeyStore, KeyHandle, KeyPolicy, KeyStoreError, SecurityTier,
};

#[derive(Debug, Error)]
pub enum KeyError {
    /// Neither tier could produce a key.
    #[error("vault key creation failed (hardware-isolated: {hardware}; software: {software})")]
    CreationFailed {
        hardware: KeyStoreError,
        software: KeyStoreError,
    },
}

/// Owns the vault key alias and every operation that touches the key entry.
pub struct KeyLifecycleManager {
    store: Arc<dyn HardwareKeyStore>,
    alias: String,
    generation_guard: Mutex<()>,
}

impl KeyLifecycleManager {
    pub fn new(store: Arc<dyn HardwareKeyStore>, alias: impl Into<String>) -> Self {
        Self {
            store,
            alias: alias.into(),
            generation_guard: Mutex::new(()),
        }
    }

    pub fn from_config(store: Arc<dyn HardwareKeyStore>, config: &VaultConfig) -> Self {
        Self::new(store, config.key_alias.clone())
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The key store this manager works against.
    pub fn store(&self) -> Arc<dyn HardwareKeyStore> {
        self.store.clone()
    }

    /// Returns the vault key, creating it if needed.
    ///
    /// Creation tries the hardware-isolated tier first and falls back once to
    /// the software tier with an otherwise identical policy. Concurrent
    /// callers are serialized, so only one of them ever generates a key.
    #[instrument(level = "debug", skip(self), fields(alias = %self.alias))]
    pub fn ensure_key(&self) -> Result<KeyHandle, KeyError> {
        let _guard = self
            .generation_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = self.store.get_key(&self.alias) {
            debug!(tier = %handle.tier(), "Vault key already present");
            return Ok(handle);
        }

        let policy = KeyPolicy::vault(&self.alias, SecurityTier::HardwareIsolated);
        let hardware = match self.store.create_key(&policy) {
            Ok(handle) => {
                info!("Created hardware-isolated vault key");
                return Ok(handle);
            }
            Err(e) => e,
        };
        warn!(error = %hardware, "Hardware-isolated key creation failed, falling back to software tier");

        match self.store.create_key(&policy.with_tier(SecurityTier::Software)) {
            Ok(handle) => {
                info!("Created software-backed vault key");
                Ok(handle)
            }
            Err(software) => {
                error!(error = %software, "Software key creation failed");
                Err(KeyError::CreationFailed { hardware, software })
            }
        }
    }

    /// Returns the existing key, if any. Never creates one.
    pub fn get_key(&self) -> Option<KeyHandle> {
        self.store.get_key(&self.alias)
    }

    /// Checks whether the key can currently initialize a cipher.
    ///
    /// The answer can be stale by the time the key is used for real.
    pub fn is_valid(&self) -> bool {
        let Some(key) = self.get_key() else {
            return false;
        };
        match self.store.init_cipher(&key, Direction::Encrypt, None) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Vault key failed liveness check");
                false
            }
        }
    }

    /// Removes the key entry. Returns false only when the store failed.
    pub fn delete_key(&self) -> bool {
        match self.store.delete_key(&self.alias) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, alias = %self.alias, "Failed to delete vault key");
                false
            }
        }
    }
}
