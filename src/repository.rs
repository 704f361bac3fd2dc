//! Pairs the cipher engine with the ciphertext slot.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument};

use crate::engine::{CipherAuthorizationEngine, CipherSession};
use crate::keys::KeyLifecycleManager;
use crate::kv::{PersistentStore, StoreError};
use crate::outcome::{CryptoOutcome, DATA_CHANGED, NO_DATA};

pub struct VaultRepository {
    keys: Arc<KeyLifecycleManager>,
    engine: CipherAuthorizationEngine,
    store: Arc<dyn PersistentStore>,
    write_lock: Mutex<()>,
}

impl VaultRepository {
    pub fn new(keys: Arc<KeyLifecycleManager>, store: Arc<dyn PersistentStore>) -> Self {
        let engine = CipherAuthorizationEngine::new(keys.store());
        Self {
            keys,
            engine,
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Prepares an encryption session under the current vault key.
    pub fn prepare_encryption(&self) -> CryptoOutcome {
        match self.keys.get_key() {
            Some(key) => self.engine.prepare_encrypt(&key),
            None => CryptoOutcome::KeyMissing,
        }
    }

    /// Prepares a decryption session bound to the stored IV.
    ///
    /// Without stored data the engine is never consulted.
    pub fn prepare_decryption(&self) -> CryptoOutcome {
        let Some(stored) = self.store.get() else {
            return CryptoOutcome::failed(NO_DATA);
        };
        match self.keys.get_key() {
            Some(key) => self.engine.prepare_decrypt(&key, stored.iv()),
            None => CryptoOutcome::KeyMissing,
        }
    }

    /// Encrypts `plaintext` and replaces the stored pair.
    ///
    /// Success is only reported once the new pair has been written.
    #[instrument(level = "debug", skip_all, fields(len = plaintext.len()))]
    pub fn encrypt_and_save(&self, session: &mut CipherSession, plaintext: &[u8]) -> CryptoOutcome {
        let outcome = self.engine.finalize_encrypt(session, plaintext);
        if let CryptoOutcome::Encrypted { ciphertext, iv } = &outcome {
            if let Err(e) = self.write(ciphertext, iv) {
                error!(error = %e, "Failed to persist ciphertext");
                return CryptoOutcome::failed(format!("failed to persist ciphertext: {e}"));
            }
            info!("Stored new ciphertext");
        }
        outcome
    }

    fn write(&self, ciphertext: &[u8], iv: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.set(ciphertext, iv)
    }

    /// Decrypts the stored ciphertext. Storage is left untouched.
    ///
    /// The ciphertext is only handed to the session if it still pairs with
    /// the IV the session was prepared with; otherwise the session is left
    /// unconsumed and [`DATA_CHANGED`] is reported.
    pub fn decrypt_stored(&self, session: &mut CipherSession) -> CryptoOutcome {
        let Some(stored) = self.store.get() else {
            return CryptoOutcome::failed(NO_DATA);
        };
        if stored.iv() != session.iv() {
            debug!("Ciphertext slot rewritten since decryption was prepared");
            return CryptoOutcome::failed(DATA_CHANGED);
        }
        self.engine.finalize_decrypt(session, stored.ciphertext())
    }

    pub fn has_stored_data(&self) -> bool {
        self.store.exists()
    }

    /// Drops the stored pair.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Clearing ciphertext slot");
        self.store.clear()
    }
}
