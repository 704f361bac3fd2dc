//! Persistence of the single ciphertext slot.
//!
//! Both stores keep the pair as base64 text under two fixed keys and treat
//! anything that fails to decode as absent. [`SledStore`] is the on-disk one.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sled::{Batch, Db};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::VaultConfig;
use crate::secret::StoredCiphertext;

/// Key holding the base64 ciphertext
pub const CIPHERTEXT_KEY: &str = "encrypted_data";
/// Key holding the base64 IV
pub const IV_KEY: &str = "encryption_iv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sled::Error,
    },
    #[error(transparent)]
    Sled(#[from] sled::Error),
}

/// Read/write/clear contract for the ciphertext slot.
pub trait PersistentStore: Send + Sync {
    /// The stored pair, or `None` if either half is missing or undecodable.
    fn get(&self) -> Option<StoredCiphertext>;

    /// Replaces the stored pair. Both halves land together or not at all.
    fn set(&self, ciphertext: &[u8], iv: &[u8]) -> Result<(), StoreError>;

    /// Removes both halves.
    fn clear(&self) -> Result<(), StoreError>;

    /// True iff both halves are present.
    fn exists(&self) -> bool;
}

fn decode_pair(ciphertext: &[u8], iv: &[u8]) -> Option<StoredCiphertext> {
    match (STANDARD.decode(ciphertext), STANDARD.decode(iv)) {
        (Ok(ciphertext), Ok(iv)) => Some(StoredCiphertext::new(ciphertext, iv)),
        _ => {
            warn!("Stored ciphertext is not valid base64, treating slot as empty");
            None
        }
    }
}

/// Slot kept in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<&'static str, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a raw text value, bypassing encoding.
    pub fn put_raw(&self, key: &'static str, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.into());
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self) -> Option<StoredCiphertext> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let ciphertext = values.get(CIPHERTEXT_KEY)?;
        let iv = values.get(IV_KEY)?;
        decode_pair(ciphertext.as_bytes(), iv.as_bytes())
    }

    fn set(&self, ciphertext: &[u8], iv: &[u8]) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(CIPHERTEXT_KEY, STANDARD.encode(ciphertext));
        values.insert(IV_KEY, STANDARD.encode(iv));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(CIPHERTEXT_KEY);
        values.remove(IV_KEY);
        Ok(())
    }

    fn exists(&self) -> bool {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.contains_key(CIPHERTEXT_KEY) && values.contains_key(IV_KEY)
    }
}

/// Slot persisted in a sled database.
///
/// Writes go through a single atomic batch; the mutex additionally keeps a
/// read of the two keys from interleaving with a write.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Mutex<Db>>,
}

impl SledStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        match sled::open(path) {
            Ok(db) => Ok(Self::from_db(db)),
            Err(e) => {
                error!("Failed to open sled database at {:?}: {}", path, e);
                Err(StoreError::Open {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        }
    }

    /// Opens the configured path, or a throwaway database when none is set.
    pub fn from_config(config: &VaultConfig) -> Result<Self, StoreError> {
        match &config.store_path {
            Some(path) => Self::open(path),
            None => Self::temporary(),
        }
    }

    /// A database deleted when the last handle is dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    pub fn from_db(db: Db) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Returns a reference to the underlying sled database.
    pub fn db(&self) -> Arc<Mutex<Db>> {
        self.db.clone()
    }
}

impl PersistentStore for SledStore {
    fn get(&self) -> Option<StoredCiphertext> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let read = |key: &str| match db.get(key) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, key, "Failed to read ciphertext slot");
                None
            }
        };
        let ciphertext = read(CIPHERTEXT_KEY)?;
        let iv = read(IV_KEY)?;
        decode_pair(&ciphertext, &iv)
    }

    fn set(&self, ciphertext: &[u8], iv: &[u8]) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = Batch::default();
        batch.insert(CIPHERTEXT_KEY, STANDARD.encode(ciphertext).into_bytes());
        batch.insert(IV_KEY, STANDARD.encode(iv).into_bytes());
        db.apply_batch(batch)?;
        db.flush()?;
        debug!(len = ciphertext.len(), "Persisted ciphertext slot");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = Batch::default();
        batch.remove(CIPHERTEXT_KEY);
        batch.remove(IV_KEY);
        db.apply_batch(batch)?;
        db.flush()?;
        Ok(())
    }

    fn exists(&self) -> bool {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(
            (db.contains_key(CIPHERTEXT_KEY), db.contains_key(IV_KEY)),
            (Ok(true), Ok(true))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn PersistentStore) {
        assert!(!store.exists());
        assert!(store.get().is_none());

        store.set(b"ciphertext", b"iv-bytes").unwrap();
        assert!(store.exists());
        let stored = store.get().unwrap();
        assert_eq!(stored.ciphertext(), b"ciphertext");
        assert_eq!(stored.iv(), b"iv-bytes");

        store.set(b"second", b"iv-2").unwrap();
        assert_eq!(
            store.get(),
            Some(StoredCiphertext::new(b"second".to_vec(), b"iv-2".to_vec()))
        );

        store.clear().unwrap();
        assert!(!store.exists());
        assert!(store.get().is_none());
        // clearing twice is harmless
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store_contract() {
        exercise(&SledStore::temporary().unwrap());
    }

    #[test]
    fn test_values_are_base64_text() {
        let store = SledStore::temporary().unwrap();
        store.set(&[0xff, 0x00, 0x10], &[1, 2, 3]).unwrap();

        let db = store.db();
        let db = db.lock().unwrap();
        let raw = db.get(CIPHERTEXT_KEY).unwrap().unwrap();
        assert_eq!(&raw[..], b"/wAQ");
        let raw = db.get(IV_KEY).unwrap().unwrap();
        assert_eq!(&raw[..], b"AQID");
    }

    #[test]
    fn test_undecodable_values_read_as_absent() {
        let store = SledStore::temporary().unwrap();
        store.set(b"ciphertext", b"iv").unwrap();
        store
            .db()
            .lock()
            .unwrap()
            .insert(IV_KEY, "%%% not base64 %%%".as_bytes())
            .unwrap();
        assert!(store.get().is_none());

        let memory = MemoryStore::new();
        memory.put_raw(CIPHERTEXT_KEY, "Y2lwaGVy");
        memory.put_raw(IV_KEY, "!!");
        assert!(memory.get().is_none());
    }

    #[test]
    fn test_half_a_pair_is_not_data() {
        let memory = MemoryStore::new();
        memory.put_raw(CIPHERTEXT_KEY, "Y2lwaGVy");
        assert!(!memory.exists());
        assert!(memory.get().is_none());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.set(b"persisted", b"iv").unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get().unwrap().ciphertext(), b"persisted");
    }
}
