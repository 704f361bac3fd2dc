//! The assembled vault: one key, one ciphertext slot, one authorizer.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::auth::{AuthenticatorStatus, StepUpAuthorizer};
use crate::config::VaultConfig;
use crate::keys::{KeyError, KeyLifecycleManager};
use crate::keystore::{HardwareKeyStore, KeyHandle};
use crate::kv::{PersistentStore, StoreError};
use crate::repository::VaultRepository;
use crate::workflow::{DecryptWorkflow, EncryptWorkflow, WorkflowOutcome};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to delete vault key {0}")]
    DeleteFailed(String),
}

/// Entry point tying the vault together.
pub struct SecureVault {
    keys: Arc<KeyLifecycleManager>,
    repository: Arc<VaultRepository>,
    encrypt: EncryptWorkflow,
    decrypt: DecryptWorkflow,
    authorizer: Arc<dyn StepUpAuthorizer>,
}

impl SecureVault {
    /// Builds the vault and makes sure its key exists.
    #[instrument(level = "debug", skip_all, fields(alias = %config.key_alias))]
    pub fn open(
        config: &VaultConfig,
        key_store: Arc<dyn HardwareKeyStore>,
        store: Arc<dyn PersistentStore>,
        authorizer: Arc<dyn StepUpAuthorizer>,
    ) -> Result<Self, KeyError> {
        let keys = Arc::new(KeyLifecycleManager::from_config(key_store, config));
        let key = keys.ensure_key()?;
        info!(tier = %key.tier(), "Vault opened");

        let repository = Arc::new(VaultRepository::new(keys.clone(), store));
        Ok(Self {
            encrypt: EncryptWorkflow::new(repository.clone()),
            decrypt: DecryptWorkflow::new(repository.clone()),
            keys,
            repository,
            authorizer,
        })
    }

    /// Encrypts `plaintext` into the slot, replacing whatever was there.
    pub async fn encrypt(&self, plaintext: &str) -> WorkflowOutcome {
        self.encrypt.run(plaintext, self.authorizer.as_ref()).await
    }

    /// Decrypts the slot.
    pub async fn decrypt(&self) -> WorkflowOutcome {
        self.decrypt.run(self.authorizer.as_ref()).await
    }

    pub fn has_stored_data(&self) -> bool {
        self.repository.has_stored_data()
    }

    pub fn key_is_valid(&self) -> bool {
        self.keys.is_valid()
    }

    pub fn key(&self) -> Option<KeyHandle> {
        self.keys.get_key()
    }

    pub fn authenticator_status(&self) -> AuthenticatorStatus {
        self.authorizer.availability()
    }

    pub fn encrypt_workflow(&self) -> &EncryptWorkflow {
        &self.encrypt
    }

    pub fn decrypt_workflow(&self) -> &DecryptWorkflow {
        &self.decrypt
    }

    /// Recovers from an invalidated key.
    ///
    /// Deletes the key, drops the stored ciphertext (it can never be
    /// decrypted again) and creates a fresh key.
    #[instrument(level = "debug", skip(self), fields(alias = %self.keys.alias()))]
    pub fn reset(&self) -> Result<KeyHandle, VaultError> {
        warn!("Resetting vault, stored data will be lost");
        if !self.keys.delete_key() {
            return Err(VaultError::DeleteFailed(self.keys.alias().to_string()));
        }
        self.repository.clear()?;
        Ok(self.keys.ensure_key()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationOutcome, DenialReason};
    use crate::engine::CipherSession;
    use crate::kv::MemoryStore;
    use crate::outcome::CryptoOutcome;
    use crate::soft::SoftwareKeyStore;
    use async_trait::async_trait;

    struct Approve;

    #[async_trait]
    impl StepUpAuthorizer for Approve {
        async fn authorize(&self, session: CipherSession) -> AuthorizationOutcome {
            AuthorizationOutcome::Authorized(session)
        }
    }

    fn open(key_store: &Arc<SoftwareKeyStore>) -> SecureVault {
        SecureVault::open(
            &VaultConfig::default(),
            key_store.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(Approve),
        )
        .unwrap()
    }

    #[test]
    fn test_open_creates_key() {
        let key_store = Arc::new(SoftwareKeyStore::new());
        let vault = open(&key_store);
        assert!(vault.key_is_valid());
        assert_eq!(vault.key().unwrap().alias(), crate::config::DEFAULT_KEY_ALIAS);
        assert!(!vault.has_stored_data());
        assert!(vault.authenticator_status().is_available());
    }

    #[test]
    fn test_open_fails_when_no_tier_works() {
        let key_store = Arc::new(SoftwareKeyStore::new());
        key_store.set_creation_failure(true);
        let result = SecureVault::open(
            &VaultConfig::default(),
            key_store,
            Arc::new(MemoryStore::new()),
            Arc::new(Approve),
        );
        assert!(matches!(result, Err(KeyError::CreationFailed { .. })));
    }

    #[tokio::test]
    async fn test_reset_after_invalidation() {
        let key_store = Arc::new(SoftwareKeyStore::new());
        let vault = open(&key_store);
        assert!(vault.encrypt("secret-note").await.is_success());

        key_store.enroll_new_biometric();
        assert!(!vault.key_is_valid());
        assert!(matches!(
            vault.decrypt().await,
            WorkflowOutcome::Completed(CryptoOutcome::KeyInvalidated)
        ));

        let old = vault.key().unwrap();
        let fresh = vault.reset().unwrap();
        assert_ne!(old.generation(), fresh.generation());
        assert!(vault.key_is_valid());
        assert!(!vault.has_stored_data());
        match vault.decrypt().await {
            WorkflowOutcome::Completed(outcome) => {
                assert_eq!(outcome.message(), "No encrypted data to decrypt")
            }
            WorkflowOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        }
    }

    #[tokio::test]
    async fn test_denial_leaves_slot_untouched() {
        struct Refuse;

        #[async_trait]
        impl StepUpAuthorizer for Refuse {
            async fn authorize(&self, _session: CipherSession) -> AuthorizationOutcome {
                AuthorizationOutcome::Denied(DenialReason::UserCancelled)
            }
        }

        let vault = SecureVault::open(
            &VaultConfig::default(),
            Arc::new(SoftwareKeyStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(Refuse),
        )
        .unwrap();
        assert!(matches!(
            vault.encrypt("secret-note").await,
            WorkflowOutcome::Denied(DenialReason::UserCancelled)
        ));
        assert!(!vault.has_stored_data());
    }
}
