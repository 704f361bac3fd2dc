//! Single-slot secret vault.
//!
//! One AES-256-GCM key lives in a [`HardwareKeyStore`], preferably on the
//! hardware-isolated tier. Every cipher under that key needs a step-up
//! authorization before it transforms anything, and one ciphertext slot
//! holds the latest encrypted secret.
//!
//! [`SecureVault`] wires the pieces together; the lower layers
//! ([`KeyLifecycleManager`], [`CipherAuthorizationEngine`],
//! [`VaultRepository`], the workflows) are public for callers that drive the
//! prepare/authorize/finalize protocol themselves.

pub mod auth;
pub mod config;
pub mod crypt;
pub mod engine;
pub mod keys;
pub mod keystore;
pub mod kv;
pub mod outcome;
pub mod repository;
pub mod secret;
pub mod soft;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod vault;
pub mod workflow;

pub use auth::{
    AuthenticatorStatus, AuthorizationOutcome, AuthorizationPrompt, ChannelAuthorizer,
    DenialReason, StepUpAuthorizer, step_up,
};
pub use config::VaultConfig;
pub use engine::{CipherAuthorizationEngine, CipherSession};
pub use keys::{KeyError, KeyLifecycleManager};
pub use keystore::{
    Direction, HardwareKeyStore, KeyHandle, KeyPolicy, KeyStoreError, ProviderCipher,
    SecurityTier, TieredKeyStore,
};
pub use kv::{MemoryStore, PersistentStore, SledStore, StoreError};
pub use outcome::CryptoOutcome;
pub use repository::VaultRepository;
pub use secret::StoredCiphertext;
pub use soft::SoftwareKeyStore;
#[cfg(feature = "tpm")]
pub use tpm::TpmKeyStore;
pub use vault::{SecureVault, VaultError};
pub use workflow::{DecryptWorkflow, EncryptWorkflow, WorkflowOutcome};
