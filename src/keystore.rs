//! Key store abstraction.
//!
//! A [`HardwareKeyStore`] owns the vault key material. Callers only ever see
//! an opaque [`KeyHandle`], and the only thing they can do with it is ask the
//! store for a [`ProviderCipher`] bound to that key.
//!
//! Two tiers exist: [`SecurityTier::HardwareIsolated`] (TPM, secure element)
//! and [`SecurityTier::Software`]. [`TieredKeyStore`] routes each tier to its
//! own backend so a single store can serve both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// AES-256 key length in bytes
pub const AES_256_KEY_LEN: usize = 32;
/// GCM authentication tag length in bits
pub const GCM_TAG_BITS: u16 = 128;
/// GCM initialization vector length in bytes (96-bit nonce)
pub const GCM_IV_LEN: usize = 12;

/// Isolation strength of key storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityTier {
    /// Key lives inside an isolated secure element (TPM, StrongBox, ...)
    HardwareIsolated,
    /// Key is protected by the general-purpose software key store
    Software,
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareIsolated => write!(f, "hardware-isolated"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// Direction a cipher is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypt => write!(f, "encrypt"),
            Self::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// Generation parameters for the vault key.
///
/// Both tiers share the same policy, only `tier` differs between the
/// preferred attempt and the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub alias: String,
    /// Key size in bits, always 256 for the vault key
    pub key_bits: u16,
    /// GCM tag size in bits
    pub tag_bits: u16,
    /// Every cipher needs a step-up authorization before it can transform data
    pub authorization_required: bool,
    pub tier: SecurityTier,
    /// Enrolling a new biometric credential permanently invalidates the key
    pub invalidate_on_enrollment: bool,
    /// Ciphers can only be initialized while the device is unlocked
    pub require_unlocked_device: bool,
}

impl KeyPolicy {
    /// The vault key policy: AES-256-GCM, no padding, authorization per use,
    /// invalidated by new enrollments, usable only on an unlocked device.
    pub fn vault(alias: impl Into<String>, tier: SecurityTier) -> Self {
        Self {
            alias: alias.into(),
            key_bits: 256,
            tag_bits: GCM_TAG_BITS,
            authorization_required: true,
            tier,
            invalidate_on_enrollment: true,
            require_unlocked_device: true,
        }
    }

    /// Same policy on a different tier.
    pub fn with_tier(&self, tier: SecurityTier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }

    /// Checks the policy describes something the AES-GCM provider can honour.
    pub fn validate(&self) -> Result<(), KeyStoreError> {
        if self.key_bits as usize != AES_256_KEY_LEN * 8 {
            return Err(KeyStoreError::InvalidParameter(format!(
                "unsupported key size {} bits",
                self.key_bits
            )));
        }
        if self.tag_bits != GCM_TAG_BITS {
            return Err(KeyStoreError::InvalidParameter(format!(
                "unsupported GCM tag size {} bits",
                self.tag_bits
            )));
        }
        if self.alias.is_empty() {
            return Err(KeyStoreError::InvalidParameter("empty key alias".into()));
        }
        Ok(())
    }
}

/// Opaque reference to a key living inside a [`HardwareKeyStore`].
///
/// The generation changes every time a key is (re)created under the same
/// alias, so a handle to a deleted key never resolves to its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    alias: String,
    tier: SecurityTier,
    generation: u64,
}

impl KeyHandle {
    pub fn new(alias: impl Into<String>, tier: SecurityTier, generation: u64) -> Self {
        Self {
            alias: alias.into(),
            tier,
            generation,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn tier(&self) -> SecurityTier {
        self.tier
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Errors reported by key store backends.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no key stored under alias {0:?}")]
    NotFound(String),
    #[error("{0} security tier is not available on this device")]
    TierUnavailable(SecurityTier),
    #[error("key has been permanently invalidated")]
    KeyPermanentlyInvalidated,
    #[error("user has not been authenticated for this key")]
    UserNotAuthenticated,
    #[error("device must be unlocked to use this key")]
    DeviceLocked,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("cipher has already been finalized")]
    AlreadyFinalized,
    #[error("cipher was initialized for {expected}, not {requested}")]
    WrongDirection {
        expected: Direction,
        requested: Direction,
    },
    #[error("AES-GCM transform failed (wrong key, wrong IV or tampered data)")]
    Aead,
    #[error("key store backend failure: {0}")]
    Backend(String),
    #[cfg(feature = "tpm")]
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[cfg(feature = "tpm")]
    #[error(transparent)]
    Tpm(#[from] tss_esapi::Error),
}

/// A cipher initialized by a key store, ready for a single `do_final`.
///
/// Implementations enforce authorization themselves: a cipher whose key
/// requires step-up refuses to transform until [`grant_authorization`]
/// has been called.
///
/// [`grant_authorization`]: ProviderCipher::grant_authorization
pub trait ProviderCipher: Send {
    fn direction(&self) -> Direction;

    /// IV bound at initialization (generated for encryption, supplied for decryption)
    fn iv(&self) -> &[u8];

    fn requires_authorization(&self) -> bool;

    fn is_authorized(&self) -> bool;

    /// Called once the user passed step-up authorization for this cipher.
    fn grant_authorization(&mut self);

    /// Runs the transform. Must fail on every call after the first.
    fn do_final(&mut self, input: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
}

/// Durable, tamper-resistant store of named symmetric keys.
pub trait HardwareKeyStore: Send + Sync {
    /// Generates a key according to `policy`, replacing any key under the same alias.
    fn create_key(&self, policy: &KeyPolicy) -> Result<KeyHandle, KeyStoreError>;

    /// Looks up a key; never creates one.
    fn get_key(&self, alias: &str) -> Option<KeyHandle>;

    /// Removes a key. Removing a missing key is not an error.
    fn delete_key(&self, alias: &str) -> Result<(), KeyStoreError>;

    /// Initializes a cipher under `key`.
    ///
    /// Encryption must be called without an IV (the provider generates one),
    /// decryption with the IV recorded at encryption time.
    fn init_cipher(
        &self,
        key: &KeyHandle,
        direction: Direction,
        iv: Option<&[u8]>,
    ) -> Result<Box<dyn ProviderCipher>, KeyStoreError>;
}

/// Routes each [`SecurityTier`] to a dedicated backend.
///
/// Used to pair a TPM-backed store with a software store so that the
/// fallback tier stays available when the secure element is not.
pub struct TieredKeyStore {
    hardware: Arc<dyn HardwareKeyStore>,
    software: Arc<dyn HardwareKeyStore>,
}

impl TieredKeyStore {
    pub fn new(hardware: Arc<dyn HardwareKeyStore>, software: Arc<dyn HardwareKeyStore>) -> Self {
        Self { hardware, software }
    }

    fn backend(&self, tier: SecurityTier) -> &Arc<dyn HardwareKeyStore> {
        match tier {
            SecurityTier::HardwareIsolated => &self.hardware,
            SecurityTier::Software => &self.software,
        }
    }
}

impl HardwareKeyStore for TieredKeyStore {
    fn create_key(&self, policy: &KeyPolicy) -> Result<KeyHandle, KeyStoreError> {
        let handle = self.backend(policy.tier).create_key(policy)?;
        // one alias, one key: drop whatever the other tier still holds
        let other = match policy.tier {
            SecurityTier::HardwareIsolated => SecurityTier::Software,
            SecurityTier::Software => SecurityTier::HardwareIsolated,
        };
        if let Err(e) = self.backend(other).delete_key(&policy.alias) {
            warn!(error = %e, tier = %other, "Failed to remove stale key from other tier");
        }
        Ok(handle)
    }

    fn get_key(&self, alias: &str) -> Option<KeyHandle> {
        self.hardware
            .get_key(alias)
            .or_else(|| self.software.get_key(alias))
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyStoreError> {
        debug!(alias, "Deleting key from both tiers");
        let hardware = self.hardware.delete_key(alias);
        let software = self.software.delete_key(alias);
        hardware.and(software)
    }

    fn init_cipher(
        &self,
        key: &KeyHandle,
        direction: Direction,
        iv: Option<&[u8]>,
    ) -> Result<Box<dyn ProviderCipher>, KeyStoreError> {
        self.backend(key.tier()).init_cipher(key, direction, iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftwareKeyStore;

    #[test]
    fn test_vault_policy_defaults() {
        let policy = KeyPolicy::vault("vault", SecurityTier::HardwareIsolated);
        assert_eq!(policy.key_bits, 256);
        assert_eq!(policy.tag_bits, 128);
        assert!(policy.authorization_required);
        assert!(policy.invalidate_on_enrollment);
        assert!(policy.require_unlocked_device);
        assert!(policy.validate().is_ok());

        let fallback = policy.with_tier(SecurityTier::Software);
        assert_eq!(fallback.tier, SecurityTier::Software);
        assert_eq!(fallback.with_tier(SecurityTier::HardwareIsolated), policy);
    }

    #[test]
    fn test_policy_rejects_other_key_sizes() {
        let mut policy = KeyPolicy::vault("vault", SecurityTier::Software);
        policy.key_bits = 128;
        assert!(matches!(
            policy.validate(),
            Err(KeyStoreError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_tiered_store_routes_by_tier() {
        let hardware = Arc::new(SoftwareKeyStore::with_secure_element());
        let software = Arc::new(SoftwareKeyStore::new());
        let tiered = TieredKeyStore::new(hardware.clone(), software.clone());

        let handle = tiered
            .create_key(&KeyPolicy::vault("vault", SecurityTier::Software))
            .unwrap();
        assert_eq!(handle.tier(), SecurityTier::Software);
        assert!(software.get_key("vault").is_some());
        assert!(hardware.get_key("vault").is_none());

        // recreating on the hardware tier evicts the software copy
        let handle = tiered
            .create_key(&KeyPolicy::vault("vault", SecurityTier::HardwareIsolated))
            .unwrap();
        assert_eq!(tiered.get_key("vault"), Some(handle.clone()));
        assert!(software.get_key("vault").is_none());

        let cipher = tiered.init_cipher(&handle, Direction::Encrypt, None).unwrap();
        assert_eq!(cipher.iv().len(), GCM_IV_LEN);

        tiered.delete_key("vault").unwrap();
        assert!(tiered.get_key("vault").is_none());
    }
}
