//! Vault configuration.

use std::path::PathBuf;

/// Alias the vault key is stored under unless configured otherwise
pub const DEFAULT_KEY_ALIAS: &str = "biovault_vault_key";

pub const KEY_ALIAS_ENV: &str = "BIOVAULT_KEY_ALIAS";
pub const STORE_PATH_ENV: &str = "BIOVAULT_STORE_PATH";
pub const TCTI_ENV: &str = "BIOVAULT_TCTI";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    /// Alias of the vault key inside the key store
    pub key_alias: String,
    /// Directory of the sled database holding the ciphertext slot.
    /// `None` means a temporary database.
    pub store_path: Option<PathBuf>,
    /// TCTI used to reach the TPM, e.g. `device:/dev/tpmrm0`.
    /// Falls back to `TPM2TOOLS_TCTI` and then tabrmd.
    pub tcti: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            store_path: None,
            tcti: None,
        }
    }
}

impl VaultConfig {
    /// Defaults overridden by `BIOVAULT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(alias) = lookup(KEY_ALIAS_ENV).filter(|a| !a.is_empty()) {
            config.key_alias = alias;
        }
        if let Some(path) = lookup(STORE_PATH_ENV).filter(|p| !p.is_empty()) {
            config.store_path = Some(PathBuf::from(path));
        }
        config.tcti = lookup(TCTI_ENV).filter(|t| !t.is_empty());
        config
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_key_alias(mut self, alias: impl Into<String>) -> Self {
        self.key_alias = alias.into();
        self
    }
}
