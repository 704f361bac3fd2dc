use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::{ExposeSecret, SecretSlice};
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keystore::{AES_256_KEY_LEN, Direction, GCM_IV_LEN, KeyStoreError, ProviderCipher};

/// Raw AES-256 key material for the vault key.
///
/// Only key store backends ever hold one of these. It never leaves the
/// backend except inside a [`GcmCipher`], which zeroizes its copy on drop.
pub struct VaultKey {
    key: SecretSlice<u8>,
}

impl VaultKey {
    pub fn generate() -> Self {
        let mut ephemeral_key = Aes256Gcm::generate_key(OsRng);
        let key_vec = ephemeral_key.as_slice().to_vec();
        ephemeral_key.as_mut_slice().zeroize();
        Self {
            key: SecretSlice::new(key_vec.into()),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, KeyStoreError> {
        if key.len() != AES_256_KEY_LEN {
            return Err(KeyStoreError::InvalidParameter(format!(
                "vault key must be {AES_256_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }
}

impl Clone for VaultKey {
    fn clone(&self) -> Self {
        Self {
            key: SecretSlice::new(self.key.expose_secret().to_vec().into()),
        }
    }
}

impl Zeroize for VaultKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for VaultKey {}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Single-use AES-256-GCM cipher handed out by the bundled key stores.
///
/// Mirrors how a platform keystore cipher behaves: the IV is fixed at
/// initialization, the transform refuses to run before authorization when
/// the key demands it, and any second `do_final` fails.
pub struct GcmCipher {
    key: VaultKey,
    direction: Direction,
    iv: [u8; GCM_IV_LEN],
    requires_authorization: bool,
    authorized: bool,
    finalized: bool,
}

impl GcmCipher {
    /// Encryption cipher with a freshly generated 96-bit IV.
    pub fn for_encrypt(key: VaultKey, requires_authorization: bool) -> Self {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut iv = [0u8; GCM_IV_LEN];
        iv.copy_from_slice(nonce.as_slice());
        Self::new(key, Direction::Encrypt, iv, requires_authorization)
    }

    /// Decryption cipher bound to the IV recorded at encryption time.
    pub fn for_decrypt(
        key: VaultKey,
        iv: &[u8],
        requires_authorization: bool,
    ) -> Result<Self, KeyStoreError> {
        let iv: [u8; GCM_IV_LEN] = iv.try_into().map_err(|_| {
            KeyStoreError::InvalidParameter(format!(
                "GCM IV must be {GCM_IV_LEN} bytes, got {}",
                iv.len()
            ))
        })?;
        Ok(Self::new(key, Direction::Decrypt, iv, requires_authorization))
    }

    /// Initializes a cipher the way the key stores need it: no IV for
    /// encryption, the stored IV for decryption.
    pub fn init(
        key: VaultKey,
        direction: Direction,
        iv: Option<&[u8]>,
        requires_authorization: bool,
    ) -> Result<Self, KeyStoreError> {
        match (direction, iv) {
            (Direction::Encrypt, None) => Ok(Self::for_encrypt(key, requires_authorization)),
            (Direction::Encrypt, Some(_)) => Err(KeyStoreError::InvalidParameter(
                "encryption IV is generated by the provider".into(),
            )),
            (Direction::Decrypt, Some(iv)) => Self::for_decrypt(key, iv, requires_authorization),
            (Direction::Decrypt, None) => Err(KeyStoreError::InvalidParameter(
                "decryption requires the stored IV".into(),
            )),
        }
    }

    fn new(
        key: VaultKey,
        direction: Direction,
        iv: [u8; GCM_IV_LEN],
        requires_authorization: bool,
    ) -> Self {
        Self {
            key,
            direction,
            iv,
            requires_authorization,
            authorized: false,
            finalized: false,
        }
    }
}

impl ProviderCipher for GcmCipher {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn iv(&self) -> &[u8] {
        &self.iv
    }

    fn requires_authorization(&self) -> bool {
        self.requires_authorization
    }

    fn is_authorized(&self) -> bool {
        self.authorized
    }

    fn grant_authorization(&mut self) {
        self.authorized = true;
    }

    fn do_final(&mut self, input: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        if self.finalized {
            return Err(KeyStoreError::AlreadyFinalized);
        }
        self.finalized = true;

        if self.requires_authorization && !self.authorized {
            return Err(KeyStoreError::UserNotAuthenticated);
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.key().expose_secret())
            .map_err(|_| KeyStoreError::InvalidParameter("bad AES-256 key length".into()))?;
        let nonce = Nonce::from_slice(&self.iv);

        trace!(direction = %self.direction, len = input.len(), "Running AES-GCM transform");
        let output = match self.direction {
            Direction::Encrypt => cipher.encrypt(nonce, input),
            Direction::Decrypt => cipher.decrypt(nonce, input),
        };
        output.map_err(|_| KeyStoreError::Aead)
    }
}
