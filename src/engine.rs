//! Two-phase cipher authorization.
//!
//! `prepare_*` asks the key store for a cipher and classifies the answer;
//! `finalize_*` runs the transform on a session that has been authorized
//! (or never needed to be). Nothing here retries: a session that failed is
//! gone, and the caller starts again from `prepare_*`.

use secrecy::SecretSlice;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::keystore::{Direction, HardwareKeyStore, KeyHandle, KeyStoreError, ProviderCipher};
use crate::outcome::CryptoOutcome;

/// A single-use, direction-bound cipher context.
///
/// Produced by a prepare call and consumed by exactly one finalize call. It
/// cannot be cloned; once a finalize has been attempted the session refuses
/// any further use.
pub struct CipherSession {
    cipher: Box<dyn ProviderCipher>,
    key: KeyHandle,
    consumed: bool,
}

impl CipherSession {
    fn new(cipher: Box<dyn ProviderCipher>, key: KeyHandle) -> Self {
        Self {
            cipher,
            key,
            consumed: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.cipher.direction()
    }

    /// IV bound to this session by the provider.
    pub fn iv(&self) -> &[u8] {
        self.cipher.iv()
    }

    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn requires_authorization(&self) -> bool {
        self.cipher.requires_authorization()
    }

    pub fn is_authorized(&self) -> bool {
        !self.cipher.requires_authorization() || self.cipher.is_authorized()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Marks the session as authorized.
    ///
    /// Reached from outside the crate only through
    /// [`step_up`](crate::auth::step_up), after an authorizer approved this
    /// very session.
    pub(crate) fn authorize(mut self) -> Self {
        self.cipher.grant_authorization();
        self
    }

    fn finish(&mut self, direction: Direction, input: &[u8]) -> Result<Vec<u8>, CryptoOutcome> {
        if self.consumed {
            warn!(%direction, "Refusing to reuse a consumed cipher session");
            return Err(CryptoOutcome::failed("cipher session already consumed"));
        }
        if self.direction() != direction {
            let err = KeyStoreError::WrongDirection {
                expected: self.direction(),
                requested: direction,
            };
            return Err(CryptoOutcome::failed(err.to_string()));
        }
        self.consumed = true;
        self.cipher.do_final(input).map_err(classify)
    }
}

impl fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSession")
            .field("direction", &self.direction())
            .field("key", &self.key)
            .field("authorized", &self.is_authorized())
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

/// Maps a key store error onto the outcome taxonomy.
fn classify(err: KeyStoreError) -> CryptoOutcome {
    match err {
        KeyStoreError::KeyPermanentlyInvalidated => CryptoOutcome::KeyInvalidated,
        KeyStoreError::UserNotAuthenticated | KeyStoreError::DeviceLocked => {
            CryptoOutcome::UserNotAuthenticated
        }
        KeyStoreError::NotFound(_) => CryptoOutcome::KeyMissing,
        other => CryptoOutcome::failed(other.to_string()),
    }
}

/// Produces cipher sessions and finalizes them.
#[derive(Clone)]
pub struct CipherAuthorizationEngine {
    store: Arc<dyn HardwareKeyStore>,
}

impl CipherAuthorizationEngine {
    pub fn new(store: Arc<dyn HardwareKeyStore>) -> Self {
        Self { store }
    }

    /// Prepares an encryption session. The provider picks the IV.
    pub fn prepare_encrypt(&self, key: &KeyHandle) -> CryptoOutcome {
        self.prepare(key, Direction::Encrypt, None)
    }

    /// Prepares a decryption session bound to the IV recorded at encryption.
    pub fn prepare_decrypt(&self, key: &KeyHandle, iv: &[u8]) -> CryptoOutcome {
        self.prepare(key, Direction::Decrypt, Some(iv))
    }

    fn prepare(&self, key: &KeyHandle, direction: Direction, iv: Option<&[u8]>) -> CryptoOutcome {
        match self.store.init_cipher(key, direction, iv) {
            Ok(cipher) => {
                let session = CipherSession::new(cipher, key.clone());
                if session.requires_authorization() {
                    debug!(%direction, "Cipher needs step-up authorization");
                    CryptoOutcome::AuthorizationRequired(session)
                } else {
                    CryptoOutcome::Ready(session)
                }
            }
            Err(e) => {
                warn!(%direction, error = %e, "Cipher initialization failed");
                classify(e)
            }
        }
    }

    /// Encrypts `plaintext` with an authorized session.
    pub fn finalize_encrypt(&self, session: &mut CipherSession, plaintext: &[u8]) -> CryptoOutcome {
        match session.finish(Direction::Encrypt, plaintext) {
            Ok(ciphertext) => CryptoOutcome::Encrypted {
                ciphertext,
                iv: session.iv().to_vec(),
            },
            Err(outcome) => outcome,
        }
    }

    /// Decrypts `ciphertext` with an authorized session.
    pub fn finalize_decrypt(&self, session: &mut CipherSession, ciphertext: &[u8]) -> CryptoOutcome {
        match session.finish(Direction::Decrypt, ciphertext) {
            Ok(plaintext) => CryptoOutcome::Decrypted(SecretSlice::new(plaintext.into())),
            Err(outcome) => outcome,
        }
    }
}
