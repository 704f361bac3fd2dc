//! Result taxonomy shared by every protocol step.

use secrecy::SecretSlice;
use std::borrow::Cow;

use crate::engine::CipherSession;

/// Reason attached to [`CryptoOutcome::OperationFailed`] when nothing is stored.
pub const NO_DATA: &str = "no data";
/// Reason attached to [`CryptoOutcome::OperationFailed`] for blank plaintext.
pub const EMPTY_INPUT: &str = "empty input";
/// Reason attached to [`CryptoOutcome::OperationFailed`] when the slot was
/// rewritten after the decryption session was prepared.
pub const DATA_CHANGED: &str = "stored data changed";

/// Outcome of a prepare or finalize step.
///
/// Exactly one variant describes every result; nothing in the protocol
/// layers panics or returns a bare error instead.
#[derive(Debug)]
pub enum CryptoOutcome {
    /// The cipher can be finalized right away.
    Ready(CipherSession),
    /// The cipher must pass step-up authorization before it is finalized.
    AuthorizationRequired(CipherSession),
    /// Encryption finished; `iv` is the one the provider bound to the session.
    Encrypted { ciphertext: Vec<u8>, iv: Vec<u8> },
    /// Decryption finished.
    Decrypted(SecretSlice<u8>),
    /// There is no vault key. Recoverable by creating one.
    KeyMissing,
    /// The vault key is permanently unusable. Anything encrypted with it is lost.
    KeyInvalidated,
    /// The key store refused because the user is not authenticated.
    UserNotAuthenticated,
    /// Transform or storage failure, with a diagnostic.
    OperationFailed(String),
}

impl CryptoOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::OperationFailed(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Encrypted { .. } | Self::Decrypted(_))
    }

    /// `KeyInvalidated` and `OperationFailed` end the attempt; the user has
    /// to start over explicitly.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::KeyInvalidated | Self::OperationFailed(_))
    }

    /// The session carried by a `Ready` or `AuthorizationRequired` outcome.
    pub fn into_session(self) -> Option<CipherSession> {
        match self {
            Self::Ready(session) | Self::AuthorizationRequired(session) => Some(session),
            _ => None,
        }
    }

    /// Message to show the user for this outcome.
    pub fn message(&self) -> Cow<'static, str> {
        match self {
            Self::Ready(_) => Cow::Borrowed("Ready"),
            Self::AuthorizationRequired(_) => Cow::Borrowed("Authentication required"),
            Self::Encrypted { .. } => Cow::Borrowed("Data encrypted and stored"),
            Self::Decrypted(_) => Cow::Borrowed("Data decrypted"),
            Self::KeyMissing => Cow::Borrowed(
                "Security key not found. Please set up biometric authentication.",
            ),
            Self::KeyInvalidated => Cow::Borrowed(
                "Security key invalidated. Stored data can no longer be recovered; reset the vault to continue.",
            ),
            Self::UserNotAuthenticated => Cow::Borrowed(
                "User not authenticated. Authenticate with your biometric credential and try again.",
            ),
            Self::OperationFailed(reason) if reason == NO_DATA => {
                Cow::Borrowed("No encrypted data to decrypt")
            }
            Self::OperationFailed(reason) if reason == EMPTY_INPUT => {
                Cow::Borrowed("Please enter text to encrypt")
            }
            Self::OperationFailed(reason) if reason == DATA_CHANGED => {
                Cow::Borrowed("Stored data changed while decrypting. Please try again.")
            }
            Self::OperationFailed(reason) => Cow::Owned(format!("Operation failed: {reason}")),
        }
    }
}
