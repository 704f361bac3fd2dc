//! Step-up authorization contract.
//!
//! The authorizer receives a pending [`CipherSession`] and hands it back
//! authorized, or refuses with a [`DenialReason`]. The wait is an `await`:
//! dropping the future cancels the request, and the session inside is
//! dropped with it.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::engine::CipherSession;
use crate::keystore::Direction;

/// Why the user did not get through step-up authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The user dismissed the prompt, or the request was cancelled
    UserCancelled,
    /// Too many failed attempts, temporarily locked out
    Lockout,
    /// Biometrics are locked until the device credential is used
    LockoutPermanent,
    NoCredentialsEnrolled,
    /// The device has no biometric hardware at all
    NoHardware,
    /// The hardware exists but cannot be used right now
    HardwareUnavailable,
    Other(String),
}

impl DenialReason {
    pub fn message(&self) -> &str {
        match self {
            Self::UserCancelled => "Authentication cancelled",
            Self::Lockout => "Too many attempts. Try again later.",
            Self::LockoutPermanent => "Biometric permanently locked. Use device credentials.",
            Self::NoCredentialsEnrolled => "No biometric credentials enrolled",
            Self::NoHardware => "Biometric hardware not available",
            Self::HardwareUnavailable => "Biometric hardware unavailable",
            Self::Other(message) => message,
        }
    }
}

/// Result of a step-up authorization.
#[derive(Debug)]
pub enum AuthorizationOutcome {
    /// The same session, now allowed to finalize
    Authorized(CipherSession),
    Denied(DenialReason),
}

/// Whether the authenticator can currently be used at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatorStatus {
    Available,
    NoHardware,
    HardwareUnavailable,
    NoneEnrolled,
    SecurityUpdateRequired,
    Unknown,
}

impl AuthenticatorStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Message explaining why authentication is not possible, if it is not.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::NoHardware => Some("Biometric hardware not available on this device"),
            Self::HardwareUnavailable => Some("Biometric hardware is currently unavailable"),
            Self::NoneEnrolled => Some(
                "No biometric credentials enrolled. Please set up fingerprint or face unlock in device settings.",
            ),
            Self::SecurityUpdateRequired => {
                Some("Security update required for biometric authentication")
            }
            Self::Unknown => Some("Biometric authentication status unknown"),
        }
    }
}

/// Performs the out-of-band user check that unlocks a cipher session.
#[async_trait]
pub trait StepUpAuthorizer: Send + Sync {
    /// Verifies the user for `session`.
    ///
    /// On success, hand the same session back in
    /// [`AuthorizationOutcome::Authorized`]. Call this through [`step_up`],
    /// which is what unlocks the session for finalizing.
    async fn authorize(&self, session: CipherSession) -> AuthorizationOutcome;

    fn availability(&self) -> AuthenticatorStatus {
        AuthenticatorStatus::Available
    }
}

/// Runs `authorizer` for `session`.
///
/// This is the only way to unlock a session outside this crate: a session
/// becomes finalizable once an authorizer has returned it as authorized.
pub async fn step_up(
    authorizer: &dyn StepUpAuthorizer,
    session: CipherSession,
) -> AuthorizationOutcome {
    match authorizer.authorize(session).await {
        AuthorizationOutcome::Authorized(session) => {
            AuthorizationOutcome::Authorized(session.authorize())
        }
        denied => denied,
    }
}

/// A pending authorization request, as seen by the UI side.
///
/// Dropping the prompt without answering counts as a cancellation.
#[derive(Debug)]
pub struct AuthorizationPrompt {
    session: CipherSession,
    reply: oneshot::Sender<AuthorizationOutcome>,
}

impl AuthorizationPrompt {
    pub fn direction(&self) -> Direction {
        self.session.direction()
    }

    /// The requester has gone away; answering is pointless.
    pub fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
    }

    /// The user passed the check. Returns false if the requester already
    /// cancelled, in which case the session is discarded.
    pub fn approve(self) -> bool {
        let session = self.session.authorize();
        let delivered = self.reply.send(AuthorizationOutcome::Authorized(session)).is_ok();
        if !delivered {
            debug!("Authorization approved after cancellation, discarding session");
        }
        delivered
    }

    /// The user did not pass the check.
    pub fn deny(self, reason: DenialReason) -> bool {
        self.reply.send(AuthorizationOutcome::Denied(reason)).is_ok()
    }
}

/// Authorizer that forwards each request to a UI task over a channel.
#[derive(Clone)]
pub struct ChannelAuthorizer {
    prompts: mpsc::Sender<AuthorizationPrompt>,
    status: AuthenticatorStatus,
}

impl ChannelAuthorizer {
    /// Returns the authorizer and the receiving end the UI task listens on.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AuthorizationPrompt>) {
        let (prompts, rx) = mpsc::channel(buffer);
        (
            Self {
                prompts,
                status: AuthenticatorStatus::Available,
            },
            rx,
        )
    }

    pub fn with_status(mut self, status: AuthenticatorStatus) -> Self {
        self.status = status;
        self
    }
}

#[async_trait]
impl StepUpAuthorizer for ChannelAuthorizer {
    async fn authorize(&self, session: CipherSession) -> AuthorizationOutcome {
        if !self.status.is_available() {
            return AuthorizationOutcome::Denied(match self.status {
                AuthenticatorStatus::NoneEnrolled => DenialReason::NoCredentialsEnrolled,
                AuthenticatorStatus::NoHardware => DenialReason::NoHardware,
                _ => DenialReason::HardwareUnavailable,
            });
        }

        let (reply, response) = oneshot::channel();
        let prompt = AuthorizationPrompt { session, reply };
        if self.prompts.send(prompt).await.is_err() {
            warn!("Authorization UI is gone");
            return AuthorizationOutcome::Denied(DenialReason::HardwareUnavailable);
        }

        match response.await {
            Ok(outcome) => outcome,
            // prompt dropped unanswered
            Err(_) => AuthorizationOutcome::Denied(DenialReason::UserCancelled),
        }
    }

    fn availability(&self) -> AuthenticatorStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CipherAuthorizationEngine;
    use crate::keystore::{HardwareKeyStore, KeyPolicy, SecurityTier};
    use crate::soft::SoftwareKeyStore;
    use std::sync::Arc;

    fn pending_session() -> CipherSession {
        let store = Arc::new(SoftwareKeyStore::new());
        let key = store
            .create_key(&KeyPolicy::vault("vault", SecurityTier::Software))
            .unwrap();
        CipherAuthorizationEngine::new(store)
            .prepare_encrypt(&key)
            .into_session()
            .unwrap()
    }

    #[test]
    fn test_denial_messages_are_distinct() {
        let reasons = [
            DenialReason::UserCancelled,
            DenialReason::Lockout,
            DenialReason::LockoutPermanent,
            DenialReason::NoCredentialsEnrolled,
            DenialReason::NoHardware,
            DenialReason::HardwareUnavailable,
        ];
        let mut messages: Vec<_> = reasons.iter().map(DenialReason::message).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), reasons.len());
        assert_eq!(DenialReason::Other("sensor dirty".into()).message(), "sensor dirty");
    }

    #[tokio::test]
    async fn test_step_up_unlocks_returned_session() {
        struct Approve;

        #[async_trait]
        impl StepUpAuthorizer for Approve {
            async fn authorize(&self, session: CipherSession) -> AuthorizationOutcome {
                AuthorizationOutcome::Authorized(session)
            }
        }

        let session = pending_session();
        assert!(!session.is_authorized());
        match step_up(&Approve, session).await {
            AuthorizationOutcome::Authorized(session) => assert!(session.is_authorized()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_hardware_is_its_own_denial() {
        let (authorizer, _prompts) = ChannelAuthorizer::channel(1);
        let authorizer = authorizer.with_status(AuthenticatorStatus::NoHardware);
        match authorizer.authorize(pending_session()).await {
            AuthorizationOutcome::Denied(reason) => {
                assert_eq!(reason, DenialReason::NoHardware);
                assert_eq!(reason.message(), "Biometric hardware not available");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_status_messages() {
        assert!(AuthenticatorStatus::Available.message().is_none());
        assert!(AuthenticatorStatus::Available.is_available());
        assert!(!AuthenticatorStatus::NoneEnrolled.is_available());
        assert!(AuthenticatorStatus::NoneEnrolled.message().is_some());
    }

    #[tokio::test]
    async fn test_approved_prompt_returns_authorized_session() {
        let (authorizer, mut prompts) = ChannelAuthorizer::channel(1);
        let ui = tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            assert_eq!(prompt.direction(), Direction::Encrypt);
            assert!(prompt.approve());
        });

        match authorizer.authorize(pending_session()).await {
            AuthorizationOutcome::Authorized(session) => assert!(session.is_authorized()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_prompt_is_cancellation() {
        let (authorizer, mut prompts) = ChannelAuthorizer::channel(1);
        let ui = tokio::spawn(async move {
            drop(prompts.recv().await.unwrap());
        });

        match authorizer.authorize(pending_session()).await {
            AuthorizationOutcome::Denied(reason) => assert_eq!(reason, DenialReason::UserCancelled),
            other => panic!("unexpected outcome: {other:?}"),
        }
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_request_discards_late_approval() {
        let (authorizer, mut prompts) = ChannelAuthorizer::channel(1);

        let request = tokio::spawn(async move { authorizer.authorize(pending_session()).await });
        let prompt = prompts.recv().await.unwrap();
        request.abort();
        let _ = request.await;

        assert!(prompt.is_cancelled());
        assert!(!prompt.approve());
    }

    #[tokio::test]
    async fn test_unavailable_authenticator_denies_without_prompting() {
        let (authorizer, mut prompts) = ChannelAuthorizer::channel(1);
        let authorizer = authorizer.with_status(AuthenticatorStatus::NoneEnrolled);

        match authorizer.authorize(pending_session()).await {
            AuthorizationOutcome::Denied(reason) => {
                assert_eq!(reason, DenialReason::NoCredentialsEnrolled)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(prompts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_ui_channel() {
        let (authorizer, prompts) = ChannelAuthorizer::channel(1);
        drop(prompts);
        assert!(matches!(
            authorizer.authorize(pending_session()).await,
            AuthorizationOutcome::Denied(DenialReason::HardwareUnavailable)
        ));
    }
}
