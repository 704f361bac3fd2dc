//! Encrypt and decrypt workflows.
//!
//! Thin validation over [`VaultRepository`], plus `run` helpers that drive a
//! whole operation: prepare, step-up authorization when asked for, finalize.

use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{AuthorizationOutcome, DenialReason, StepUpAuthorizer, step_up};
use crate::engine::CipherSession;
use crate::outcome::{CryptoOutcome, EMPTY_INPUT, NO_DATA};
use crate::repository::VaultRepository;

/// End result of a full workflow run.
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// The protocol produced this outcome (success or failure)
    Completed(CryptoOutcome),
    /// Step-up authorization was refused or cancelled
    Denied(DenialReason),
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(outcome) if outcome.is_success())
    }

    pub fn message(&self) -> Cow<'_, str> {
        match self {
            Self::Completed(outcome) => outcome.message(),
            Self::Denied(reason) => Cow::Borrowed(reason.message()),
        }
    }
}

/// Turns a prepare outcome into a session ready to finalize, asking the
/// authorizer when needed.
async fn authorized_session(
    prepared: CryptoOutcome,
    authorizer: &dyn StepUpAuthorizer,
) -> Result<CipherSession, WorkflowOutcome> {
    match prepared {
        CryptoOutcome::Ready(session) => Ok(session),
        CryptoOutcome::AuthorizationRequired(session) => {
            debug!(direction = %session.direction(), "Waiting for step-up authorization");
            match step_up(authorizer, session).await {
                AuthorizationOutcome::Authorized(session) => Ok(session),
                AuthorizationOutcome::Denied(reason) => {
                    info!(?reason, "Step-up authorization denied");
                    Err(WorkflowOutcome::Denied(reason))
                }
            }
        }
        other => Err(WorkflowOutcome::Completed(other)),
    }
}

#[derive(Clone)]
pub struct EncryptWorkflow {
    repository: Arc<VaultRepository>,
}

impl EncryptWorkflow {
    pub fn new(repository: Arc<VaultRepository>) -> Self {
        Self { repository }
    }

    pub fn prepare(&self) -> CryptoOutcome {
        self.repository.prepare_encryption()
    }

    /// Encrypts and stores `plaintext`. Blank input never reaches the repository.
    pub fn execute(&self, session: &mut CipherSession, plaintext: &str) -> CryptoOutcome {
        if plaintext.trim().is_empty() {
            return CryptoOutcome::failed(EMPTY_INPUT);
        }
        self.repository.encrypt_and_save(session, plaintext.as_bytes())
    }

    /// Runs a whole encryption, including step-up authorization.
    pub async fn run(&self, plaintext: &str, authorizer: &dyn StepUpAuthorizer) -> WorkflowOutcome {
        if plaintext.trim().is_empty() {
            return WorkflowOutcome::Completed(CryptoOutcome::failed(EMPTY_INPUT));
        }
        let mut session = match authorized_session(self.prepare(), authorizer).await {
            Ok(session) => session,
            Err(outcome) => return outcome,
        };
        WorkflowOutcome::Completed(self.execute(&mut session, plaintext))
    }
}

#[derive(Clone)]
pub struct DecryptWorkflow {
    repository: Arc<VaultRepository>,
}

impl DecryptWorkflow {
    pub fn new(repository: Arc<VaultRepository>) -> Self {
        Self { repository }
    }

    /// Prepares decryption, short-circuiting when nothing is stored.
    pub fn prepare(&self) -> CryptoOutcome {
        if !self.repository.has_stored_data() {
            return CryptoOutcome::failed(NO_DATA);
        }
        self.repository.prepare_decryption()
    }

    pub fn execute(&self, session: &mut CipherSession) -> CryptoOutcome {
        self.repository.decrypt_stored(session)
    }

    pub fn has_data_to_decrypt(&self) -> bool {
        self.repository.has_stored_data()
    }

    /// Runs a whole decryption, including step-up authorization.
    pub async fn run(&self, authorizer: &dyn StepUpAuthorizer) -> WorkflowOutcome {
        let mut session = match authorized_session(self.prepare(), authorizer).await {
            Ok(session) => session,
            Err(outcome) => return outcome,
        };
        WorkflowOutcome::Completed(self.execute(&mut session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyLifecycleManager;
    use crate::kv::MemoryStore;
    use crate::soft::SoftwareKeyStore;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;

    /// Approves everything, or denies everything with a fixed reason.
    struct FixedAuthorizer(Option<DenialReason>);

    #[async_trait]
    impl StepUpAuthorizer for FixedAuthorizer {
        async fn authorize(&self, session: CipherSession) -> AuthorizationOutcome {
            match &self.0 {
                None => AuthorizationOutcome::Authorized(session),
                Some(reason) => AuthorizationOutcome::Denied(reason.clone()),
            }
        }
    }

    fn workflows() -> (EncryptWorkflow, DecryptWorkflow) {
        let keys = Arc::new(KeyLifecycleManager::new(
            Arc::new(SoftwareKeyStore::new()),
            "vault",
        ));
        keys.ensure_key().unwrap();
        let repository = Arc::new(VaultRepository::new(keys, Arc::new(MemoryStore::new())));
        (
            EncryptWorkflow::new(repository.clone()),
            DecryptWorkflow::new(repository),
        )
    }

    #[test]
    fn test_blank_plaintext_rejected() {
        let (encrypt, decrypt) = workflows();
        let mut session = encrypt.prepare().into_session().unwrap().authorize();
        match encrypt.execute(&mut session, "   \n") {
            CryptoOutcome::OperationFailed(reason) => assert_eq!(reason, EMPTY_INPUT),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // the session was never handed to the repository
        assert!(!session.is_consumed());
        assert!(!decrypt.has_data_to_decrypt());
    }

    #[test]
    fn test_decrypt_without_data_short_circuits() {
        let (_, decrypt) = workflows();
        match decrypt.prepare() {
            CryptoOutcome::OperationFailed(reason) => assert_eq!(reason, NO_DATA),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let (encrypt, decrypt) = workflows();
        let approve = FixedAuthorizer(None);

        assert!(encrypt.run("secret-note", &approve).await.is_success());
        assert!(decrypt.has_data_to_decrypt());

        match decrypt.run(&approve).await {
            WorkflowOutcome::Completed(CryptoOutcome::Decrypted(plaintext)) => {
                assert_eq!(plaintext.expose_secret(), b"secret-note")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_surfaces_denial() {
        let (encrypt, decrypt) = workflows();
        let lockout = FixedAuthorizer(Some(DenialReason::Lockout));

        let outcome = encrypt.run("secret-note", &lockout).await;
        assert!(matches!(outcome, WorkflowOutcome::Denied(DenialReason::Lockout)));
        assert_eq!(outcome.message(), "Too many attempts. Try again later.");
        assert!(!decrypt.has_data_to_decrypt());
    }

    #[tokio::test]
    async fn test_run_blank_input_never_prompts() {
        let (encrypt, _) = workflows();
        // a denial here would mean the authorizer was consulted
        let deny = FixedAuthorizer(Some(DenialReason::UserCancelled));
        let outcome = encrypt.run("", &deny).await;
        assert_eq!(outcome.message(), "Please enter text to encrypt");
    }
}
