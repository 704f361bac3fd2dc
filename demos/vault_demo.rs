//! # Vault walkthrough
//!
//! Opens a vault over the in-process key store, answers authorization
//! prompts from a stand-in UI task, and walks through encrypt, decrypt,
//! key invalidation and reset.
//!
//! Run with `RUST_LOG=biovault=debug cargo run --example vault_demo` to see
//! the vault's own logging.

use std::sync::Arc;

use biovault::{
    ChannelAuthorizer, SecureVault, SledStore, SoftwareKeyStore, VaultConfig, WorkflowOutcome,
};
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = VaultConfig::from_env();
    let store = Arc::new(SledStore::from_config(&config).expect("Failed to open ciphertext store"));
    let key_store = Arc::new(SoftwareKeyStore::new());

    // The "UI": approve every prompt, as if the fingerprint always matched
    let (authorizer, mut prompts) = ChannelAuthorizer::channel(1);
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            println!("[ui] authorization requested for {}", prompt.direction());
            prompt.approve();
        }
    });

    let vault = SecureVault::open(&config, key_store.clone(), store, Arc::new(authorizer))
        .expect("Failed to open vault");
    println!("=== Vault Demo ===\n");
    println!("Key tier: {}", vault.key().expect("vault key").tier());

    let outcome = vault.encrypt("secret-note").await;
    println!("Encrypt: {}", outcome.message());

    match vault.decrypt().await {
        WorkflowOutcome::Completed(biovault::CryptoOutcome::Decrypted(plaintext)) => {
            println!(
                "Decrypt: {}",
                String::from_utf8_lossy(plaintext.expose_secret())
            );
        }
        other => println!("Decrypt: {}", other.message()),
    }

    println!("\n-- enrolling a new fingerprint --");
    key_store.enroll_new_biometric();
    println!("Key valid: {}", vault.key_is_valid());
    println!("Decrypt: {}", vault.decrypt().await.message());

    let key = vault.reset().expect("Failed to reset vault");
    println!("Reset, new key generation {}", key.generation());
    println!("Stored data: {}", vault.has_stored_data());
}
