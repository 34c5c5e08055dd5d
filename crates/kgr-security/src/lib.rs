//! KGR security: crypto engine, credentials and session authentication.
//!
//! This crate provides:
//! - **Crypto**: abstract `Crypto`/`Cipher`/`Random` interfaces tagged with an
//!   explicit [`EngineId`], and an AES-256-GCM + Argon2id engine
//! - **Credentials**: an authoritative [`CredentialMaster`] and a client-side
//!   [`CredentialSlave`] holding accounts and their restriction policies
//! - **Authenticator**: challenge/response login that installs the account key
//!   on an encrypted socket and applies the account's policies

pub mod authenticator;
pub mod credentials;
pub mod crypto;
pub mod encryption;
pub mod events;

pub use authenticator::{AuthenticatorFactory, MasterAuthenticator, SlaveAuthenticator};
pub use credentials::{Account, AccountChange, CredentialMaster, CredentialSlave};
pub use crypto::{AesGcmCrypto, Cipher, Crypto, EngineId, Key, Random};
pub use encryption::{KeyChange, KeyChangeListener, SocketEncryption};
pub use events::{Listeners, Subscription};

use kgr_types::KgrError;

// ─── Error types ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Cipher error: {0}")]
    Cipher(String),
    #[error("Decryption failed: ciphertext rejected")]
    Decryption,
    #[error("Key belongs to engine {key}, expected engine {engine}")]
    EngineMismatch { key: u32, engine: u32 },
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Account already exists: {0}")]
    AccountExists(String),
    #[error("Invalid account name: {0:?}")]
    InvalidAccount(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type SecurityResult<T> = Result<T, SecurityError>;

impl From<SecurityError> for KgrError {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::Decryption | SecurityError::Cipher(_) => {
                KgrError::Protocol(e.to_string())
            }
            SecurityError::AccountNotFound(name) => KgrError::NotFound(name),
            SecurityError::AccountExists(name) => KgrError::AlreadyExists(name),
            SecurityError::InvalidAccount(_) | SecurityError::EngineMismatch { .. } => {
                KgrError::InvalidInput(e.to_string())
            }
            SecurityError::AuthenticationFailed(reason) => KgrError::AuthenticationFailure(reason),
            SecurityError::KeyDerivation(_) | SecurityError::Unsupported(_) => {
                KgrError::Internal(e.to_string())
            }
        }
    }
}
