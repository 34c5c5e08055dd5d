//! Challenge/response login for one connection.
//!
//! ## Exchange
//!
//! 1. The master issues a random nonce ([`MasterAuthenticator::initiate_login`]).
//! 2. The slave answers with `hex(HMAC-SHA256(K, nonce ":" account))`, where
//!    `K` is the account's password-derived key. The password never crosses
//!    the wire.
//! 3. The master recomputes the token and compares in constant time. On a
//!    match it installs `K` on its socket (labelled with the account name),
//!    and applies the account's policies to the connection's restricted
//!    server. The slave installs `K` when it sees the labelled key change.
//!
//! A failed login changes nothing: the connection keeps the default-account
//! policies and the default key.

use crate::credentials::{Account, AccountChange, CredentialMaster, CredentialSlave};
use crate::crypto::{Crypto, Key};
use crate::encryption::{KeyChange, SocketEncryption};
use crate::events::Subscription;
use crate::{SecurityError, SecurityResult};
use hmac::{Hmac, Mac};
use kgr_kernel::RestrictedNamedServer;
use kgr_types::config::AccountPolicies;
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a login challenge.
const NONCE_BYTES: usize = 32;

/// Message given to a peer whose login failed, whatever the cause.
const UNAUTHORIZED: &str = "unauthorized";

fn login_token(key: &Key, nonce: &str, account: &str) -> SecurityResult<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| SecurityError::Cipher(format!("HMAC key rejected: {e}")))?;
    mac.update(nonce.as_bytes());
    mac.update(b":");
    mac.update(account.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn token_matches(expected: &str, presented: &str) -> bool {
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), presented.as_bytes()).into()
}

enum Provider {
    Master(Arc<CredentialMaster>),
    Slave(Arc<CredentialSlave>),
}

/// Builds per-connection authenticators sharing one crypto engine and salt.
pub struct AuthenticatorFactory {
    crypto: Arc<dyn Crypto>,
    salt: String,
    provider: Provider,
}

impl AuthenticatorFactory {
    pub fn for_master(
        crypto: Arc<dyn Crypto>,
        salt: impl Into<String>,
        credentials: Arc<CredentialMaster>,
    ) -> Self {
        Self {
            crypto,
            salt: salt.into(),
            provider: Provider::Master(credentials),
        }
    }

    pub fn for_slave(
        crypto: Arc<dyn Crypto>,
        salt: impl Into<String>,
        credentials: Arc<CredentialSlave>,
    ) -> Self {
        Self {
            crypto,
            salt: salt.into(),
            provider: Provider::Slave(credentials),
        }
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn crypto(&self) -> &Arc<dyn Crypto> {
        &self.crypto
    }

    /// Server side of one connection. The default-account policies are
    /// applied to `restricted` straight away.
    pub fn new_master(
        &self,
        encryption: Option<Arc<dyn SocketEncryption>>,
        restricted: Option<Arc<RestrictedNamedServer>>,
    ) -> SecurityResult<Arc<MasterAuthenticator>> {
        let Provider::Master(credentials) = &self.provider else {
            return Err(SecurityError::Unsupported(
                "master authenticator needs a credential master".to_string(),
            ));
        };
        let auth = Arc::new(MasterAuthenticator {
            crypto: Arc::clone(&self.crypto),
            salt: self.salt.clone(),
            credentials: Arc::clone(credentials),
            encryption,
            restricted,
            state: Mutex::new(MasterState::default()),
        });
        auth.apply(&auth.credentials.default_restrictions());
        Ok(auth)
    }

    /// Client side of one connection.
    pub fn new_slave(
        &self,
        encryption: Option<Arc<dyn SocketEncryption>>,
    ) -> SecurityResult<Arc<SlaveAuthenticator>> {
        let Provider::Slave(credentials) = &self.provider else {
            return Err(SecurityError::Unsupported(
                "slave authenticator needs a credential slave".to_string(),
            ));
        };
        let auth = Arc::new(SlaveAuthenticator {
            crypto: Arc::clone(&self.crypto),
            salt: self.salt.clone(),
            credentials: Arc::clone(credentials),
            encryption: encryption.clone(),
            state: Mutex::new(SlaveState::default()),
            key_changes: Mutex::new(None),
        });
        if let Some(encryption) = encryption {
            let weak = Arc::downgrade(&auth);
            let subscription = encryption.on_key_change(Arc::new(move |change: &KeyChange| {
                if let Some(auth) = weak.upgrade() {
                    auth.on_key_change(change);
                }
            }));
            *auth.key_changes.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        }
        Ok(auth)
    }
}

// ─── Master side ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct MasterState {
    nonce: Option<String>,
    account: Option<Arc<Account>>,
    watch: Option<Subscription>,
}

/// Verifies logins on the accepting side of a connection.
pub struct MasterAuthenticator {
    crypto: Arc<dyn Crypto>,
    salt: String,
    credentials: Arc<CredentialMaster>,
    encryption: Option<Arc<dyn SocketEncryption>>,
    restricted: Option<Arc<RestrictedNamedServer>>,
    state: Mutex<MasterState>,
}

impl MasterAuthenticator {
    /// Issue a fresh challenge, replacing any outstanding one.
    pub fn initiate_login(&self) -> String {
        let mut nonce = [0u8; NONCE_BYTES];
        self.crypto.new_random().fill(&mut nonce);
        let nonce = hex::encode(nonce);
        self.lock().nonce = Some(nonce.clone());
        nonce
    }

    /// Check a login token against the outstanding challenge.
    ///
    /// The challenge is consumed whether or not the token matches. Every
    /// failure reports the same reason so the peer cannot tell an unknown
    /// account from a wrong password.
    pub fn continue_login(self: &Arc<Self>, account: &str, token: &str) -> SecurityResult<()> {
        let Some(nonce) = self.lock().nonce.take() else {
            debug!(account = %account, "Login without a challenge");
            return Err(SecurityError::AuthenticationFailed(UNAUTHORIZED.to_string()));
        };
        let Some(entry) = self.credentials.get_by_name(account) else {
            info!(account = %account, "Login for unknown account");
            return Err(SecurityError::AuthenticationFailed(UNAUTHORIZED.to_string()));
        };
        let key = entry.derive_key(self.crypto.as_ref(), &self.salt)?;
        let expected = login_token(&key, &nonce, account)?;
        if !token_matches(&expected, token) {
            info!(account = %account, "Login rejected");
            return Err(SecurityError::AuthenticationFailed(UNAUTHORIZED.to_string()));
        }

        // The key goes in first: a session never holds account policies
        // without the account key.
        if let Some(encryption) = &self.encryption {
            encryption.set_encryption_key(key, Some(account.to_string()))?;
        }
        let weak = Arc::downgrade(self);
        let watch = entry.watch(move |change| {
            if let Some(auth) = weak.upgrade() {
                auth.on_account_change(*change);
            }
        });
        {
            let mut state = self.lock();
            state.account = Some(Arc::clone(&entry));
            state.watch = Some(watch);
        }
        self.apply(&entry.policies());
        info!(account = %account, "Login accepted");
        Ok(())
    }

    /// The logged-in account name.
    pub fn account(&self) -> Option<String> {
        self.lock().account.as_ref().map(|a| a.name().to_string())
    }

    /// Drop back to the default account and default key.
    pub fn logout(&self) -> SecurityResult<()> {
        let previous = {
            let mut state = self.lock();
            state.watch = None;
            state.account.take()
        };
        if previous.is_none() {
            return Ok(());
        }
        self.apply(&self.credentials.default_restrictions());
        if let Some(encryption) = &self.encryption {
            encryption.restore_default_key(None)?;
        }
        Ok(())
    }

    fn on_account_change(&self, change: AccountChange) {
        let Some(account) = self.lock().account.clone() else {
            return;
        };
        let result = match change {
            AccountChange::Restrictions => {
                self.apply(&account.policies());
                Ok(())
            }
            AccountChange::Credentials => self.rekey(&account),
            AccountChange::Removed => {
                info!(account = %account.name(), "Account removed, logging out");
                self.logout()
            }
        };
        if let Err(e) = result {
            warn!(account = %account.name(), error = %e, "Failed to follow account change");
        }
    }

    fn rekey(&self, account: &Account) -> SecurityResult<()> {
        let Some(encryption) = &self.encryption else {
            return Ok(());
        };
        let key = account.derive_key(self.crypto.as_ref(), &self.salt)?;
        encryption.set_encryption_key(key, Some(account.name().to_string()))
    }

    fn apply(&self, policies: &AccountPolicies) {
        if let Some(restricted) = &self.restricted {
            restricted.set_access_restrictions(policies.access.clone());
            restricted.set_modification_restrictions(policies.modification.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Slave side ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SlaveState {
    pending: Option<(String, Key)>,
    account: Option<String>,
}

/// Answers challenges on the connecting side.
pub struct SlaveAuthenticator {
    crypto: Arc<dyn Crypto>,
    salt: String,
    credentials: Arc<CredentialSlave>,
    encryption: Option<Arc<dyn SocketEncryption>>,
    state: Mutex<SlaveState>,
    /// Held for its drop.
    key_changes: Mutex<Option<Subscription>>,
}

impl SlaveAuthenticator {
    /// Compute the login token for `account` against `nonce`.
    pub fn initiate_login(&self, account: &str, nonce: &str) -> SecurityResult<String> {
        let entry = self
            .credentials
            .get_by_name(account)
            .ok_or_else(|| SecurityError::AccountNotFound(account.to_string()))?;
        let key = entry.derive_key(self.crypto.as_ref(), &self.salt)?;
        let token = login_token(&key, nonce, account)?;
        self.lock().pending = Some((account.to_string(), key));
        Ok(token)
    }

    /// Record the master's verdict on the last token.
    pub fn continue_login(&self, accepted: bool) -> SecurityResult<()> {
        let mut state = self.lock();
        let pending = state.pending.take();
        if !accepted {
            return Err(SecurityError::AuthenticationFailed(UNAUTHORIZED.to_string()));
        }
        match pending {
            Some((name, _)) => {
                info!(account = %name, "Logged in");
                state.account = Some(name);
                Ok(())
            }
            None => Err(SecurityError::AuthenticationFailed(
                "no login in progress".to_string(),
            )),
        }
    }

    pub fn account(&self) -> Option<String> {
        self.lock().account.clone()
    }

    fn on_key_change(&self, change: &KeyChange) {
        let Some(encryption) = &self.encryption else {
            return;
        };
        let result = match &change.label {
            Some(label) => match self.key_for(label) {
                Ok(Some(key)) => encryption.set_encryption_key(key, None),
                Ok(None) => {
                    warn!(label = %label, "Peer switched to a key we do not hold");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                let was_logged_in = self.lock().account.take().is_some();
                if was_logged_in {
                    encryption.restore_default_key(None)
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to follow peer key change");
        }
    }

    fn key_for(&self, label: &str) -> SecurityResult<Option<Key>> {
        let current = {
            let state = self.lock();
            if let Some((name, key)) = &state.pending {
                if name == label {
                    return Ok(Some(key.clone()));
                }
            }
            state.account.as_deref() == Some(label)
        };
        if !current {
            return Ok(None);
        }
        match self.credentials.get_by_name(label) {
            Some(account) => account.derive_key(self.crypto.as_ref(), &self.salt).map(Some),
            None => Ok(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlaveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
