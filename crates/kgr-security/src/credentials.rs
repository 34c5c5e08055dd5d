//! Account stores.
//!
//! A [`CredentialMaster`] is authoritative: it mints accounts, owns their
//! restriction policies and decides what unauthenticated connections may do.
//! A [`CredentialSlave`] only keeps the passwords a client needs to log in.
//!
//! Accounts publish [`AccountChange`] events so live sessions can re-key or
//! re-apply policies when an account is edited or removed.

use crate::crypto::{Crypto, Key};
use crate::events::{Listeners, Subscription};
use crate::{SecurityError, SecurityResult};
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kgr_types::config::{AccountPolicies, KgrConfig};
use kgr_types::RestrictionPolicy;
use std::sync::{Arc, RwLock};
use tracing::info;
use zeroize::Zeroizing;

/// Random bytes behind a generated password.
const GENERATED_PASSWORD_BYTES: usize = 16;

/// What changed on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountChange {
    Credentials,
    Restrictions,
    Removed,
}

/// One named credential with its restriction policies.
pub struct Account {
    name: String,
    password: RwLock<Zeroizing<String>>,
    policies: RwLock<AccountPolicies>,
    changes: Listeners<AccountChange>,
}

impl Account {
    fn new(name: String, password: String, policies: AccountPolicies) -> Self {
        Self {
            name,
            password: RwLock::new(Zeroizing::new(password)),
            policies: RwLock::new(policies),
            changes: Listeners::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> Zeroizing<String> {
        self.password
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn policies(&self) -> AccountPolicies {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_policies(&self, policies: AccountPolicies) {
        *self.policies.write().unwrap_or_else(|e| e.into_inner()) = policies;
        self.changes.emit(&AccountChange::Restrictions);
    }

    /// Replace the password. Sessions logged in as this account re-key.
    pub fn change_credentials(&self, password: impl Into<String>) {
        *self.password.write().unwrap_or_else(|e| e.into_inner()) = Zeroizing::new(password.into());
        self.changes.emit(&AccountChange::Credentials);
    }

    pub fn watch(&self, listener: impl Fn(&AccountChange) + Send + Sync + 'static) -> Subscription {
        self.changes.subscribe(listener)
    }

    /// The key both sides derive from this account's password.
    pub fn derive_key(&self, crypto: &dyn Crypto, salt: &str) -> SecurityResult<Key> {
        crypto.derive_key(&self.password(), salt)
    }

    fn removed(&self) {
        self.changes.emit(&AccountChange::Removed);
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("policies", &self.policies())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> SecurityResult<()> {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(SecurityError::InvalidAccount(name.to_string()));
    }
    Ok(())
}

fn insert_account(
    accounts: &DashMap<String, Arc<Account>>,
    account: Account,
) -> SecurityResult<Arc<Account>> {
    match accounts.entry(account.name.clone()) {
        Entry::Occupied(_) => Err(SecurityError::AccountExists(account.name)),
        Entry::Vacant(slot) => {
            let account = Arc::new(account);
            slot.insert(Arc::clone(&account));
            Ok(account)
        }
    }
}

fn deny_everything() -> AccountPolicies {
    AccountPolicies {
        access: RestrictionPolicy::deny_all(),
        modification: RestrictionPolicy::deny_all(),
    }
}

// ─── Master ──────────────────────────────────────────────────────────────────

/// Authoritative account store.
pub struct CredentialMaster {
    crypto: Arc<dyn Crypto>,
    accounts: DashMap<String, Arc<Account>>,
    default_account: RwLock<Option<AccountPolicies>>,
}

impl CredentialMaster {
    pub fn new(crypto: Arc<dyn Crypto>) -> Self {
        Self {
            crypto,
            accounts: DashMap::new(),
            default_account: RwLock::new(None),
        }
    }

    /// Build a store from the `[[accounts]]` and `default_account` config
    /// sections. Accounts without a password get a generated one.
    pub fn from_config(crypto: Arc<dyn Crypto>, config: &KgrConfig) -> SecurityResult<Self> {
        let master = Self::new(crypto);
        for entry in &config.accounts {
            master.new_account(&entry.name, entry.password.as_deref(), entry.policies.clone())?;
        }
        if let Some(policies) = &config.default_account {
            master.enable_default_account(policies.clone());
        }
        Ok(master)
    }

    /// Mint an account. A missing password is generated from random bytes.
    pub fn new_account(
        &self,
        name: &str,
        password: Option<&str>,
        policies: AccountPolicies,
    ) -> SecurityResult<Arc<Account>> {
        validate_name(name)?;
        let password = match password {
            Some(password) => password.to_string(),
            None => {
                let mut bytes = Zeroizing::new([0u8; GENERATED_PASSWORD_BYTES]);
                self.crypto.new_random().fill(&mut bytes[..]);
                base64::engine::general_purpose::STANDARD.encode(&bytes[..])
            }
        };
        let account = insert_account(
            &self.accounts,
            Account::new(name.to_string(), password, policies),
        )?;
        info!(account = %name, "Account created");
        Ok(account)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    /// Delete an account. Sessions logged in as it fall back to the default
    /// account.
    pub fn remove(&self, name: &str) -> SecurityResult<()> {
        let (_, account) = self
            .accounts
            .remove(name)
            .ok_or_else(|| SecurityError::AccountNotFound(name.to_string()))?;
        info!(account = %name, "Account removed");
        account.removed();
        Ok(())
    }

    /// Account names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accounts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Let unauthenticated connections operate under `policies`.
    pub fn enable_default_account(&self, policies: AccountPolicies) {
        *self.default_account.write().unwrap_or_else(|e| e.into_inner()) = Some(policies);
    }

    pub fn disable_default_account(&self) {
        *self.default_account.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn restrictions_for(&self, name: &str) -> Option<AccountPolicies> {
        self.get_by_name(name).map(|account| account.policies())
    }

    /// Policies for connections that have not logged in. Deny-all unless a
    /// default account is enabled.
    pub fn default_restrictions(&self) -> AccountPolicies {
        self.default_account
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(deny_everything)
    }

    pub fn crypto(&self) -> &Arc<dyn Crypto> {
        &self.crypto
    }
}

// ─── Slave ───────────────────────────────────────────────────────────────────

/// Client-side password store.
#[derive(Default)]
pub struct CredentialSlave {
    accounts: DashMap<String, Arc<Account>>,
}

impl CredentialSlave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_account(&self, name: &str, password: &str) -> SecurityResult<Arc<Account>> {
        validate_name(name)?;
        insert_account(
            &self.accounts,
            Account::new(name.to_string(), password.to_string(), deny_everything()),
        )
    }

    pub fn has(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> SecurityResult<()> {
        let (_, account) = self
            .accounts
            .remove(name)
            .ok_or_else(|| SecurityError::AccountNotFound(name.to_string()))?;
        account.removed();
        Ok(())
    }
}
