//! Configuration types for the KGR messaging core.
//!
//! Every section defaults field by field, so a config file only needs to name
//! what it changes. Loading and include resolution live in `kgr-kernel`.

use crate::restriction::RestrictionPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default request acknowledgement deadline (milliseconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 50;

/// Default response deadline (milliseconds).
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 400;

/// Default idle time before a heartbeat probe (milliseconds).
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 5_000;

/// Default idle time before the connection is torn down (milliseconds).
pub const DEFAULT_INACTIVITY_THRESHOLD_MS: u64 = 2 * DEFAULT_INACTIVITY_TIMEOUT_MS;

/// Default outbound queue budget per connection (8 MB).
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound for any scaled timeout (one day).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default maximum encoded frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KgrConfig {
    /// Network transport settings.
    pub network: NetConfig,
    /// Encryption and authentication settings.
    pub security: SecurityConfig,
    /// Accounts minted on the credential master at startup.
    pub accounts: Vec<AccountConfig>,
    /// Policies for connections that never authenticate. `None` denies all.
    pub default_account: Option<AccountPolicies>,
}

/// Network transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Address the master listens on.
    pub listen_addr: String,
    /// Global factor applied to every timeout below.
    pub timeout_scale: f64,
    pub request_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub inactivity_threshold_ms: u64,
    /// Largest frame accepted from a peer.
    pub max_frame_size: u32,
    /// Encoded bytes a connection may have queued for the socket before it
    /// stops pulling data out of its pipes.
    pub max_queued_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4750".to_string(),
            timeout_scale: 1.0,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            inactivity_timeout_ms: DEFAULT_INACTIVITY_TIMEOUT_MS,
            inactivity_threshold_ms: DEFAULT_INACTIVITY_THRESHOLD_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
        }
    }
}

impl NetConfig {
    /// Same defaults with every timeout multiplied by `scale`.
    pub fn scaled(scale: f64) -> Self {
        Self {
            timeout_scale: scale,
            ..Self::default()
        }
    }

    fn scale(&self, ms: u64) -> Duration {
        let factor = if self.timeout_scale.is_finite() && self.timeout_scale > 0.0 {
            self.timeout_scale
        } else {
            1.0
        };
        Duration::try_from_secs_f64(ms as f64 * factor / 1000.0)
            .map_or(MAX_TIMEOUT, |d| d.min(MAX_TIMEOUT))
    }

    pub fn request_timeout(&self) -> Duration {
        self.scale(self.request_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        self.scale(self.response_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.scale(self.inactivity_timeout_ms)
    }

    /// Never shorter than the inactivity timeout.
    pub fn inactivity_threshold(&self) -> Duration {
        self.scale(self.inactivity_threshold_ms)
            .max(self.inactivity_timeout())
    }
}

/// Encryption and authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Wrap connections in an encrypted socket and require the auth handshake.
    pub enabled: bool,
    /// Salt shared by every key derivation.
    pub salt: String,
    /// Password for the key used before any account logs in.
    pub default_password: String,
    pub kdf: KdfConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            salt: "kgr-default-salt".to_string(),
            default_password: "kgr-default-key".to_string(),
            kdf: KdfConfig::default(),
        }
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Access and modification policies for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountPolicies {
    /// Governs connect and registered.
    pub access: RestrictionPolicy,
    /// Governs register and deregister.
    pub modification: RestrictionPolicy,
}

impl Default for AccountPolicies {
    fn default() -> Self {
        Self {
            access: RestrictionPolicy::allow_all(),
            modification: RestrictionPolicy::allow_all(),
        }
    }
}

/// One configured account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Generated at startup when omitted.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub policies: AccountPolicies,
}
