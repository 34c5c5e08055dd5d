//! Path-prefix restriction policies.

use crate::path::KgrPath;
use serde::{Deserialize, Serialize};

/// A whitelist or blacklist of path prefixes.
///
/// In configuration files a policy reads as
/// `{ mode = "whitelist", prefixes = ["/public"] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "prefixes", rename_all = "lowercase")]
pub enum RestrictionPolicy {
    /// Allowed iff the path starts with one of the prefixes.
    Whitelist(Vec<KgrPath>),
    /// Allowed iff the path starts with none of the prefixes.
    Blacklist(Vec<KgrPath>),
}

impl RestrictionPolicy {
    /// A policy that permits nothing.
    pub fn deny_all() -> Self {
        Self::Whitelist(Vec::new())
    }

    /// A policy that permits everything.
    pub fn allow_all() -> Self {
        Self::Blacklist(Vec::new())
    }

    /// Check a path against the policy.
    pub fn is_allowed(&self, path: &KgrPath) -> bool {
        match self {
            Self::Whitelist(prefixes) => prefixes.iter().any(|p| path.starts_with(p)),
            Self::Blacklist(prefixes) => !prefixes.iter().any(|p| path.starts_with(p)),
        }
    }

    pub fn prefixes(&self) -> &[KgrPath] {
        match self {
            Self::Whitelist(prefixes) | Self::Blacklist(prefixes) => prefixes,
        }
    }
}

impl Default for RestrictionPolicy {
    fn default() -> Self {
        Self::deny_all()
    }
}
