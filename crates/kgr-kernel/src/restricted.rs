//! Restriction decorator for named servers.
//!
//! Connect consults the access policy, register and deregister consult the
//! modification policy, and `registered` answers `true` only when either
//! policy lets the caller see the path. Denials never reveal whether the
//! service exists. Both policies can be swapped at any time without
//! interrupting traffic.

use crate::named_server::NamedServer;
use crate::pipe::Pipe;
use crate::service::Service;
use async_trait::async_trait;
use kgr_types::{KgrError, KgrPath, KgrResult, RestrictionPolicy};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A [`NamedServer`] guarded by access and modification policies.
pub struct RestrictedNamedServer {
    server: Arc<dyn NamedServer>,
    access: RwLock<Arc<RestrictionPolicy>>,
    modification: RwLock<Arc<RestrictionPolicy>>,
}

impl RestrictedNamedServer {
    pub fn new(
        server: Arc<dyn NamedServer>,
        access: RestrictionPolicy,
        modification: RestrictionPolicy,
    ) -> Self {
        Self {
            server,
            access: RwLock::new(Arc::new(access)),
            modification: RwLock::new(Arc::new(modification)),
        }
    }

    /// Wrap a server with nothing allowed until policies are installed.
    pub fn deny_all(server: Arc<dyn NamedServer>) -> Self {
        Self::new(
            server,
            RestrictionPolicy::deny_all(),
            RestrictionPolicy::deny_all(),
        )
    }

    pub fn set_access_restrictions(&self, policy: RestrictionPolicy) {
        *self.access.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    pub fn set_modification_restrictions(&self, policy: RestrictionPolicy) {
        *self.modification.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    pub fn access_restrictions(&self) -> Arc<RestrictionPolicy> {
        Arc::clone(&self.access.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn modification_restrictions(&self) -> Arc<RestrictionPolicy> {
        Arc::clone(&self.modification.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn check_access(&self, path: &KgrPath) -> KgrResult<()> {
        if self.access_restrictions().is_allowed(path) {
            Ok(())
        } else {
            debug!(service = %path, "Access restricted");
            Err(KgrError::AccessDenied(path.to_string()))
        }
    }

    fn check_modification(&self, path: &KgrPath) -> KgrResult<()> {
        if self.modification_restrictions().is_allowed(path) {
            Ok(())
        } else {
            debug!(service = %path, "Modification restricted");
            Err(KgrError::AccessDenied(path.to_string()))
        }
    }
}

#[async_trait]
impl NamedServer for RestrictedNamedServer {
    async fn connect(&self, path: &KgrPath) -> KgrResult<Box<dyn Pipe>> {
        self.check_access(path)?;
        self.server.connect(path).await
    }

    async fn register(&self, path: &KgrPath, service: Arc<dyn Service>) -> KgrResult<()> {
        self.check_modification(path)?;
        self.server.register(path, service).await
    }

    async fn registered(&self, path: &KgrPath) -> KgrResult<bool> {
        if self.check_access(path).is_err() && self.check_modification(path).is_err() {
            return Ok(false);
        }
        self.server.registered(path).await
    }

    async fn deregister(&self, path: &KgrPath) -> KgrResult<()> {
        self.check_modification(path)?;
        self.server.deregister(path).await
    }
}
