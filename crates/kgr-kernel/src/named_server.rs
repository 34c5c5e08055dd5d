//! Path-keyed service registries.

use crate::pipe::Pipe;
use crate::server::{Connector, LocalServer, ServiceId};
use crate::service::Service;
use async_trait::async_trait;
use kgr_types::{KgrError, KgrPath, KgrResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Registry of services addressed by hierarchical path.
///
/// Implemented in-process by [`LocalNamedServer`], as a policy decorator by
/// [`crate::RestrictedNamedServer`] and across a socket by the network slave.
#[async_trait]
pub trait NamedServer: Send + Sync + 'static {
    /// Open a new pipe to the service at `path`.
    async fn connect(&self, path: &KgrPath) -> KgrResult<Box<dyn Pipe>>;

    /// Register a service. Fails if the path is taken.
    async fn register(&self, path: &KgrPath, service: Arc<dyn Service>) -> KgrResult<()>;

    /// Whether a service is reachable at `path`.
    async fn registered(&self, path: &KgrPath) -> KgrResult<bool>;

    /// Remove the service at `path`. Fails if nothing is registered there.
    async fn deregister(&self, path: &KgrPath) -> KgrResult<()>;

    /// Capability equivalent to calling [`NamedServer::connect`] later.
    fn connector(self: Arc<Self>, path: KgrPath) -> Connector {
        Arc::new(move || {
            let server = Arc::clone(&self);
            let path = path.clone();
            Box::pin(async move { server.connect(&path).await })
        })
    }
}

struct NamedInner {
    server: Arc<LocalServer>,
    names: Mutex<HashMap<KgrPath, ServiceId>>,
}

/// In-process named server layered over a [`LocalServer`].
#[derive(Clone)]
pub struct LocalNamedServer {
    inner: Arc<NamedInner>,
}

impl LocalNamedServer {
    pub fn new() -> Self {
        Self::with_server(Arc::new(LocalServer::new()))
    }

    /// Share an existing id-keyed server, so anonymous and named services
    /// live in one id space.
    pub fn with_server(server: Arc<LocalServer>) -> Self {
        Self {
            inner: Arc::new(NamedInner {
                server,
                names: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn server(&self) -> &Arc<LocalServer> {
        &self.inner.server
    }

    fn lookup(&self, path: &KgrPath) -> KgrResult<ServiceId> {
        self.inner
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
            .ok_or_else(|| KgrError::NotFound(path.to_string()))
    }

    /// Every registered path, sorted.
    pub fn paths(&self) -> Vec<KgrPath> {
        let mut paths: Vec<KgrPath> = self
            .inner
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl Default for LocalNamedServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NamedServer for LocalNamedServer {
    async fn connect(&self, path: &KgrPath) -> KgrResult<Box<dyn Pipe>> {
        let id = self.lookup(path)?;
        self.inner.server.connect(id).await
    }

    async fn register(&self, path: &KgrPath, service: Arc<dyn Service>) -> KgrResult<()> {
        let mut names = self.inner.names.lock().unwrap_or_else(|e| e.into_inner());
        if names.contains_key(path) {
            return Err(KgrError::AlreadyExists(path.to_string()));
        }
        let id = self.inner.server.register(service);
        names.insert(path.clone(), id);
        info!(service = %path, id, "Named service registered");
        Ok(())
    }

    async fn registered(&self, path: &KgrPath) -> KgrResult<bool> {
        Ok(self
            .inner
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path))
    }

    async fn deregister(&self, path: &KgrPath) -> KgrResult<()> {
        let id = self
            .inner
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
            .ok_or_else(|| KgrError::NotFound(path.to_string()))?;
        self.inner.server.deregister(id)?;
        info!(service = %path, "Named service deregistered");
        Ok(())
    }
}
