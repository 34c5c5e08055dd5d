//! Id-keyed service registry.

use crate::allocator::IdAllocator;
use crate::pipe::{LocalPipe, Pipe};
use crate::service::Service;
use futures::future::BoxFuture;
use kgr_types::{KgrError, KgrResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Numeric service slot.
pub type ServiceId = u64;

/// Reusable capability that opens a new pipe to one service each time it is
/// called.
pub type Connector = Arc<dyn Fn() -> BoxFuture<'static, KgrResult<Box<dyn Pipe>>> + Send + Sync>;

struct ServerInner {
    services: HashMap<ServiceId, Arc<dyn Service>>,
    ids: IdAllocator,
}

/// In-process registry mapping ids to services.
pub struct LocalServer {
    inner: Mutex<ServerInner>,
}

impl LocalServer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ServerInner {
                services: HashMap::new(),
                ids: IdAllocator::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register under the lowest free id.
    pub fn register(&self, service: Arc<dyn Service>) -> ServiceId {
        let mut inner = self.lock();
        let id = inner.ids.allocate();
        inner.services.insert(id, service);
        debug!(service = id, "Service registered");
        id
    }

    /// Register under an explicit id. Fails if the slot is taken.
    pub fn register_at(&self, id: ServiceId, service: Arc<dyn Service>) -> KgrResult<()> {
        if id >= IdAllocator::MAX_EXPLICIT_ID {
            return Err(KgrError::InvalidInput(format!(
                "service id {id} is out of range"
            )));
        }
        let mut inner = self.lock();
        if inner.ids.is_used(id) {
            return Err(KgrError::AlreadyExists(format!("service id {id}")));
        }
        inner.ids.set(id, true);
        inner.services.insert(id, service);
        debug!(service = id, "Service registered");
        Ok(())
    }

    pub fn registered(&self, id: ServiceId) -> bool {
        self.lock().services.contains_key(&id)
    }

    pub fn deregister(&self, id: ServiceId) -> KgrResult<()> {
        let mut inner = self.lock();
        if inner.services.remove(&id).is_none() {
            return Err(KgrError::NotFound(format!("service id {id}")));
        }
        inner.ids.free(id);
        debug!(service = id, "Service deregistered");
        Ok(())
    }

    /// Open a new pipe to the service registered under `id`.
    pub async fn connect(&self, id: ServiceId) -> KgrResult<Box<dyn Pipe>> {
        let service = self
            .lock()
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| KgrError::NotFound(format!("service id {id}")))?;

        let (client, server) = LocalPipe::pair();
        let client: Box<dyn Pipe> = Box::new(client);
        if let Err(e) = service.attach(Box::new(server)).await {
            client.close();
            return Err(e);
        }
        Ok(client)
    }

    /// Capability equivalent to calling [`LocalServer::connect`] later.
    pub fn connector(self: &Arc<Self>, id: ServiceId) -> Connector {
        let server = Arc::clone(self);
        Arc::new(move || {
            let server = Arc::clone(&server);
            Box::pin(async move { server.connect(id).await })
        })
    }
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}
