//! Services: factories that bind application logic to inbound pipes.

use crate::context::{ContextManager, ServiceContext};
use crate::pipe::Pipe;
use async_trait::async_trait;
use kgr_types::{KgrError, KgrResult};

/// Something a server can hand new connections to.
///
/// `attach` takes ownership of the server-side end of a fresh pipe. Refusals
/// are reported through the result; the caller closes the pipe.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn attach(&self, pipe: Box<dyn Pipe>) -> KgrResult<()>;
}

/// Service that spawns one [`ServiceContext`] per connection and hands it to
/// a [`ContextManager`].
pub struct ContextService<F> {
    manager: ContextManager,
    factory: F,
}

impl<F> ContextService<F>
where
    F: Fn() -> KgrResult<Box<dyn ServiceContext>> + Send + Sync + 'static,
{
    pub fn new(manager: ContextManager, factory: F) -> Self {
        Self { manager, factory }
    }
}

#[async_trait]
impl<F> Service for ContextService<F>
where
    F: Fn() -> KgrResult<Box<dyn ServiceContext>> + Send + Sync + 'static,
{
    async fn attach(&self, pipe: Box<dyn Pipe>) -> KgrResult<()> {
        let context = (self.factory)().map_err(|e| match e {
            KgrError::AttachFailed(_) => e,
            other => KgrError::AttachFailed(other.to_string()),
        })?;
        self.manager.attach(pipe, context);
        Ok(())
    }
}
