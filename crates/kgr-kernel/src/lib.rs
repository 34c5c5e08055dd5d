//! KGR kernel: in-process messaging substrate.
//!
//! ## Architecture
//!
//! - **Pipe / LocalPipe**: bidirectional FIFO channel between two endpoints
//! - **AsyncPipe**: future-based reads served strictly in call order
//! - **ContextManager**: drives per-connection service logic as pipes receive data
//! - **LocalServer / LocalNamedServer**: registries keyed by id or by path
//! - **RestrictedNamedServer**: path-policy decorator over any named server

pub mod allocator;
pub mod async_pipe;
pub mod config;
pub mod context;
pub mod named_server;
pub mod pipe;
pub mod restricted;
pub mod server;
pub mod service;

pub use allocator::IdAllocator;
pub use async_pipe::AsyncPipe;
pub use context::{
    ContextFlow, ContextHandle, ContextManager, ContextManagerHandle, ContextState,
    ServiceContext,
};
pub use named_server::{LocalNamedServer, NamedServer};
pub use pipe::{LocalPipe, Pipe, PipeListener, PipeStatus};
pub use restricted::RestrictedNamedServer;
pub use server::{Connector, LocalServer, ServiceId};
pub use service::{ContextService, Service};
