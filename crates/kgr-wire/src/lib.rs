//! KGR wire layer: named servers across a socket.
//!
//! One physical connection carries any number of logical pipes, each named by
//! a per-connection id. Requests are correlated with their responses and
//! bounded by deadlines; idle connections are probed and eventually torn
//! down.
//!
//! ## Architecture
//!
//! - **Socket**: byte transport (`StreamSocket` over TCP or in-memory duplex)
//! - **CryptoSocket**: socket decorator sealing frames with AES-GCM and
//!   rotating keys on the fly
//! - **NetFrame**: versioned, length-prefixed JSON protocol messages
//! - **Connection**: request broker, heartbeat and pipe multiplexing
//! - **MasterNetServer**: accepts connections and exposes a named server
//! - **SlaveNetServer**: a `NamedServer` backed by one outbound connection
//! - **ConnectionRegistry**: live connections tracked by the master

pub mod connection;
pub mod crypto_socket;
pub mod master;
pub mod message;
pub mod registry;
pub mod slave;
pub mod socket;

pub use connection::Connection;
pub use crypto_socket::CryptoSocket;
pub use master::{MasterNetServer, MasterSecurity};
pub use message::{NetFrame, NetNotification, NetRequest, NetResponse};
pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use slave::{SlaveNetServer, SlaveSecurity};
pub use socket::{Socket, StreamSocket};

use kgr_security::SecurityError;
use kgr_types::KgrError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u8, remote: u8 },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
}

pub type WireResult<T> = Result<T, WireError>;

impl From<WireError> for KgrError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => KgrError::ConnectionFailed(e.to_string()),
            WireError::ConnectionClosed => KgrError::ConnectionFailed(e.to_string()),
            WireError::Json(_)
            | WireError::MessageTooLarge { .. }
            | WireError::VersionMismatch { .. }
            | WireError::Protocol(_) => KgrError::Protocol(e.to_string()),
            WireError::Security(e) => e.into(),
            WireError::Timeout(what) => KgrError::Timeout(what),
            WireError::Remote { code, message } => message::error_from_code(code, message),
        }
    }
}
