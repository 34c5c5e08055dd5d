//! Shared error types for the KGR messaging core.

use thiserror::Error;

/// Top-level error type carried across pipe and server boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KgrError {
    /// No service is registered under the requested id or path.
    #[error("Service not found: {0}")]
    NotFound(String),

    /// A restriction policy refused the operation.
    #[error("Restricted: {0}")]
    AccessDenied(String),

    /// The id, path or account is already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The pipe is closed and has nothing left to read.
    #[error("Pipe closed")]
    PipeClosed,

    /// A request, response or liveness deadline expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Malformed frame, failed decryption or unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport is down or could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Challenge/response mismatch or unknown account.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The service refused to attach a new context.
    #[error("Attach failed: {0}")]
    AttachFailed(String),

    /// A caller supplied an argument that cannot be used.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything that does not fit the categories above.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Inspectable failure category, so callers can tell "does not exist" from
/// "not allowed" from "network trouble" without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    AlreadyExists,
    PipeClosed,
    Timeout,
    Protocol,
    ConnectionFailed,
    AuthenticationFailure,
    AttachFailed,
    InvalidInput,
    Config,
    Internal,
}

impl KgrError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::PipeClosed => ErrorKind::PipeClosed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            Self::AttachFailed(_) => ErrorKind::AttachFailed,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error means the transport itself is gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::ConnectionFailed | ErrorKind::Timeout
        )
    }
}

impl From<std::io::Error> for KgrError {
    fn from(e: std::io::Error) -> Self {
        Self::ConnectionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for KgrError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Alias for KGR results.
pub type KgrResult<T> = Result<T, KgrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(
            KgrError::AccessDenied("/secret".into()).kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(KgrError::NotFound("/x".into()).kind(), ErrorKind::NotFound);
        assert_ne!(
            KgrError::NotFound("/x".into()).kind(),
            KgrError::ConnectionFailed("down".into()).kind()
        );
    }

    #[test]
    fn test_display() {
        let err = KgrError::AccessDenied("/secret".into());
        assert_eq!(err.to_string(), "Restricted: /secret");
        assert_eq!(KgrError::PipeClosed.to_string(), "Pipe closed");
    }

    #[test]
    fn test_io_maps_to_connection_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: KgrError = io.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.is_transport_failure());
    }
}
