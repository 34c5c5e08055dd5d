//! The key-management capability exposed by encrypted sockets.

use crate::crypto::Key;
use crate::events::Subscription;
use crate::SecurityResult;
use std::sync::Arc;

/// Announced to listeners when the peer switches keys.
///
/// `label` is whatever the peer attached to its switch, usually the name of
/// the account whose key is now in effect. `None` means the peer went back to
/// the default key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub label: Option<String>,
}

pub type KeyChangeListener = Arc<dyn Fn(&KeyChange) + Send + Sync>;

/// Runtime control over the key protecting a socket.
pub trait SocketEncryption: Send + Sync {
    /// The key currently sealing outbound frames.
    fn encryption_key(&self) -> Key;

    /// Switch to `key` at the next frame boundary and tell the peer, passing
    /// `label` along with the notice.
    fn set_encryption_key(&self, key: Key, label: Option<String>) -> SecurityResult<()>;

    /// Switch back to the key installed at construction.
    fn restore_default_key(&self, label: Option<String>) -> SecurityResult<()>;

    /// Observe key changes announced by the peer.
    fn on_key_change(&self, listener: KeyChangeListener) -> Subscription;
}
