//! Connection registry: the live connections a master is serving.

use crate::connection::Connection;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Connection id.
    pub id: String,
    /// Remote address, as reported by the transport.
    pub peer: String,
    /// Account the peer is logged in as, if any.
    pub account: Option<String>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    connection: Arc<Connection>,
}

impl ConnectionEntry {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            id: connection.id().to_string(),
            peer: connection.peer().to_string(),
            account: None,
            connected_at: Utc::now(),
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Logical pipes currently open on the connection.
    pub fn pipe_count(&self) -> usize {
        self.connection.pipe_count()
    }
}

/// Thread-safe registry of live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: ConnectionEntry) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(entry.id.clone(), entry);
    }

    pub fn remove(&self, id: &str) -> Option<ConnectionEntry> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<ConnectionEntry> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.get(id).cloned()
    }

    /// Every live connection, oldest first.
    pub fn all(&self) -> Vec<ConnectionEntry> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<ConnectionEntry> = connections.values().cloned().collect();
        entries.sort_by_key(|e| e.connected_at);
        entries
    }

    /// Record which account a connection is logged in as.
    pub fn set_account(&self, id: &str, account: Option<String>) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = connections.get_mut(id) {
            entry.account = account;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
