//! Registry of live connections.
//!
//! Maps each [`ConnectionId`] to the write half of its transport. Only the
//! delivery worker writes through these sinks.

use dashmap::DashMap;
use huddle_transport::{ConnectionId, FrameSink};
use std::sync::Arc;
use tracing::debug;

/// The global connection set.
#[derive(Default)]
pub struct ConnectionRegistry {
    sinks: DashMap<ConnectionId, Arc<dyn FrameSink>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted connection.
    pub fn register(&self, id: ConnectionId, sink: Arc<dyn FrameSink>) {
        self.sinks.insert(id, sink);
        debug!(connection = %id, total = self.sinks.len(), "Connection registered");
    }

    /// Remove a connection, returning its sink if it was registered.
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<dyn FrameSink>> {
        let removed = self.sinks.remove(&id).map(|(_, sink)| sink);
        if removed.is_some() {
            debug!(connection = %id, total = self.sinks.len(), "Connection deregistered");
        }
        removed
    }

    /// Get the sink for a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn FrameSink>> {
        self.sinks.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sinks.contains_key(&id)
    }

    /// Get all registered connection IDs.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sinks.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.sinks.len())
            .finish()
    }
}
