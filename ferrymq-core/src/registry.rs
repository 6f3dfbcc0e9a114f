//! Process-wide client identifier registry.
//!
//! A single registry instance is shared by all connections of one process (or
//! one test), enforcing that no two live connections use the same client
//! identifier. Modelled as an injected service rather than a global so tests
//! can scope it per run.

use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Thread-safe uniqueness set for client identifiers.
///
/// Identifiers are claimed when a connection adopts them and released when
/// the connection closes. Both operations are linearizable: two concurrent
/// `claim` calls with the same identifier see exactly one winner.
#[derive(Debug, Default)]
pub struct ClientIdRegistry {
    ids: Mutex<HashSet<String>>,
}

impl ClientIdRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id` for a connection.
    ///
    /// Returns `true` when the identifier was free and is now held, `false`
    /// when another connection already holds it.
    pub fn claim(&self, id: &str) -> bool {
        let claimed = self.ids.lock().unwrap().insert(id.to_string());
        if claimed {
            debug!(client_id = %id, "client identifier claimed");
        }
        claimed
    }

    /// Releases a previously claimed identifier.
    ///
    /// Returns `true` when the identifier was held. Releasing an unknown
    /// identifier is a no-op.
    pub fn release(&self, id: &str) -> bool {
        let released = self.ids.lock().unwrap().remove(id);
        if released {
            debug!(client_id = %id, "client identifier released");
        }
        released
    }

    /// Whether `id` is currently held by some connection.
    pub fn is_claimed(&self, id: &str) -> bool {
        self.ids.lock().unwrap().contains(id)
    }

    /// Number of identifiers currently held.
    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }

    /// Whether no identifier is currently held.
    pub fn is_empty(&self) -> bool {
        self.ids.lock().unwrap().is_empty()
    }
}
