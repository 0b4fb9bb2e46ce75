//! Process-wide map from session key to the connections sharing it.
//!
//! ```text
//! "key-a" ──► { conn#1, conn#4 }     two tabs, one identity
//! "key-b" ──► { conn#2 }
//! ```
//!
//! All operations take a single lock. Registry calls happen on session
//! creation, restoration and teardown only, never per message.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Session;
use crate::error::{Result, WireError};
use crate::server::{Connection, ConnectionId};

struct Entry<C> {
    session: Session,
    connections: HashMap<ConnectionId, Weak<C>>,
}

/// Result of removing a connection from its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    /// The key was not registered (or this connection was not a member).
    NotRegistered,
    /// Other connections still share the session.
    Remaining(usize),
    /// The last member left; the entry is gone. `destroyed` mirrors the flag
    /// passed to [`SessionRegistry::deregister`].
    Removed {
        /// The session must not be restorable anymore.
        destroyed: bool,
    },
}

/// Maps session keys to the set of connections sharing each session.
pub struct SessionRegistry<C = Connection> {
    entries: Mutex<HashMap<String, Entry<C>>>,
    max_connections: usize,
}

impl<C> SessionRegistry<C> {
    /// Create a registry. `max_connections` bounds the members per session
    /// (0 = unlimited).
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// Add `conn` to the set of `session.key`, creating the entry if needed.
    ///
    /// # Errors
    ///
    /// Returns `MaxSessionConnectionsReached` if the session is full.
    pub fn register(&self, id: ConnectionId, conn: &Arc<C>, session: &Session) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session.key.clone())
            .or_insert_with(|| Entry {
                session: session.clone(),
                connections: HashMap::new(),
            });
        if self.max_connections > 0
            && !entry.connections.contains_key(&id)
            && entry.connections.len() >= self.max_connections
        {
            return Err(WireError::MaxSessionConnectionsReached);
        }
        entry.connections.insert(id, Arc::downgrade(conn));
        Ok(())
    }

    /// Remove `id` from the set of `key`.
    ///
    /// The entry disappears when its last member leaves. `destroy` only
    /// marks whether that removal also ends the session for good.
    pub fn deregister(&self, id: ConnectionId, key: &str, destroy: bool) -> Deregistration {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Deregistration::NotRegistered;
        };
        if entry.connections.remove(&id).is_none() {
            return Deregistration::NotRegistered;
        }
        if entry.connections.is_empty() {
            entries.remove(key);
            return Deregistration::Removed { destroyed: destroy };
        }
        Deregistration::Remaining(entry.connections.len())
    }

    /// Check if a session with `key` has live members.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// The registered session for `key`, if any.
    pub fn lookup(&self, key: &str) -> Option<Session> {
        self.entries.lock().get(key).map(|e| e.session.clone())
    }

    /// Number of connections sharing `key`.
    pub fn connection_count(&self, key: &str) -> usize {
        self.entries
            .lock()
            .get(key)
            .map_or(0, |e| e.connections.len())
    }

    /// Check if another member may join `key` right now.
    pub fn has_capacity(&self, key: &str) -> bool {
        self.max_connections == 0 || self.connection_count(key) < self.max_connections
    }

    /// Live connections sharing `key`.
    pub fn session_connections(&self, key: &str) -> Vec<Arc<C>> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.connections.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<C> std::fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
