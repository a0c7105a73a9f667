//! Process-wide index of live connections and the sessions they own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    connections: usize,
    sessions: HashMap<String, SessionEntry>,
}

/// Connection id to session entry. Connection handlers run on a
/// multi-threaded runtime, so every access goes through the lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of open connections including this one.
    pub fn connection_opened(&self) -> usize {
        let mut inner = self.lock();
        inner.connections += 1;
        inner.connections
    }

    /// Forgets the connection and any session it still owned.
    pub fn connection_closed(&self, connection_id: &str) -> Option<SessionEntry> {
        let mut inner = self.lock();
        inner.connections = inner.connections.saturating_sub(1);
        inner.sessions.remove(connection_id)
    }

    /// Records the session owned by a connection, replacing any earlier one.
    pub fn insert(&self, connection_id: &str, entry: SessionEntry) -> Option<SessionEntry> {
        self.lock().sessions.insert(connection_id.to_string(), entry)
    }

    pub fn remove(&self, connection_id: &str) -> Option<SessionEntry> {
        self.lock().sessions.remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<SessionEntry> {
        self.lock().sessions.get(connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}
