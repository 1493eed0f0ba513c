//! The session manager: the table of every live session.
//!
//! # Concurrency note
//!
//! Unlike most per-session state, this table is touched by every
//! handshake task and every session supervisor at once. It is a
//! `DashMap` (sharded locks), so lookups for one session never wait on
//! another and there is no global lock.

use std::sync::Arc;

use arcgate_transport::Conn;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{Session, SessionError, SessionId};

/// Tracks all registered sessions.
///
/// ## Lifecycle
///
/// ```text
/// handshake ──→ insert() ──→ [Confirmed / Active / Inactive] ──→ remove()
///                  ↑                    │
///                  │                get() on reconnect
/// ```
pub struct SessionManager<C: Conn> {
    sessions: DashMap<SessionId, Arc<Session<C>>>,
}

impl<C: Conn> SessionManager<C> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers a session.
    ///
    /// # Errors
    /// [`SessionError::AlreadyExists`] if the id is taken.
    pub fn insert(&self, session: Arc<Session<C>>) -> Result<(), SessionError> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyExists(entry.key().to_string())),
            Entry::Vacant(entry) => {
                tracing::info!(session = %session.id(), "session registered");
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Deregisters a session, returning it if it was present.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            tracing::info!(session = %id, remaining = self.sessions.len(), "session deregistered");
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Calls `f` for each registered session without collecting them.
    ///
    /// `f` must not insert into or remove from this manager.
    pub fn for_each<F: FnMut(&Arc<Session<C>>)>(&self, mut f: F) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }
}

impl<C: Conn> Default for SessionManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arcgate_protocol::{Decoder, Encoder};
    use arcgate_transport::{MemoryConn, SequencedBuffer, Transceiver};

    use crate::{generate_session_id, SessionConfig};

    fn session(id: SessionId) -> Arc<Session<MemoryConn>> {
        let (conn, _peer) = MemoryConn::pair();
        let transceiver = Transceiver::new(
            conn,
            Encoder::new(),
            Decoder::default(),
            SequencedBuffer::new(1024),
            Duration::from_millis(50),
        );
        Arc::new(Session::new(
            id,
            Arc::new(transceiver),
            SessionConfig::default(),
            Arc::from(Vec::new()),
        ))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let manager = SessionManager::new();
        let id = generate_session_id();
        manager.insert(session(id.clone())).unwrap();

        assert!(manager.contains(&id));
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get(&id).unwrap().id(), &id);

        assert!(manager.remove(&id).is_some());
        assert!(manager.remove(&id).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_insert_duplicate_id_fails() {
        let manager = SessionManager::new();
        let id = SessionId::from("fixed");
        manager.insert(session(id.clone())).unwrap();
        let err = manager.insert(session(id)).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(ref id) if id == "fixed"));
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_iteration_sees_every_session() {
        let manager = SessionManager::new();
        for _ in 0..3 {
            manager.insert(session(generate_session_id())).unwrap();
        }
        assert_eq!(manager.sessions().len(), 3);
        let mut seen = 0;
        manager.for_each(|_| seen += 1);
        assert_eq!(seen, 3);
    }
}
