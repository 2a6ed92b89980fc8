//! Live session registry
//!
//! Maps session ids to the virtual streams serving them. Entries are added
//! by the session-open route and removed either by the close route or by
//! the bridge when its stream ends.

use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tether_core::SessionError;

use crate::tunnel::StreamHandle;

/// A live interactive session
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id chosen by the server
    pub id: String,
    /// Handle of the stream serving the session
    pub handle: StreamHandle,
    /// When the session was registered
    pub created_at: Instant,
}

impl Session {
    /// Create a session record for a freshly hijacked stream
    pub fn new(id: impl Into<String>, handle: StreamHandle) -> Self {
        Self {
            id: id.into(),
            handle,
            created_at: Instant::now(),
        }
    }
}

/// Concurrent map of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Fails if a live session already uses the id; the existing entry is
    /// left untouched.
    pub fn put(&self, session: Session) -> Result<(), SessionError> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyExists(session.id)),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a session by id. No-op if absent.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove a session only if it is still served by `handle`.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_if_current(&self, id: &str, handle: &StreamHandle) -> bool {
        self.sessions
            .remove_if(id, |_, session| session.handle.same_stream(handle))
            .is_some()
    }

    /// Ids of all live sessions
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether a session with this id is live
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_protocol::StreamId;
    use tokio::sync::mpsc;

    fn handle(id: u32) -> StreamHandle {
        let (tx, _rx) = mpsc::channel(1);
        StreamHandle::new(StreamId::new(id), tx)
    }

    #[test]
    fn test_put_and_snapshot() {
        let registry = SessionRegistry::new();
        registry.put(Session::new("abc", handle(1))).unwrap();

        assert_eq!(registry.snapshot_ids(), vec!["abc".to_string()]);
        assert!(registry.contains("abc"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_put_rejected() {
        let registry = SessionRegistry::new();
        let first = handle(1);
        registry.put(Session::new("abc", first.clone())).unwrap();

        let result = registry.put(Session::new("abc", handle(2)));
        assert_eq!(result, Err(SessionError::AlreadyExists("abc".to_string())));

        // The original stream still owns the id
        assert!(registry.remove_if_current("abc", &first));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.put(Session::new("abc", handle(1))).unwrap();

        assert!(registry.remove("abc").is_some());
        assert!(registry.remove("abc").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_current_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = handle(1);
        let new = handle(2);

        registry.put(Session::new("abc", old.clone())).unwrap();
        registry.remove("abc");
        registry.put(Session::new("abc", new.clone())).unwrap();

        assert!(!registry.remove_if_current("abc", &old));
        assert!(registry.contains("abc"));
        assert!(registry.remove_if_current("abc", &new));
        assert!(!registry.contains("abc"));
    }

    #[test]
    fn test_concurrent_puts() {
        let registry = Arc::new(SessionRegistry::new());

        let threads: Vec<_> = (0..16)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("s-{}-{}", t, i);
                        registry.put(Session::new(id, handle(i))).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.len(), 16 * 50);
        assert_eq!(registry.snapshot_ids().len(), 16 * 50);
    }
}
