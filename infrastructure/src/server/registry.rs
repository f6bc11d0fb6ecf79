//! Live session registry.
//!
//! One [`Session`] per open connection, keyed by [`SessionId`]. Ids are
//! allocated from a counter and never reused, so a queue entry or waiting
//! task holding the id of a closed session finds nothing rather than
//! someone else's conversation.

use broker_application::BrokerError;
use broker_domain::{Session, SessionId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct Inner {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
}

/// Owned registry of live sessions, shared by connection tasks.
///
/// The lock is only ever held for synchronous bookkeeping, never across
/// an `.await`.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session, or fail when the server is at capacity.
    pub fn open(&self) -> Result<SessionId, BrokerError> {
        let mut inner = self.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(BrokerError::SessionLimitReached);
        }
        let id = SessionId::new(inner.next_id);
        inner.next_id += 1;
        inner.sessions.insert(id, Session::new(id));
        debug!("Registry: opened {} ({} live)", id, inner.sessions.len());
        Ok(id)
    }

    /// Remove a session. Returns it if it was still registered.
    pub fn close(&self, id: SessionId) -> Option<Session> {
        let mut inner = self.lock();
        let removed = inner.sessions.remove(&id);
        if removed.is_some() {
            debug!("Registry: closed {} ({} live)", id, inner.sessions.len());
        }
        removed
    }

    /// Run `f` on a live session. `None` if the session is gone.
    pub fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().sessions.get_mut(&id).map(f)
    }

    /// Display name for a session's owner; falls back to the id once the
    /// session has closed.
    pub fn owner_label(&self, id: SessionId) -> String {
        self.lock()
            .sessions
            .get(&id)
            .map(Session::owner_label)
            .unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
