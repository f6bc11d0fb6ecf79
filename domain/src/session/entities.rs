//! Session domain entities

use crate::core::error::DomainError;
use crate::core::ids::WireId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a session, unique for the lifetime of the broker.
///
/// Assigned from a counter when a connection is accepted; doubles as the
/// connection identity in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Role of a turn in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used when a conversation is rendered as a plain transcript.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A turn in a conversation (Entity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Claimed identity of the client behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: WireId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: WireId, username: impl Into<String>) -> Result<Self, DomainError> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(DomainError::InvalidIdentity(
                "username cannot be empty".to_string(),
            ));
        }
        Ok(Self { user_id, username })
    }
}

/// One client's isolated conversation state (Entity).
///
/// Holds the ordered turns, the running token estimate, and the id of the
/// request currently outstanding for this session (at most one).
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    identity: Option<Identity>,
    turns: Vec<Turn>,
    token_count: usize,
    outstanding: Option<PendingRequest>,
}

/// Marker for the request currently outstanding for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub message_id: Option<WireId>,
    pub since: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            identity: None,
            turns: Vec::new(),
            token_count: 0,
            outstanding: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Human-readable owner name: the username once authenticated,
    /// otherwise the session id.
    pub fn owner_label(&self) -> String {
        match &self.identity {
            Some(identity) => identity.username.clone(),
            None => self.id.to_string(),
        }
    }

    pub fn authenticate(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding(&self) -> Option<&PendingRequest> {
        self.outstanding.as_ref()
    }

    /// Mark a request as outstanding.
    ///
    /// Fails with [`DomainError::RequestInProgress`] if one already is.
    pub fn begin_request(&mut self, message_id: Option<WireId>) -> Result<(), DomainError> {
        if self.outstanding.is_some() {
            return Err(DomainError::RequestInProgress);
        }
        self.outstanding = Some(PendingRequest {
            message_id,
            since: Utc::now(),
        });
        Ok(())
    }

    /// Clear the outstanding marker without recording anything.
    pub fn abandon_request(&mut self) {
        self.outstanding = None;
    }

    /// Record a completed exchange and clear the outstanding marker.
    ///
    /// The token counter only grows here; [`clear_context`](Self::clear_context)
    /// is the single way to reset it.
    pub fn complete_request(&mut self, request: &str, response: &str, tokens: usize) {
        self.turns.push(Turn::user(request));
        self.turns.push(Turn::assistant(response));
        self.token_count = self.token_count.saturating_add(tokens);
        self.outstanding = None;
    }

    /// Reset the running token total to zero and forget all turns.
    pub fn clear_context(&mut self) {
        self.turns.clear();
        self.token_count = 0;
    }
}
