//! LLM backend port
//!
//! Defines the uniform contract over the inference backends the broker can
//! front: a long-lived child process spoken to over stdin/stdout, or a
//! remote HTTP completion service. Implementations (adapters) live in the
//! infrastructure layer.
//!
//! How an adapter decides that a reply is complete is its own business.
//! The free-text process adapter uses marker heuristics; an adapter for a
//! backend with explicit end-of-generation events can drop them without
//! the dispatcher or the protocol layer noticing.

use async_trait::async_trait;
use broker_domain::{SessionId, Turn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Errors that can occur during backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Backend request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("Backend error: {0}")]
    Request(String),

    #[error("Backend returned no completion")]
    NoCompletion,

    #[error("Backend unavailable")]
    Unavailable,

    #[error("Failed to spawn backend: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Backend disconnected")]
    Disconnected,
}

impl BackendError {
    /// Whether the backend is gone for good after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendError::Disconnected)
    }
}

/// Which kind of backend an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A child process driven over its standard streams.
    #[default]
    Process,
    /// A remote completion endpoint.
    Http,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Process => f.write_str("process"),
            BackendKind::Http => f.write_str("http"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "http" => Ok(BackendKind::Http),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Lifecycle of a backend.
///
/// ```text
/// Starting ──► Ready ◄──► Degraded
///    │           │           │
///    └───────────┴───────────┴──► Stopped (terminal)
/// ```
///
/// `Degraded` means the last request timed out or failed while the backend
/// itself is still alive (a timed-out process may still be generating).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl BackendState {
    /// Whether requests may be sent in this state.
    pub fn is_available(&self) -> bool {
        matches!(self, BackendState::Ready | BackendState::Degraded)
    }

    fn can_transition_to(self, next: BackendState) -> bool {
        use BackendState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, Degraded)
                | (Degraded, Ready)
                | (Ready, Stopped)
                | (Degraded, Stopped)
        )
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Degraded => "degraded",
            BackendState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Publishes [`BackendState`] transitions to any number of watchers.
///
/// Invalid transitions (anything out of `Stopped`, or back to `Starting`)
/// are refused, so `Starting → Ready` happens at most once.
#[derive(Debug)]
pub struct BackendStatus {
    tx: watch::Sender<BackendState>,
}

impl BackendStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BackendState::Starting);
        Self { tx }
    }

    pub fn current(&self) -> BackendState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning whether the transition happened.
    pub fn transition(&self, next: BackendState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                warn!("Backend: refusing state transition {} -> {}", state, next);
                return false;
            }
            debug!("Backend: state {} -> {}", state, next);
            *state = next;
            true
        })
    }
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single request handed to a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Session the request belongs to.
    pub session: SessionId,
    /// The new user message.
    pub message: String,
    /// Earlier turns of the session, for backends that keep no state.
    pub history: Vec<Turn>,
}

impl BackendRequest {
    pub fn new(session: SessionId, message: impl Into<String>) -> Self {
        Self {
            session,
            message: message.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}

/// Uniform contract over inference backends.
///
/// The dispatcher owns the single instance exclusively and never has more
/// than one `send` outstanding, so implementations may keep mutable
/// per-request buffers without locking.
#[async_trait]
pub trait LlmBackend: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Watch lifecycle transitions.
    fn subscribe(&self) -> watch::Receiver<BackendState>;

    /// Launch or reach the backend and wait until it is ready.
    ///
    /// Fails with [`BackendError::StartupTimeout`] if no readiness signal
    /// arrives within the configured window.
    async fn start(&mut self) -> Result<(), BackendError>;

    /// Send one request and wait for its cleaned completion.
    async fn send(&mut self, request: &BackendRequest) -> Result<String, BackendError>;

    /// Release the backend. Owned processes are terminated; remote services
    /// are left untouched.
    async fn stop(&mut self);
}
