//! Errors surfaced to broker clients.

use crate::ports::backend::BackendError;
use broker_domain::DomainError;
use thiserror::Error;

/// Everything that can go wrong between a client message and its reply.
///
/// The `Display` text is what the client sees in an `error` record.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Startup timeout, request timeout, backend failure, unavailability.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Context budget exceeded, or a request already outstanding.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Server at capacity")]
    SessionLimitReached,

    #[error("Not authenticated")]
    NotAuthenticated,

    /// The owning session went away before the request was dispatched.
    #[error("Request discarded")]
    RequestDiscarded,

    #[error("Dispatcher stopped")]
    DispatcherStopped,

    #[error("Connection error: {0}")]
    Connection(String),
}

impl BrokerError {
    /// Whether the request was refused before it reached the backend.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BrokerError::Domain(_)
                | BrokerError::NotAuthenticated
                | BrokerError::SessionLimitReached
                | BrokerError::Backend(BackendError::Unavailable)
        )
    }
}
