//! Domain error types

use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Admission control refused a message before it reached the backend.
    #[error("Context budget exceeded ({usage_percent}% of {budget} tokens)")]
    ContextBudgetExceeded { usage_percent: u32, budget: usize },

    /// The session already has a request queued or in flight.
    #[error("A request is already in progress for this session")]
    RequestInProgress,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

impl DomainError {
    /// Check if this error was raised by admission control
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, DomainError::ContextBudgetExceeded { .. })
    }
}
