//! Token budget and admission control.
//!
//! [`ContextBudget`] holds the configured window; [`ContextAccountant`]
//! decides whether a new message may be dispatched for a session whose
//! running total is known.
//!
//! # Rules
//!
//! - budget = `context_size - max_tokens` (room left after reserving the
//!   generation length)
//! - projected = session total + estimate(new message)
//! - projected > budget and usage above `reject_percent` → rejected
//! - projected usage at or above `warning_percent` → admitted with a warning

use crate::core::error::DomainError;
use serde::{Deserialize, Serialize};

/// Characters per token used by [`estimate_tokens`].
pub const CHARS_PER_TOKEN: usize = 4;

/// Approximate token count of `text`: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Context window configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    context_size: usize,
    max_tokens: usize,
    warning_percent: u32,
    reject_percent: u32,
}

impl ContextBudget {
    /// Create a budget for a backend window of `context_size` tokens that
    /// reserves `max_tokens` for generation.
    pub fn new(context_size: usize, max_tokens: usize) -> Self {
        Self {
            context_size,
            max_tokens,
            warning_percent: 75,
            reject_percent: 90,
        }
    }

    pub fn with_warning_percent(mut self, percent: u32) -> Self {
        self.warning_percent = percent;
        self
    }

    pub fn with_reject_percent(mut self, percent: u32) -> Self {
        self.reject_percent = percent;
        self
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn warning_percent(&self) -> u32 {
        self.warning_percent
    }

    pub fn reject_percent(&self) -> u32 {
        self.reject_percent
    }

    /// Tokens available for conversation history plus the next message.
    pub fn available(&self) -> usize {
        self.context_size.saturating_sub(self.max_tokens)
    }

    /// Usage of `tokens` against [`available`](Self::available), rounded up.
    pub fn usage_percent(&self, tokens: usize) -> u32 {
        let available = self.available();
        if available == 0 {
            return if tokens == 0 { 0 } else { u32::MAX };
        }
        let percent = (tokens.saturating_mul(100)).div_ceil(available);
        u32::try_from(percent).unwrap_or(u32::MAX)
    }
}

impl Default for ContextBudget {
    /// Default: 4096-token window with 512 tokens reserved for generation.
    fn default() -> Self {
        Self::new(4096, 512)
    }
}

/// Outcome of a successful admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Comfortably within the budget.
    Admitted { projected: usize, usage_percent: u32 },
    /// Within the budget but close to its end.
    Warning { projected: usize, usage_percent: u32 },
}

impl Admission {
    pub fn projected(&self) -> usize {
        match self {
            Admission::Admitted { projected, .. } | Admission::Warning { projected, .. } => {
                *projected
            }
        }
    }

    pub fn usage_percent(&self) -> u32 {
        match self {
            Admission::Admitted { usage_percent, .. }
            | Admission::Warning { usage_percent, .. } => *usage_percent,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Admission::Warning { .. })
    }
}

/// Admission control and running-total bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ContextAccountant {
    budget: ContextBudget,
}

impl ContextAccountant {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Decide whether `message` may be dispatched for a session that has
    /// already used `session_tokens`.
    pub fn admit(&self, session_tokens: usize, message: &str) -> Result<Admission, DomainError> {
        let projected = session_tokens.saturating_add(estimate_tokens(message));
        let usage_percent = self.budget.usage_percent(projected);

        if projected > self.budget.available() {
            if usage_percent > self.budget.reject_percent {
                return Err(DomainError::ContextBudgetExceeded {
                    usage_percent,
                    budget: self.budget.available(),
                });
            }
            return Ok(Admission::Warning {
                projected,
                usage_percent,
            });
        }

        if usage_percent >= self.budget.warning_percent {
            Ok(Admission::Warning {
                projected,
                usage_percent,
            })
        } else {
            Ok(Admission::Admitted {
                projected,
                usage_percent,
            })
        }
    }

    /// Tokens to add to the session total after a successful exchange.
    pub fn exchange_cost(&self, request: &str, response: &str) -> usize {
        estimate_tokens(request) + estimate_tokens(response)
    }
}
