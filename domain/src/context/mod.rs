//! Per-session context accounting.
//!
//! Token counts here are an approximation (`ceil(chars / 4)`), not the
//! backend's tokenizer. Admission control built on top of them is advisory
//! backpressure rather than an exact guarantee that a prompt fits.

pub mod token_budget;

pub use token_budget::{Admission, CHARS_PER_TOKEN, ContextAccountant, ContextBudget, estimate_tokens};
