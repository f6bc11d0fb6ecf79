//! Domain layer for llm-broker
//!
//! This crate contains the core business logic, entities, and value objects.
//! It has no dependencies on infrastructure or presentation concerns.
//!
//! # Core Concepts
//!
//! ## Session
//!
//! Every client connection owns one [`Session`]: an isolated conversation
//! with its own turns and running token estimate, and at most one request
//! outstanding at a time.
//!
//! ## Context accounting
//!
//! [`ContextAccountant`] estimates tokens at four characters each and
//! refuses messages that would overflow the configured window before the
//! backend is ever contacted.
//!
//! ## Completion detection
//!
//! Free-text backends give no explicit end-of-turn event.
//! [`CompletionDetector`] recognises marker strings in the output stream and
//! [`ResponseCleaner`] strips the echo artifacts that come with them.

pub mod completion;
pub mod context;
pub mod core;
pub mod prompt;
pub mod session;
pub mod util;

// Re-export commonly used types
pub use completion::{CompletionDetector, EchoFence, MarkerSet, ResponseCleaner};
pub use context::{Admission, ContextAccountant, ContextBudget, estimate_tokens};
pub use core::{error::DomainError, ids::WireId};
pub use prompt::render_transcript;
pub use session::entities::{Identity, PendingRequest, Role, Session, SessionId, Turn};
