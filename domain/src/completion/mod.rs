//! End-of-turn detection and response sanitisation for free-text backends.
//!
//! A stream-oriented backend gives no structural signal that a reply is
//! finished, so completion is recognised heuristically:
//!
//! - [`CompletionDetector`]: decides whether freshly received output
//!   contains an end-of-turn or role-echo marker
//! - [`ResponseCleaner`]: strips echoed blocks, role labels, and prompt
//!   markers from the accumulated output
//! - [`MarkerSet`]: the configurable marker vocabulary both rely on
//!
//! If a backend never emits a recognised marker, the reply never completes
//! and the request runs into its timeout.

pub mod cleaner;
pub mod detector;
pub mod markers;

pub use cleaner::ResponseCleaner;
pub use detector::CompletionDetector;
pub use markers::{EchoFence, MarkerSet};
