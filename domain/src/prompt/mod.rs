//! Prompt rendering for backends that keep no conversation state.

pub mod transcript;

pub use transcript::render_transcript;
