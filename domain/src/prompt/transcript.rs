//! Role-labelled transcript prompts.
//!
//! A completion endpoint sees every request in isolation, so the session's
//! earlier turns are replayed in front of the new message:
//!
//! ```text
//! <system prompt>
//!
//! User: hi
//! Assistant: hello
//! User: <new message>
//! Assistant:
//! ```

use crate::session::entities::Turn;

/// Render `history` plus `message` as a plain transcript ending with an
/// open `Assistant:` turn.
pub fn render_transcript(system_prompt: Option<&str>, history: &[Turn], message: &str) -> String {
    let mut prompt = String::new();

    if let Some(system) = system_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }

    for turn in history {
        prompt.push_str(turn.role.label());
        prompt.push_str(": ");
        prompt.push_str(turn.content.trim());
        prompt.push('\n');
    }

    prompt.push_str("User: ");
    prompt.push_str(message.trim());
    prompt.push_str("\nAssistant:");
    prompt
}
