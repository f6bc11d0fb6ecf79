//! Response sanitisation for free-text backend output.
//!
//! Applied once to the full accumulated buffer after completion is detected:
//!
//! 1. Remove echoed system/user blocks delimited by [`EchoFence`]s, then
//!    strip bare control tokens.
//! 2. Strip trailing role labels (`User:`, `Assistant:`) and prompt markers.
//! 3. Keep the first contiguous run of non-empty lines that are not markers
//!    or role labels, stopping at the first marker-like line once real
//!    content has begun. A prompt marker opening the first line (`> text`)
//!    is dropped with the space after it.
//! 4. Trim surrounding whitespace.

use super::markers::{EchoFence, MarkerSet};

/// Strips protocol and echo artifacts from backend output.
#[derive(Debug, Clone, Default)]
pub struct ResponseCleaner {
    markers: MarkerSet,
}

impl ResponseCleaner {
    pub fn new(markers: MarkerSet) -> Self {
        Self { markers }
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    /// Clean a complete backend reply.
    pub fn clean(&self, raw: &str) -> String {
        let text = self.strip_echo_fences(raw);
        let text = self.strip_control_tokens(&text);
        let text = self.strip_trailing_labels(&text);
        self.first_content_run(text).trim().to_string()
    }

    fn strip_echo_fences(&self, raw: &str) -> String {
        let mut text = raw.to_string();
        for fence in &self.markers.echo_fences {
            text = remove_fenced(&text, fence);
        }
        text
    }

    fn strip_control_tokens(&self, text: &str) -> String {
        let mut text = text.to_string();
        for token in self.markers.strip_tokens.iter().filter(|t| !t.is_empty()) {
            text = text.replace(token.as_str(), "");
        }
        text
    }

    fn strip_trailing_labels<'a>(&self, mut text: &'a str) -> &'a str {
        let labels: Vec<&str> = self
            .markers
            .role_labels
            .iter()
            .chain(self.markers.reply_labels.iter())
            .map(String::as_str)
            .filter(|l| !l.is_empty())
            .collect();

        loop {
            let trimmed = text.trim_end();
            if let Some(label) = labels.iter().find(|l| trimmed.ends_with(*l)) {
                text = &trimmed[..trimmed.len() - label.len()];
                continue;
            }
            // Prompt markers only count on a line of their own, so replies
            // ending in e.g. `Vec<u8>` keep their last character.
            match self.trailing_prompt_marker(trimmed) {
                Some(len) => text = &trimmed[..trimmed.len() - len],
                None => return trimmed,
            }
        }
    }

    fn trailing_prompt_marker(&self, trimmed: &str) -> Option<usize> {
        self.markers
            .prompt_markers
            .iter()
            .filter(|m| !m.is_empty())
            .find(|m| {
                trimmed
                    .strip_suffix(m.as_str())
                    .is_some_and(|before| before.is_empty() || before.ends_with('\n'))
            })
            .map(String::len)
    }

    fn first_content_run(&self, text: &str) -> String {
        let mut kept: Vec<&str> = Vec::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || self.is_marker_line(trimmed) {
                if kept.is_empty() {
                    continue;
                }
                break;
            }
            let line = if kept.is_empty() {
                self.strip_leading_prompt(line)
            } else {
                line
            };
            kept.push(self.strip_reply_label(line).trim_end());
        }

        kept.join("\n")
    }

    /// A line that is a bare prompt marker, a bare label, or the opening of
    /// an echoed non-reply turn.
    fn is_marker_line(&self, trimmed: &str) -> bool {
        if self.markers.prompt_markers.iter().any(|m| trimmed == m) {
            return true;
        }
        if self.markers.reply_labels.iter().any(|l| trimmed == l) {
            return true;
        }
        self.markers
            .role_labels
            .iter()
            .filter(|l| !l.is_empty())
            .any(|l| trimmed.starts_with(l.as_str()))
    }

    fn strip_leading_prompt<'a>(&self, line: &'a str) -> &'a str {
        let trimmed = line.trim_start();
        self.markers
            .prompt_markers
            .iter()
            .filter(|m| !m.is_empty())
            .find_map(|m| trimmed.strip_prefix(m.as_str())?.strip_prefix(' '))
            .unwrap_or(line)
    }

    fn strip_reply_label<'a>(&self, line: &'a str) -> &'a str {
        let trimmed = line.trim_start();
        for label in self.markers.reply_labels.iter().filter(|l| !l.is_empty()) {
            if let Some(rest) = trimmed.strip_prefix(label.as_str()) {
                return rest.trim_start();
            }
        }
        line
    }
}

/// Remove every `start ... end` block; an unterminated block runs to the end.
fn remove_fenced(text: &str, fence: &EchoFence) -> String {
    if fence.start.is_empty() || fence.end.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(fence.start.as_str()) {
        out.push_str(&rest[..start]);
        let after_start = &rest[start + fence.start.len()..];
        match after_start.find(fence.end.as_str()) {
            Some(end) => rest = &after_start[end + fence.end.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
