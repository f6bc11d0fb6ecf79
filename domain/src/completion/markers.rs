//! Marker vocabulary for completion detection and cleaning.

use serde::{Deserialize, Serialize};

/// A start/end pair delimiting a block that the backend echoed back and
/// that must not reach the client (e.g. the system prompt or the user turn).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoFence {
    pub start: String,
    pub end: String,
}

impl EchoFence {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Marker vocabulary shared by [`CompletionDetector`](super::CompletionDetector)
/// and [`ResponseCleaner`](super::ResponseCleaner).
///
/// Defaults cover ChatML, Llama 3 header tokens, and the interactive
/// prompt of llama.cpp-style command-line runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSet {
    /// Substrings that end a turn.
    pub end_of_turn: Vec<String>,
    /// Substrings showing the backend has started a new user turn on its own.
    pub role_echo: Vec<String>,
    /// Echoed blocks removed wholesale before any other cleaning.
    pub echo_fences: Vec<EchoFence>,
    /// Control tokens removed wherever they appear.
    pub strip_tokens: Vec<String>,
    /// Labels that open an echoed (non-reply) turn, e.g. `User:`.
    pub role_labels: Vec<String>,
    /// Labels that open the reply itself; stripped but the text is kept.
    pub reply_labels: Vec<String>,
    /// Bare interactive prompt markers.
    pub prompt_markers: Vec<String>,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            end_of_turn: strings(&["<|im_end|>", "<|eot_id|>", "</s>", "[end of text]"]),
            role_echo: strings(&["\nUser:", "\n> "]),
            echo_fences: vec![
                EchoFence::new("<|im_start|>system", "<|im_end|>"),
                EchoFence::new("<|im_start|>user", "<|im_end|>"),
                EchoFence::new("<|start_header_id|>system<|end_header_id|>", "<|eot_id|>"),
                EchoFence::new("<|start_header_id|>user<|end_header_id|>", "<|eot_id|>"),
            ],
            strip_tokens: strings(&[
                "<|im_start|>assistant",
                "<|start_header_id|>assistant<|end_header_id|>",
                "<|im_start|>",
                "<|im_end|>",
                "<|eot_id|>",
                "<|begin_of_text|>",
                "</s>",
                "<s>",
                "[end of text]",
            ]),
            role_labels: strings(&["User:", "System:"]),
            reply_labels: strings(&["Assistant:"]),
            prompt_markers: strings(&[">"]),
        }
    }
}

impl MarkerSet {
    /// Every marker that signals the end of a turn when seen in output.
    pub fn terminal_markers(&self) -> impl Iterator<Item = &str> {
        self.end_of_turn
            .iter()
            .chain(self.role_echo.iter())
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    /// Validate this marker set, returning a list of issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.terminal_markers().next().is_none() {
            issues.push("markers: at least one end_of_turn or role_echo marker is required".to_string());
        }
        for fence in &self.echo_fences {
            if fence.start.is_empty() || fence.end.is_empty() {
                issues.push("markers: echo fences need a non-empty start and end".to_string());
            }
        }
        issues
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
