//! End-of-turn detection over unstructured backend output.

use super::markers::MarkerSet;

/// Recognises the end of a backend turn by marker matching.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    markers: Vec<String>,
    longest: usize,
}

impl CompletionDetector {
    pub fn new(markers: &MarkerSet) -> Self {
        let markers: Vec<String> = markers.terminal_markers().map(str::to_string).collect();
        let longest = markers.iter().map(String::len).max().unwrap_or(0);
        Self { markers, longest }
    }

    /// Whether `chunk` contains any end-of-turn or role-echo marker.
    pub fn is_terminal(&self, chunk: &str) -> bool {
        self.markers.iter().any(|m| chunk.contains(m.as_str()))
    }

    /// Whether the newest `chunk_len` bytes of `buffer` complete a marker.
    ///
    /// Looks back far enough to catch a marker split across two reads,
    /// but never rescans the whole buffer.
    pub fn is_terminal_tail(&self, buffer: &str, chunk_len: usize) -> bool {
        let window = chunk_len + self.longest.saturating_sub(1);
        let start = floor_boundary(buffer, buffer.len().saturating_sub(window));
        self.is_terminal(&buffer[start..])
    }
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(&MarkerSet::default())
    }
}

fn floor_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
