//! Conversation log sink writing JSON Lines.
//!
//! A record is `{"type": .., "timestamp": .., ..payload}`. Restarting the
//! broker appends to an existing log.

use broker_application::ports::conversation_logger::{ConversationEvent, ConversationLogger};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// One line of the log: event type and time first, then the payload.
#[derive(Serialize)]
struct Record {
    #[serde(rename = "type")]
    event_type: &'static str,
    timestamp: String,
    #[serde(flatten)]
    body: Body,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Body {
    /// Object payloads are inlined next to `type` and `timestamp`.
    Fields(Map<String, Value>),
    /// Anything else is nested under `data`.
    Data { data: Value },
}

impl Record {
    fn new(event: ConversationEvent) -> Self {
        let body = match event.payload {
            Value::Object(mut fields) => {
                fields.remove("type");
                fields.remove("timestamp");
                Body::Fields(fields)
            }
            data => Body::Data { data },
        };
        Self {
            event_type: event.event_type,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            body,
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// Lines go through a [`LineWriter`], so every completed record is on disk
/// before `log` returns. A write failure is reported once, then records
/// are dropped silently.
pub struct JsonlConversationLogger {
    writer: Mutex<LineWriter<File>>,
    path: PathBuf,
    write_failed: AtomicBool,
}

impl JsonlConversationLogger {
    /// Open (or create) the log at the given path, creating parent
    /// directories. Returns `None` if the file cannot be opened.
    pub fn new(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(
                "Could not create conversation log directory {}: {}",
                parent.display(),
                e
            );
            return None;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .inspect_err(|e| {
                warn!("Could not open conversation log {}: {}", path.display(), e)
            })
            .ok()?;

        Some(Self {
            writer: Mutex::new(LineWriter::new(file)),
            path: path.to_path_buf(),
            write_failed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &Record) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("conversation log writer poisoned"))?;
        writer.write_all(&line)
    }
}

impl ConversationLogger for JsonlConversationLogger {
    fn log(&self, event: ConversationEvent) {
        if let Err(e) = self.append(&Record::new(event))
            && !self.write_failed.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Conversation log {} stopped accepting records: {}",
                self.path.display(),
                e
            );
        }
    }
}
