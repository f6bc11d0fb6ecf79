//! Identifiers supplied by clients over the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An identifier chosen by the client (user id, message id).
///
/// Clients may send either a JSON number or a JSON string; the broker
/// never interprets the value and echoes it back in the same shape, so
/// fractional and out-of-`i64` numbers survive unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireId::Number(n) => write!(f, "{}", n),
            WireId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for WireId {
    fn from(value: i64) -> Self {
        WireId::Number(value.into())
    }
}

impl From<&str> for WireId {
    fn from(value: &str) -> Self {
        WireId::Text(value.to_string())
    }
}

impl From<String> for WireId {
    fn from(value: String) -> Self {
        WireId::Text(value)
    }
}
