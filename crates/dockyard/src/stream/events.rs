//! Stream event payloads.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Log,
    Complete,
    Error,
}

/// One event sent to a caller: `{"type": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
}

impl LifecycleEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Status,
            message: message.into(),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Log,
            message: message.into(),
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Complete,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            message: message.into(),
        }
    }

    /// Whether this event ends a progress stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }
}

/// CSI sequences, OSC sequences and two-byte escapes.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI pattern")
});

/// Strip terminal escapes and control characters from a log line.
pub fn sanitize_log_line(line: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(line, "");
    stripped
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect::<String>()
        .trim_end()
        .to_string()
}
