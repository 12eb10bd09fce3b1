// src/protocol.rs

//! Structured line protocol for standalone single-target runs.
//!
//! Lifecycle transitions are emitted on standard output as
//! `[<tag>:<event>] <json>` lines so a supervising process can parse
//! them; all other child output flows through unchanged. The companion
//! parser extracts protocol lines from a stream and forwards residual
//! lines to a child-output sink.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::watch::ChangeSet;

pub const EVENT_STARTED: &str = "started";
pub const EVENT_CHANGED: &str = "changed";
pub const EVENT_REBUILT: &str = "rebuilt";
pub const EVENT_BUILD_FAILED: &str = "build_failed";
pub const EVENT_STOPPING: &str = "stopping";

/// JSON payload of a protocol line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub build_time_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Emits protocol lines to a writer under a configurable tag.
pub struct Emitter {
    tag: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Emitter {
    /// Emitter writing to standard output.
    pub fn stdout(tag: impl Into<String>) -> Self {
        Self::with_writer(tag, Box::new(std::io::stdout()))
    }

    pub fn with_writer(tag: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            tag: tag.into(),
            out: Mutex::new(out),
        }
    }

    pub fn started(&self, pid: u32, build_time: Duration) {
        self.emit(ProtocolEvent {
            kind: EVENT_STARTED.to_string(),
            pid,
            build_time_ms: build_time.as_millis() as u64,
            ..Default::default()
        });
    }

    pub fn changed(&self, changes: &ChangeSet) {
        self.emit(ProtocolEvent {
            kind: EVENT_CHANGED.to_string(),
            added: changes.added.clone(),
            modified: changes.modified.clone(),
            removed: changes.removed.clone(),
            ..Default::default()
        });
    }

    pub fn rebuilt(&self, pid: u32, build_time: Duration, changes: &ChangeSet) {
        self.emit(ProtocolEvent {
            kind: EVENT_REBUILT.to_string(),
            pid,
            build_time_ms: build_time.as_millis() as u64,
            added: changes.added.clone(),
            modified: changes.modified.clone(),
            removed: changes.removed.clone(),
            ..Default::default()
        });
    }

    pub fn build_failed(&self, error: &str, changes: &ChangeSet) {
        self.emit(ProtocolEvent {
            kind: EVENT_BUILD_FAILED.to_string(),
            error: error.to_string(),
            added: changes.added.clone(),
            modified: changes.modified.clone(),
            removed: changes.removed.clone(),
            ..Default::default()
        });
    }

    pub fn stopping(&self) {
        self.emit(ProtocolEvent {
            kind: EVENT_STOPPING.to_string(),
            ..Default::default()
        });
    }

    fn emit(&self, event: ProtocolEvent) {
        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "[{}:{}] {}", self.tag, event.kind, json);
        let _ = out.flush();
    }
}

/// Parse a `[<tag>:<event>] {json}` line. Returns `None` for anything
/// that is not a protocol line.
pub fn parse_protocol_line(line: &str) -> Option<ProtocolEvent> {
    let rest = line.strip_prefix('[')?;
    let colon = rest.find(':')?;
    let close = rest.find("] ")?;
    if colon > close {
        return None;
    }
    let payload = &rest[close + 2..];
    serde_json::from_str(payload).ok()
}

/// Read lines from `reader`, dispatch protocol lines to `on_event`, and
/// forward every other line (child process output) to `child_out`.
pub async fn scan_output<R, W, F>(reader: R, mut child_out: W, mut on_event: F)
where
    R: AsyncBufRead + Unpin,
    W: Write,
    F: FnMut(ProtocolEvent),
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_protocol_line(&line) {
            Some(event) => on_event(event),
            None => {
                let _ = writeln!(child_out, "{line}");
            }
        }
    }
}
