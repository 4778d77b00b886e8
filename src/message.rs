//! Protocol message shapes emitted on stdout by the sync driver (§6).
//!
//! These are the only messages written to stdout; everything else
//! (operator-facing diagnostics) goes through `tracing` to stderr.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four message types of the read protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "RECORD")]
    Record { record: RecordPayload },
    #[serde(rename = "STATE")]
    State { state: StatePayload },
    #[serde(rename = "SOURCE_STATUS")]
    Status(StatusPayload),
    #[serde(rename = "LOG")]
    Log { log: LogPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPayload {
    pub stream: String,
    pub data: Value,
    pub emitted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePayload {
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub summary: String,
    pub code: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub name: String,
    pub status: RunStatus,
    #[serde(rename = "recordsEmitted")]
    pub records_emitted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<StatusMessage>,
    #[serde(skip_serializing_if = "Option::is_none", flatten)]
    pub stream: Option<StreamStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl Message {
    pub fn record(stream: impl Into<String>, data: Value, emitted_at: i64) -> Self {
        Message::Record {
            record: RecordPayload {
                stream: stream.into(),
                data,
                emitted_at,
            },
        }
    }

    pub fn state(data: Value) -> Self {
        Message::State {
            state: StatePayload { data },
        }
    }

    pub fn running() -> Self {
        Message::Status(StatusPayload {
            status: RunStatus::Running,
            message: None,
            stream: None,
        })
    }

    pub fn success() -> Self {
        Message::Status(StatusPayload {
            status: RunStatus::Success,
            message: None,
            stream: None,
        })
    }

    pub fn errored(summary: impl Into<String>) -> Self {
        Message::Status(StatusPayload {
            status: RunStatus::Errored,
            message: Some(StatusMessage {
                summary: summary.into(),
                code: "SOURCE_ERROR".to_string(),
                action: "RETRY".to_string(),
            }),
            stream: None,
        })
    }

    pub fn stream_status(name: impl Into<String>, status: RunStatus, records_emitted: u64) -> Self {
        Message::Status(StatusPayload {
            status,
            message: None,
            stream: Some(StreamStatus {
                name: name.into(),
                status,
                records_emitted,
            }),
        })
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Message::Log {
            log: LogPayload {
                level,
                message: message.into(),
                stack_trace: None,
            },
        }
    }

    /// Serialize as a single NDJSON line (no trailing newline).
    pub fn to_ndjson_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
