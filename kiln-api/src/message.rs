//! JSON message records streamed by the daemon's build and push endpoints.
//!
//! Every record is one JSON object. A single object may carry several
//! independent pieces of information (log text, a progress report, an
//! error, an auxiliary payload), so decoding splits each object into an
//! ordered list of [`DaemonRecord`]s and consumers match on those.

use serde::{Deserialize, Serialize};

/// Auxiliary-record id marking a graph-trace payload.
pub const GRAPH_TRACE_ID: &str = "moby.buildkit.trace";

/// Progress counters of a long-running daemon operation (layer pull/push).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonProgress {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start: i64,
}

/// Structured error reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonError {
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// One JSON object of the daemon's response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonMessage {
    /// Free-text build output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,

    /// Status text of a progress report (e.g. "Pushing", "Waiting")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    /// Progress counters
    #[serde(rename = "progressDetail", default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JsonProgress>,

    /// Identifier of the object a progress report or aux payload refers to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Structured error
    #[serde(rename = "errorDetail", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonError>,

    /// Top-level error string
    #[serde(rename = "error", default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,

    /// Auxiliary payload (image id, push result, or graph trace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
}

/// A single decoded piece of a [`JsonMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonRecord {
    /// Log text, forwarded verbatim.
    Stream(String),
    /// Build failure. Consumers stop decoding.
    Error(String),
    /// Progress report for the object `id`.
    Progress { id: String, status: String, progress: JsonProgress },
    /// Graph-trace payload (JSON string holding base64 protobuf).
    Trace(serde_json::Value),
    /// Any other auxiliary payload, e.g. `{"ID": "sha256:..."}`.
    Aux(serde_json::Value),
}

impl JsonMessage {
    /// Returns true if this message carries a graph-trace payload.
    pub fn is_graph_trace(&self) -> bool {
        self.id == GRAPH_TRACE_ID
    }

    /// Split the message into records, in the order they must be handled:
    /// log text, error, progress, then aux.
    pub fn into_records(self) -> Vec<DaemonRecord> {
        let mut records = Vec::new();
        let is_trace = self.is_graph_trace();

        if !self.stream.is_empty() {
            records.push(DaemonRecord::Stream(self.stream));
        }

        if !self.error_message.is_empty() {
            records.push(DaemonRecord::Error(self.error_message));
        } else if let Some(error) = self.error {
            records.push(DaemonRecord::Error(error.message));
        }

        if let Some(progress) = self.progress {
            if !self.id.is_empty() {
                records.push(DaemonRecord::Progress {
                    id: self.id,
                    status: self.status,
                    progress,
                });
            }
        }

        if let Some(aux) = self.aux {
            if is_trace {
                records.push(DaemonRecord::Trace(aux));
            } else {
                records.push(DaemonRecord::Aux(aux));
            }
        }

        records
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}
