//! Shared types exchanged with the backend: run ids, run status, messages and
//! run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Runs ───────────────────────────────────────────────────────────────────

/// Opaque identifier of one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a run, as believed locally or reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Error,
}

impl RunStatus {
    /// Parse a backend status string. Returns `None` for values that are not
    /// run states (stream frames also carry progress markers in `status`).
    pub fn from_wire(raw: &str) -> Option<RunStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(RunStatus::Idle),
            "running" | "queued" | "pending" => Some(RunStatus::Running),
            "completed" | "complete" | "finished" => Some(RunStatus::Completed),
            "stopped" | "cancelled" | "canceled" => Some(RunStatus::Stopped),
            "failed" | "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Error
        )
    }
}

impl From<String> for RunStatus {
    fn from(raw: String) -> Self {
        RunStatus::from_wire(&raw).unwrap_or_else(|| {
            tracing::warn!(status = %raw, "unknown run status, treating as error");
            RunStatus::Error
        })
    }
}

/// One run as listed by the backend for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(alias = "id")]
    pub run_id: RunId,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    /// Tool-result output.
    Tool,
    Status,
}

/// A message in a thread, persisted or appended locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// Backend id; `None` for messages that only exist locally.
    #[serde(default, alias = "id")]
    pub message_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Partial agent output kept after the stream died and the authoritative
    /// re-read failed.
    #[serde(default)]
    pub connection_lost: bool,
}

impl ThreadMessage {
    /// A message created on this side, with a fresh local id.
    pub fn local(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            message_id: Some(format!("local-{}", uuid::Uuid::new_v4())),
            kind,
            content: content.into(),
            created_at: Utc::now(),
            connection_lost: false,
        }
    }

    /// Key used as the parse source for tag nodes extracted from this message.
    pub fn source_key(&self, position: usize) -> String {
        match &self.message_id {
            Some(id) => id.clone(),
            None => format!("msg#{position}"),
        }
    }
}
