//! Wire frame decoding.
//!
//! A frame is either a bare text delta or a JSON object
//! `{"type": "status" | "content" | "tool_call", ...}`, optionally carried in
//! SSE `data:` lines. Anything that does not decode as a known JSON frame is
//! treated as text, so a backend that streams plain text still works.

use serde::Deserialize;
use serde_json::Value;

use crate::backend::RunStatus;

/// One decoded event from the run's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// More agent output for the live buffer.
    ContentDelta(String),
    /// The run changed status.
    StatusChange(RunStatus),
    /// The run failed. The message is shown to the user.
    ErrorEvent(String),
    /// A structured tool invocation, shown as the live tool call.
    ToolCall { name: String, arguments: Value },
    /// The backend finished sending.
    Close,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
    message: Option<String>,
    content: Option<Value>,
    name: Option<String>,
    arguments: Option<Value>,
}

const POLICY_MARKERS: &[&str] = &[
    "billing",
    "quota",
    "usage limit",
    "payment required",
    "insufficient credits",
];

/// Whether a message reports that a usage policy stopped the agent.
pub fn is_policy_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    POLICY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Decode one raw frame. `None` for keep-alives, empty frames and JSON
/// frames of a type the client does not act on. Whitespace-only text is a
/// real delta and is kept.
pub fn decode_frame(raw: &str) -> Option<StreamEvent> {
    let payload = strip_transport_prefix(raw);
    let trimmed = payload.trim();

    if payload.is_empty() || trimmed.eq_ignore_ascii_case("ping") {
        return None;
    }
    if trimmed == "[DONE]" {
        return Some(StreamEvent::Close);
    }

    if trimmed.starts_with('{') {
        if let Ok(frame) = serde_json::from_str::<WireFrame>(trimmed) {
            return decode_json(frame, &payload);
        }
    }

    Some(StreamEvent::ContentDelta(payload))
}

/// Collect SSE `data:` lines (one optional space after the colon is part of
/// the prefix). A frame with no `data:` line is returned unchanged.
fn strip_transport_prefix(raw: &str) -> String {
    if !raw.lines().any(|line| line.starts_with("data:")) {
        return raw.to_string();
    }

    raw.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_json(frame: WireFrame, payload: &str) -> Option<StreamEvent> {
    match frame.kind.as_deref() {
        Some("content") | None => match frame.content {
            Some(content) => content_text(content).map(StreamEvent::ContentDelta),
            None if frame.kind.is_none() => Some(StreamEvent::ContentDelta(payload.to_string())),
            None => None,
        },
        Some("status") => decode_status(frame.status.as_deref(), frame.message),
        Some("error") => Some(StreamEvent::ErrorEvent(
            frame.message.unwrap_or_else(|| "agent run failed".to_string()),
        )),
        Some("tool_call") => {
            let name = frame.name?;
            Some(StreamEvent::ToolCall {
                name,
                arguments: frame.arguments.unwrap_or(Value::Null),
            })
        }
        Some("ping") => None,
        Some(other) => {
            tracing::debug!(frame_type = other, "ignoring frame of unknown type");
            None
        }
    }
}

fn decode_status(status: Option<&str>, message: Option<String>) -> Option<StreamEvent> {
    if let Some(message) = message.as_deref().filter(|m| is_policy_message(m)) {
        return Some(StreamEvent::ErrorEvent(message.to_string()));
    }

    let raw = status?;
    match RunStatus::from_wire(raw) {
        Some(RunStatus::Error) => Some(StreamEvent::ErrorEvent(
            message.unwrap_or_else(|| "agent run failed".to_string()),
        )),
        Some(status) => Some(StreamEvent::StatusChange(status)),
        None => {
            tracing::debug!(status = raw, "ignoring unknown status frame");
            None
        }
    }
}

/// Text of a `content` field. Some backends double-wrap it as an object (or a
/// JSON string of an object) with its own `content` field.
fn content_text(content: Value) -> Option<String> {
    match content {
        Value::String(text) => {
            if text.trim_start().starts_with('{') {
                if let Ok(Value::Object(inner)) = serde_json::from_str::<Value>(&text) {
                    if let Some(Value::String(unwrapped)) = inner.get("content") {
                        return Some(unwrapped.clone());
                    }
                }
            }
            Some(text)
        }
        Value::Object(inner) => match inner.get("content") {
            Some(Value::String(unwrapped)) => Some(unwrapped.clone()),
            _ => Some(Value::Object(inner).to_string()),
        },
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
