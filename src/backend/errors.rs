//! Backend collaborator error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. They carry enough
//! context (endpoint, status, body) for the controller to log and surface
//! them; recovery policy lives in the controller, not here.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by an [`AgentBackend`](super::AgentBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// TCP/HTTP connection to the backend failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The backend did not answer within the configured timeout.
    #[error("backend timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// Response body did not have the expected shape.
    #[error("decode error: {reason}")]
    DecodeError { reason: String },

    /// The event stream broke mid-read.
    #[error("stream error: {reason}")]
    StreamError { reason: String },
}

impl BackendError {
    pub(crate) fn timeout(duration: Duration) -> Self {
        BackendError::Timeout {
            duration_secs: duration.as_secs(),
        }
    }

    /// Whether the backend refused for a usage policy (billing, quota).
    ///
    /// The backend answers `402 Payment Required` when the account's usage
    /// limit is exhausted; some deployments use `429` with a limit message.
    pub fn is_policy_stop(&self) -> bool {
        match self {
            BackendError::HttpError { status: 402, .. } => true,
            BackendError::HttpError { body, .. } => crate::stream::frames::is_policy_message(body),
            _ => false,
        }
    }

    /// Whether a retry against the same endpoint could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::ConnectionFailed { .. }
            | BackendError::Timeout { .. }
            | BackendError::StreamError { .. } => true,
            BackendError::HttpError { status, .. } => *status >= 500,
            BackendError::DecodeError { .. } => false,
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::DecodeError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_required_is_policy_stop() {
        let err = BackendError::HttpError {
            status: 402,
            body: "{}".into(),
        };
        assert!(err.is_policy_stop());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_limit_message_is_policy_stop() {
        let err = BackendError::HttpError {
            status: 429,
            body: r#"{"detail":"Monthly usage limit reached"}"#.into(),
        };
        assert!(err.is_policy_stop());
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = BackendError::HttpError {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_policy_stop());
        assert!(BackendError::timeout(Duration::from_secs(30)).is_transient());
    }
}
