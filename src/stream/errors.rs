use thiserror::Error;

use crate::backend::BackendError;

/// Errors raised while running a stream session.
///
/// The controller recovers from most of these on its own; they are returned
/// to callers and logged, and surfaced to the user as a [`super::Notice`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// The event stream broke or could not be opened.
    #[error("stream transport failed: {reason}")]
    Transport { reason: String },

    /// No event arrived for longer than the inactivity threshold.
    #[error("no events from run {run_id} for {idle_secs}s")]
    StaleConnection { run_id: String, idle_secs: u64 },

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The backend refused to continue for billing or quota reasons.
    #[error("stopped by usage policy: {message}")]
    PolicyStop { message: String },

    /// Messages or runs could not be re-fetched after a run ended.
    #[error("failed to reconcile with backend: {reason}")]
    ReconcileFailed { reason: String },
}

impl StreamError {
    /// Classify a backend failure, promoting policy refusals.
    pub fn from_backend(err: BackendError) -> Self {
        if err.is_policy_stop() {
            let message = match &err {
                BackendError::HttpError { body, .. } if !body.is_empty() => body.clone(),
                other => other.to_string(),
            };
            StreamError::PolicyStop { message }
        } else {
            StreamError::Backend(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_required_is_policy_stop() {
        let err = StreamError::from_backend(BackendError::HttpError {
            status: 402,
            body: "Insufficient credits".into(),
        });
        assert!(matches!(err, StreamError::PolicyStop { ref message } if message == "Insufficient credits"));
    }

    #[test]
    fn test_server_error_stays_backend_error() {
        let err = StreamError::from_backend(BackendError::HttpError {
            status: 500,
            body: "boom".into(),
        });
        assert!(matches!(err, StreamError::Backend(_)));
    }

    #[test]
    fn test_stale_display() {
        let err = StreamError::StaleConnection {
            run_id: "run-1".into(),
            idle_secs: 12,
        };
        assert_eq!(err.to_string(), "no events from run run-1 for 12s");
    }
}
