//! Backend collaborator — the run/message API the chat core talks to.
//!
//! The controller and synchronizer only see the [`AgentBackend`] trait.
//! `http` implements it against the REST + SSE endpoints; tests use the
//! scripted in-memory backend in `mock`.

pub mod errors;
pub mod http;
#[cfg(test)]
pub mod mock;
pub mod sse;
pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Re-exports for convenience
pub use errors::BackendError;
pub use http::HttpBackend;
pub use types::{MessageKind, RunId, RunRecord, RunStatus, ThreadMessage};

/// Raw frames of one run's event stream, transport prefix still attached.
pub type FrameStream = BoxStream<'static, Result<String, BackendError>>;

/// Operations the chat core needs from the agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Persist a user message on the thread.
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), BackendError>;

    /// Start a new agent run on the thread.
    async fn start_run(&self, thread_id: &str) -> Result<RunId, BackendError>;

    /// Ask the backend to stop a run.
    async fn stop_run(&self, run_id: &RunId) -> Result<(), BackendError>;

    /// Current status of a run.
    async fn run_status(&self, run_id: &RunId) -> Result<RunStatus, BackendError>;

    /// All persisted messages of the thread, oldest first.
    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, BackendError>;

    /// All runs recorded for the thread.
    async fn fetch_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>, BackendError>;

    /// Subscribe to a run's event stream.
    async fn open_stream(&self, run_id: &RunId) -> Result<FrameStream, BackendError>;
}
