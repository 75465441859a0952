//! Chat client core for tool-using agents.
//!
//! Reconstructs tool calls and results from an agent's streamed markup
//! (`markup`), and runs the per-thread streaming session against the agent
//! backend (`stream`, `sync`, `backend`).

pub mod backend;
pub mod config;
pub mod logging;
pub mod markup;
pub mod stream;
pub mod sync;

pub use backend::{AgentBackend, BackendError, HttpBackend, RunId, RunStatus, ThreadMessage};
pub use config::{ClientConfig, ConfigError};
pub use markup::{parse_tags, PairingEngine, TagStreamParser, ToolCallEntry};
pub use stream::{
    SessionCommand, SessionDriver, StreamError, StreamEvent, StreamSessionController,
};
pub use sync::RunSynchronizer;

/// Truncate to at most `max_bytes` on a char boundary, marking the cut.
pub(crate) fn truncate_for_log(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… ({} bytes total)", &s[..end], s.len())
}
