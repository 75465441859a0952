//! Tracing setup: structured logs to a rotated file in the data directory.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "agent-chat.log";

/// Platform data directory for agent-chat.
///
/// - macOS: `~/Library/Application Support/agent-chat/`
/// - Linux: `$XDG_DATA_HOME/agent-chat/` (fallback `~/.local/share/agent-chat/`)
/// - Windows: `{FOLDERID_RoamingAppData}\agent-chat\`
///
/// Falls back to `~/.agent-chat/` when none of those resolve.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("agent-chat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-chat")
}

/// Install the global tracing subscriber and return the log file path.
///
/// Each process gets a fresh `agent-chat.log`; earlier sessions are kept as
/// `agent-chat.log.1` (newest) up to `keep_logs`. `RUST_LOG` overrides the
/// configured filter.
pub fn init_tracing(config: &LoggingConfig) -> std::io::Result<PathBuf> {
    let log_dir = config
        .log_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(data_dir);
    let (log_path, file) = open_session_log(&log_dir, config.keep_logs)?;

    fmt::fmt()
        .with_env_filter(session_filter(&config.filter))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| std::io::Error::other(format!("tracing already initialised: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        filter = %config.filter,
        keep_logs = config.keep_logs,
        pid = std::process::id(),
        "=== agent-chat starting ==="
    );

    Ok(log_path)
}

fn session_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Archive the previous session's log and open a new one. `std::fs::File`
/// is unbuffered, so every event reaches disk as soon as it is written.
fn open_session_log(log_dir: &Path, keep_logs: u32) -> std::io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    archive_previous_logs(&log_path, keep_logs);

    // With nothing archived the old log is simply overwritten.
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    Ok((log_path, file))
}

fn archived_path(log_path: &Path, generation: u32) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift archives up one generation, dropping whatever falls past `keep`.
/// Rename and remove failures are ignored; most generations do not exist.
fn archive_previous_logs(log_path: &Path, keep: u32) {
    if keep == 0 || !log_path.exists() {
        return;
    }

    let _ = std::fs::remove_file(archived_path(log_path, keep));
    for generation in (1..keep).rev() {
        let _ = std::fs::rename(
            archived_path(log_path, generation),
            archived_path(log_path, generation + 1),
        );
    }
    let _ = std::fs::rename(log_path, archived_path(log_path, 1));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_previous_session_is_archived_and_oldest_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        for generation in 1..=3 {
            std::fs::write(archived_path(&base, generation), format!("old{generation}")).unwrap();
        }

        let (path, _file) = open_session_log(dir.path(), 3).unwrap();

        assert_eq!(path, base);
        assert_eq!(read(&base), "");
        assert_eq!(read(&archived_path(&base, 1)), "current");
        assert_eq!(read(&archived_path(&base, 2)), "old1");
        assert_eq!(read(&archived_path(&base, 3)), "old2");
        assert!(!archived_path(&base, 4).exists());
    }

    #[test]
    fn test_keep_zero_overwrites_without_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "previous session").unwrap();

        open_session_log(dir.path(), 0).unwrap();

        assert_eq!(read(&base), "");
        assert!(!archived_path(&base, 1).exists());
    }

    #[test]
    fn test_first_session_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs").join("agent");

        let (path, _file) = open_session_log(&nested, 3).unwrap();

        assert!(path.exists());
        assert!(!archived_path(&path, 1).exists());
    }

    #[test]
    fn test_events_reach_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = open_session_log(dir.path(), 3).unwrap();

        let subscriber = fmt::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(run_id = "run-1", "connection opened");
            tracing::debug!("filtered out");
        });

        let written = read(&path);
        assert!(written.contains("connection opened"));
        assert!(written.contains("run-1"));
        assert!(!written.contains("filtered out"));
    }
}
