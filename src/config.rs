//! Client configuration loading and validation.
//!
//! Reads `agent-chat.yaml` and resolves environment variables. Every field
//! has a default, so a missing file or an empty one yields a working
//! configuration pointed at a local backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "agent-chat.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "AGENT_CHAT_CONFIG";

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named config file does not exist.
    #[error("config not found: {reason}")]
    NotFound { reason: String },

    /// The file exists but could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The file is not valid YAML for `ClientConfig`.
    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    /// Values parsed but are unusable.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ───────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `agent-chat.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

/// Where the backend lives and how patient to be with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Bearer token passed through verbatim. Obtaining it is not our job.
    pub api_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            api_token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

/// Stream session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// No event for this long while streaming means the transport is
    /// presumed dead.
    pub inactivity_threshold_ms: u64,
    /// Minimum spacing between two watchdog reconnects.
    pub reconnect_cooldown_ms: u64,
    /// Watchdog timer period.
    pub tick_interval_ms: u64,
    /// Clear the live buffer on reconnect. The backend replays a run's whole
    /// output to every new subscriber, so keeping the buffer would duplicate it.
    pub reset_buffer_on_reconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_ms: 10_000,
            reconnect_cooldown_ms: 5_000,
            tick_interval_ms: 1_000,
            reset_buffer_on_reconnect: true,
        }
    }
}

impl StreamConfig {
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for log files. Defaults to the platform data directory.
    pub log_dir: Option<String>,
    /// Earlier sessions' logs kept next to the current one. `0` overwrites.
    pub keep_logs: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "agent_chat_core=info,warn".to_string(),
            log_dir: None,
            keep_logs: 3,
        }
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `explicit`, then `$AGENT_CHAT_CONFIG`, then `agent-chat.yaml` in
/// `start` or any ancestor. An explicit or env-named path must exist; the
/// upward search may come back empty.
pub fn find_config_path(
    explicit: Option<&Path>,
    start: &Path,
) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(Some(path.to_path_buf()))
        } else {
            Err(ConfigError::NotFound {
                reason: format!("{} does not exist", path.display()),
            })
        };
    }

    if let Ok(raw) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&raw));
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        return Err(ConfigError::NotFound {
            reason: format!("{CONFIG_ENV_VAR}={raw} does not exist"),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            return Ok(None);
        }
    }
}

/// Load, interpolate, parse and validate a config file.
pub fn load_client_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_client_config(&raw)
}

/// Resolve and load the configuration, falling back to defaults when no file
/// is found.
pub fn resolve_client_config(explicit: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(explicit, &cwd)? {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading client config");
            load_client_config(&path)
        }
        None => {
            tracing::info!("no {CONFIG_FILE_NAME} found, using defaults");
            Ok(ClientConfig::default())
        }
    }
}

/// Parse config text (after `${VAR}` interpolation) and validate it.
pub fn parse_client_config(raw: &str) -> Result<ClientConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: ClientConfig = if interpolated.trim().is_empty() {
        ClientConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    let url = &config.backend.base_url;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Invalid {
            reason: format!("backend.base_url must be an http(s) URL, got '{url}'"),
        });
    }
    if config.stream.inactivity_threshold_ms == 0 || config.stream.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid {
            reason: "stream timings must be non-zero".into(),
        });
    }
    if config.stream.tick_interval_ms > config.stream.inactivity_threshold_ms {
        return Err(ConfigError::Invalid {
            reason: "stream.tick_interval_ms must not exceed inactivity_threshold_ms".into(),
        });
    }
    Ok(())
}

// ─── Interpolation ──────────────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_client_config("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.stream.inactivity_threshold(), Duration::from_secs(10));
        assert_eq!(config.stream.reconnect_cooldown(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let config = parse_client_config(
            "backend:\n  base_url: https://agent.example.com/api\nstream:\n  inactivity_threshold_ms: 20000\n",
        )
        .unwrap();
        assert_eq!(config.backend.base_url, "https://agent.example.com/api");
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert_eq!(config.stream.inactivity_threshold_ms, 20_000);
        assert_eq!(config.stream.reconnect_cooldown_ms, 5_000);
    }

    #[test]
    fn test_env_interpolation_with_default() {
        let config = parse_client_config(
            "backend:\n  base_url: ${AGENT_CHAT_TEST_UNSET_URL:-http://fallback:9000}\n",
        )
        .unwrap();
        assert_eq!(config.backend.base_url, "http://fallback:9000");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = parse_client_config("backend:\n  base_url: localhost\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_tick_longer_than_threshold_rejected() {
        let err = parse_client_config(
            "stream:\n  inactivity_threshold_ms: 1000\n  tick_interval_ms: 5000\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_client_config("backend: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "").unwrap();

        // The env var would take precedence; this test only runs the search
        // when it is unset.
        if std::env::var(CONFIG_ENV_VAR).is_err() {
            let found = find_config_path(None, &nested).unwrap();
            assert_eq!(found, Some(root.path().join(CONFIG_FILE_NAME)));
        }
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = find_config_path(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "logging:\n  filter: debug\n  keep_logs: 0\n").unwrap();
        let config = load_client_config(&path).unwrap();
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.logging.keep_logs, 0);
        assert_eq!(config.logging.log_dir, None);
    }
}
