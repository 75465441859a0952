//! HTTP implementation of [`AgentBackend`].
//!
//! Talks to the agent backend's REST endpoints and subscribes to a run's
//! event stream over SSE. Request/response shapes:
//!
//! - `POST /thread/{id}/messages` `{"type":"user","content":…}`
//! - `POST /thread/{id}/agent/start` → `{"agent_run_id": …}`
//! - `POST /agent-run/{id}/stop`
//! - `GET  /agent-run/{id}` → `{"status": …}`
//! - `GET  /agent-run/{id}/stream` → `text/event-stream`
//! - `GET  /thread/{id}/messages` → `{"messages": […]}`
//! - `GET  /thread/{id}/agent-runs` → `{"agent_runs": […]}`

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::errors::BackendError;
use super::sse::split_sse_events;
use super::types::{RunId, RunRecord, RunStatus, ThreadMessage};
use super::{AgentBackend, FrameStream};
use crate::config::BackendConfig;

// ─── Response Shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartRunResponse {
    agent_run_id: RunId,
}

#[derive(Deserialize)]
struct RunStatusResponse {
    status: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct RunsResponse {
    agent_runs: Vec<RunRecord>,
}

// ─── HttpBackend ────────────────────────────────────────────────────────────

/// REST + SSE client for the agent backend.
pub struct HttpBackend {
    /// Client for request/response calls (bounded total timeout).
    http: HttpClient,
    /// Client for event streams (connect timeout only; staleness is the
    /// controller's watchdog's business).
    http_stream: HttpClient,
    base_url: String,
    api_token: Option<String>,
    request_timeout: Duration,
}

impl HttpBackend {
    /// Build a backend client from configuration. Does not contact the server.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let request_timeout = Duration::from_secs(config.request_timeout_secs);

        let http = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and fail on non-2xx, keeping the body for diagnostics.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint,
                status = status.as_u16(),
                body = %crate::truncate_for_log(&body, 500),
                "backend request failed"
            );
            return Err(BackendError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let url = self.url(path);
        let response = self.send(self.http.get(&url), &url).await?;
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e, &url))?;
        serde_json::from_str(&body).map_err(|e| BackendError::DecodeError {
            reason: format!("invalid response from {url}: {e}"),
        })
    }

    fn map_transport_error(&self, e: reqwest::Error, endpoint: &str) -> BackendError {
        if e.is_timeout() {
            BackendError::timeout(self.request_timeout)
        } else {
            BackendError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl AgentBackend for HttpBackend {
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), BackendError> {
        let url = self.url(&format!("/thread/{thread_id}/messages"));
        let body = serde_json::json!({ "type": "user", "content": content });
        self.send(self.http.post(&url).json(&body), &url).await?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str) -> Result<RunId, BackendError> {
        let url = self.url(&format!("/thread/{thread_id}/agent/start"));
        let response = self.send(self.http.post(&url), &url).await?;
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e, &url))?;
        let parsed: StartRunResponse = serde_json::from_str(&body)?;
        tracing::info!(thread_id, run_id = %parsed.agent_run_id, "agent run started");
        Ok(parsed.agent_run_id)
    }

    async fn stop_run(&self, run_id: &RunId) -> Result<(), BackendError> {
        let url = self.url(&format!("/agent-run/{run_id}/stop"));
        self.send(self.http.post(&url), &url).await?;
        Ok(())
    }

    async fn run_status(&self, run_id: &RunId) -> Result<RunStatus, BackendError> {
        let parsed: RunStatusResponse = self.get_json(&format!("/agent-run/{run_id}")).await?;
        RunStatus::from_wire(&parsed.status).ok_or_else(|| BackendError::DecodeError {
            reason: format!("unknown run status '{}'", parsed.status),
        })
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, BackendError> {
        let parsed: MessagesResponse = self
            .get_json(&format!("/thread/{thread_id}/messages"))
            .await?;
        Ok(parsed.messages)
    }

    async fn fetch_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>, BackendError> {
        let parsed: RunsResponse = self
            .get_json(&format!("/thread/{thread_id}/agent-runs"))
            .await?;
        Ok(parsed.agent_runs)
    }

    async fn open_stream(&self, run_id: &RunId) -> Result<FrameStream, BackendError> {
        let url = self.url(&format!("/agent-run/{run_id}/stream"));
        let request = self
            .http_stream
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self.send(request, &url).await?;
        tracing::debug!(run_id = %run_id, "event stream opened");

        Ok(split_sse_events(Box::pin(response.bytes_stream())).boxed())
    }
}
