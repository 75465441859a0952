//! The per-thread stream session controller.
//!
//! Owns the one live connection to a run's event stream, feeds content into
//! the incremental tag parser, and keeps the paired tool-call view current.
//! All methods take `&mut self`; the session driver calls them one input at a
//! time, so there is never more than one transition in flight.
//!
//! State machine:
//!
//! ```text
//! Idle ──submit──▶ Connecting ──first event──▶ Streaming
//!  ▲                  │                          │
//!  │                  └──────── error ───────────┤──▶ Error ──▶ Idle
//!  └──────────── Closing ◀── completed/stopped/close
//! ```

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::errors::StreamError;
use super::frames::{decode_frame, is_policy_message, StreamEvent};
use crate::backend::{
    AgentBackend, BackendError, FrameStream, MessageKind, RunId, RunRecord, RunStatus,
    ThreadMessage,
};
use crate::config::StreamConfig;
use crate::markup::{
    parse_tags_with, PairingEngine, ParseContext, ParseResult, Side, TagNode, TagStreamParser,
    ToolCallEntry,
};

// ─── Public Types ───────────────────────────────────────────────────────────

/// Connection state of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Closing,
    Error,
}

impl ControllerState {
    /// Whether a connection is open or being opened.
    pub fn is_live(self) -> bool {
        matches!(self, ControllerState::Connecting | ControllerState::Streaming)
    }
}

/// The live connection: a forwarding task tagged with its generation.
#[derive(Debug)]
pub struct Connection {
    pub generation: u64,
    task: JoinHandle<()>,
}

/// The controller's record of the thread's current run.
#[derive(Debug)]
pub struct AgentRunSession {
    pub thread_id: String,
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub last_event_at: Option<Instant>,
    pub connection: Option<Connection>,
}

impl AgentRunSession {
    fn new(thread_id: String) -> Self {
        Self {
            thread_id,
            run_id: None,
            status: RunStatus::Idle,
            last_event_at: None,
            connection: None,
        }
    }
}

/// Input from a connection's forwarding task.
#[derive(Debug)]
pub enum SessionInput {
    Frame { generation: u64, raw: String },
    /// The stream ended, cleanly or with a read error.
    Ended {
        generation: u64,
        error: Option<BackendError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Recovered automatically; informational.
    Transient,
    Error,
    /// Billing, quota or usage limits stopped the agent.
    PolicyStop,
    /// Streamed output was kept locally because the backend could not be
    /// re-read.
    ConnectionLost,
}

/// A condition to show the user once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// The tool call most recently announced by a structured frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Published after every handled input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ControllerState,
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub buffer_len: usize,
    pub entry_count: usize,
}

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct StreamSessionController {
    backend: Arc<dyn AgentBackend>,
    config: StreamConfig,
    state: ControllerState,
    session: AgentRunSession,
    parser: TagStreamParser,
    pairing: PairingEngine,
    messages: Vec<ThreadMessage>,
    history_nodes: Vec<TagNode>,
    runs: Vec<RunRecord>,
    live_tool_call: Option<LiveToolCall>,
    notices: Vec<Notice>,
    /// Incremented on every connect and teardown; inputs carrying another
    /// value come from a dead connection.
    generation: u64,
    last_reconnect_at: Option<Instant>,
    tearing_down: bool,
    sync_requested: bool,
    /// A failed reconnect already told the user the stream is gone.
    loss_surfaced: bool,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl StreamSessionController {
    /// Create the controller for `thread_id`, plus the receiver its
    /// connections forward frames into.
    pub fn new(
        thread_id: impl Into<String>,
        backend: Arc<dyn AgentBackend>,
        config: StreamConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionInput>) {
        let thread_id = thread_id.into();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            state: ControllerState::Idle,
            run_id: None,
            status: RunStatus::Idle,
            buffer_len: 0,
            entry_count: 0,
        });
        let parser = TagStreamParser::new(ParseContext::new(
            format!("stream:{thread_id}"),
            Side::Call,
            Utc::now(),
        ));

        let controller = Self {
            backend,
            config,
            state: ControllerState::Idle,
            session: AgentRunSession::new(thread_id),
            parser,
            pairing: PairingEngine::new(),
            messages: Vec::new(),
            history_nodes: Vec::new(),
            runs: Vec::new(),
            live_tool_call: None,
            notices: Vec::new(),
            generation: 0,
            last_reconnect_at: None,
            tearing_down: false,
            sync_requested: false,
            loss_surfaced: false,
            input_tx,
            snapshot_tx,
        };
        (controller, input_rx)
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn thread_id(&self) -> &str {
        &self.session.thread_id
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session(&self) -> &AgentRunSession {
        &self.session
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.config.tick_interval()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live() && self.session.connection.is_some()
    }

    /// The raw buffer of the in-progress turn.
    pub fn streaming_text(&self) -> &str {
        self.parser.buffer()
    }

    pub fn parse_result(&self) -> ParseResult {
        self.parser.result()
    }

    /// Paired tool-call view over history and the live buffer.
    pub fn tool_calls(&self) -> &[ToolCallEntry] {
        self.pairing.entries()
    }

    pub fn messages(&self) -> &[ThreadMessage] {
        &self.messages
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    pub fn live_tool_call(&self) -> Option<&LiveToolCall> {
        self.live_tool_call.as_ref()
    }

    /// Drain notices raised since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            run_id: self.session.run_id.clone(),
            status: self.session.status,
            buffer_len: self.parser.buffer().len(),
            entry_count: self.pairing.entries().len(),
        }
    }

    /// Whether the synchronizer should run: explicitly requested, or the
    /// local run id and status disagree about whether a run is active.
    pub fn take_sync_request(&mut self) -> bool {
        let drift = match (&self.session.run_id, self.session.status) {
            (Some(_), _) => !self.is_live(),
            (None, RunStatus::Running) => true,
            (None, _) => false,
        };
        std::mem::take(&mut self.sync_requested) || drift
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Send a user message and start a run that answers it.
    pub async fn submit_message(&mut self, content: &str) -> Result<RunId, StreamError> {
        if self.is_live() {
            tracing::info!(thread_id = %self.session.thread_id, "new message replaces live session");
            self.teardown();
            self.set_state(ControllerState::Idle);
        }

        self.messages
            .push(ThreadMessage::local(MessageKind::User, content));

        let started = match self
            .backend
            .post_message(&self.session.thread_id, content)
            .await
        {
            Ok(()) => self.backend.start_run(&self.session.thread_id).await,
            Err(e) => Err(e),
        };

        let run_id = match started {
            Ok(run_id) => run_id,
            Err(e) => {
                let err = StreamError::from_backend(e);
                tracing::error!(thread_id = %self.session.thread_id, error = %err, "failed to start agent run");
                self.surface(&err);
                self.session.status = RunStatus::Idle;
                self.set_state(ControllerState::Idle);
                self.finish_input();
                return Err(err);
            }
        };

        tracing::info!(thread_id = %self.session.thread_id, run_id = %run_id, "agent run started");
        self.begin_run(run_id.clone()).await?;
        Ok(run_id)
    }

    /// Attach to a run that is already active on the backend.
    pub async fn resume_run(&mut self, run_id: RunId) -> Result<(), StreamError> {
        if self.is_live() {
            self.teardown();
        }
        tracing::info!(thread_id = %self.session.thread_id, run_id = %run_id, "resuming active run");
        self.begin_run(run_id).await
    }

    /// Stop the live run. Local state is `Idle` when this returns, whatever
    /// the backend answers.
    pub async fn stop(&mut self) {
        if !self.is_live() {
            return;
        }

        let run_id = self.session.run_id.take();
        self.teardown();
        self.session.status = RunStatus::Stopped;
        self.live_tool_call = None;
        self.set_state(ControllerState::Idle);

        if let Some(run_id) = run_id {
            if let Err(e) = self.backend.stop_run(&run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "backend stop call failed");
                self.notify(NoticeKind::Transient, format!("stop request failed: {e}"));
            }
        }

        self.tearing_down = true;
        let _ = self.reconcile().await;
        self.tearing_down = false;
        self.finish_input();
    }

    /// Re-read messages and runs from the backend.
    ///
    /// On success the local lists are replaced and the live buffer is
    /// cleared. On failure the buffer's text is kept as a local message
    /// marked `connection_lost`.
    pub async fn reconcile(&mut self) -> Result<(), StreamError> {
        let thread_id = self.session.thread_id.clone();
        let fetched = match self.backend.fetch_messages(&thread_id).await {
            Ok(messages) => match self.backend.fetch_runs(&thread_id).await {
                Ok(runs) => Ok((messages, runs)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match fetched {
            Ok((messages, runs)) => {
                tracing::debug!(
                    thread_id = %thread_id,
                    messages = messages.len(),
                    runs = runs.len(),
                    "reconciled with backend"
                );
                self.messages = messages;
                self.runs = runs;
                self.parser.reset();
                self.rebuild_view();
                Ok(())
            }
            Err(e) => {
                let err = StreamError::ReconcileFailed {
                    reason: e.to_string(),
                };
                tracing::warn!(thread_id = %thread_id, error = %err, "keeping streamed text locally");
                self.preserve_buffer();
                self.notify(
                    NoticeKind::ConnectionLost,
                    "lost connection to the backend; showing the output received so far",
                );
                Err(err)
            }
        }
    }

    /// Forget the run: tear down any connection and return to `Idle`. If a
    /// connection was live, the final output is re-read.
    pub async fn settle_run(&mut self) {
        let was_live = self.is_live();
        if was_live {
            self.teardown();
        }
        self.session.run_id = None;
        self.session.status = RunStatus::Idle;
        self.live_tool_call = None;
        self.set_state(ControllerState::Idle);
        if was_live {
            self.tearing_down = true;
            let _ = self.reconcile().await;
            self.tearing_down = false;
        }
        self.finish_input();
    }

    // ─── Inputs ─────────────────────────────────────────────────────────

    /// Handle one input from a connection task.
    pub async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Frame { generation, raw } => {
                if !self.is_current(generation) {
                    tracing::trace!(generation, current = self.generation, "dropping stale frame");
                    return;
                }
                self.session.last_event_at = Some(Instant::now());
                if self.state == ControllerState::Connecting {
                    self.set_state(ControllerState::Streaming);
                }
                if let Some(event) = decode_frame(&raw) {
                    self.apply_event(event).await;
                }
            }
            SessionInput::Ended { generation, error } => {
                if !self.is_current(generation) {
                    return;
                }
                match error {
                    None => {
                        tracing::debug!(generation, "event stream ended");
                        self.finish_run(RunStatus::Completed).await;
                    }
                    Some(e) => self.lose_transport(e).await,
                }
            }
        }
        self.finish_input();
    }

    /// Apply one decoded event.
    pub async fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::ContentDelta(text) => {
                self.parser.push_str(&text);
                self.refresh_view();
            }
            StreamEvent::StatusChange(status) => match status {
                RunStatus::Error => self.fail_run("agent run failed".to_string()),
                status if status.is_terminal() => self.finish_run(status).await,
                RunStatus::Running => self.session.status = RunStatus::Running,
                _ => {}
            },
            StreamEvent::ErrorEvent(message) => self.fail_run(message),
            StreamEvent::ToolCall { name, arguments } => {
                tracing::debug!(tool = %name, "live tool call");
                self.live_tool_call = Some(LiveToolCall { name, arguments });
            }
            StreamEvent::Close => self.finish_run(RunStatus::Completed).await,
        }
    }

    /// Watchdog tick at the current time.
    pub async fn on_tick(&mut self) {
        self.on_tick_at(Instant::now()).await;
    }

    /// Watchdog tick at `now`. Reconnects a live session that has been silent
    /// past the inactivity threshold, at most once per cooldown window.
    pub async fn on_tick_at(&mut self, now: Instant) {
        self.enforce_consistency();
        if self.tearing_down || !self.is_live() {
            self.publish();
            return;
        }

        let idle = self
            .session
            .last_event_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if idle < self.config.inactivity_threshold() {
            return;
        }
        if let Some(last) = self.last_reconnect_at {
            if now.saturating_duration_since(last) < self.config.reconnect_cooldown() {
                return;
            }
        }

        self.reconnect(now, idle.as_secs()).await;
        self.finish_input();
    }

    // ─── Transitions ────────────────────────────────────────────────────

    async fn begin_run(&mut self, run_id: RunId) -> Result<(), StreamError> {
        self.session.run_id = Some(run_id.clone());
        self.session.status = RunStatus::Running;
        self.session.last_event_at = Some(Instant::now());
        self.last_reconnect_at = None;
        self.live_tool_call = None;
        self.parser.reset();
        self.parser.set_context(ParseContext::new(
            format!("stream:{run_id}"),
            Side::Call,
            Utc::now(),
        ));
        self.refresh_view();
        self.set_state(ControllerState::Connecting);

        let result = self.connect(&run_id).await;
        if let Err(err) = &result {
            tracing::error!(run_id = %run_id, error = %err, "failed to open event stream");
            if !std::mem::take(&mut self.loss_surfaced) {
                self.surface(err);
            }
            // Nothing to attach to: forget the run rather than retry every
            // tick. The next load or submit starts over.
            self.session.run_id = None;
            self.session.status = RunStatus::Idle;
            self.set_state(ControllerState::Idle);
        }
        self.finish_input();
        result
    }

    async fn reconnect(&mut self, now: Instant, idle_secs: u64) {
        let Some(run_id) = self.session.run_id.clone() else {
            return;
        };
        let stale = StreamError::StaleConnection {
            run_id: run_id.to_string(),
            idle_secs,
        };
        tracing::warn!(run_id = %run_id, generation = self.generation, "{stale}, reconnecting");

        self.teardown();
        self.last_reconnect_at = Some(now);
        if self.config.reset_buffer_on_reconnect {
            self.parser.reset();
            self.live_tool_call = None;
            self.refresh_view();
        }
        self.set_state(ControllerState::Connecting);

        if let Err(err) = self.connect(&run_id).await {
            tracing::error!(run_id = %run_id, error = %err, "reconnect failed");
            self.notify(NoticeKind::Error, format!("lost the agent's stream: {err}"));
            self.loss_surfaced = true;
            self.session.status = RunStatus::Idle;
            self.set_state(ControllerState::Idle);
            self.sync_requested = true;
        }
    }

    /// Run reached a terminal status: close, then reconcile.
    async fn finish_run(&mut self, status: RunStatus) {
        self.set_state(ControllerState::Closing);
        self.tearing_down = true;
        self.teardown();
        self.session.run_id = None;
        self.session.status = status;
        self.live_tool_call = None;
        let _ = self.reconcile().await;
        self.tearing_down = false;
        self.set_state(ControllerState::Idle);
    }

    /// The run reported a failure. The run id is kept so the synchronizer
    /// can ask the backend what actually happened.
    fn fail_run(&mut self, message: String) {
        self.teardown();
        self.live_tool_call = None;

        if is_policy_message(&message) {
            tracing::warn!(thread_id = %self.session.thread_id, %message, "run stopped by usage policy");
            self.notify(NoticeKind::PolicyStop, message);
            self.session.status = RunStatus::Stopped;
            self.set_state(ControllerState::Idle);
        } else {
            tracing::error!(thread_id = %self.session.thread_id, %message, "agent run failed");
            self.set_state(ControllerState::Error);
            self.notify(NoticeKind::Error, message);
            self.session.status = RunStatus::Error;
            self.set_state(ControllerState::Idle);
        }

        // Surfaced above; the partial output goes with it.
        self.parser.reset();
        self.rebuild_view();
        self.sync_requested = true;
    }

    async fn lose_transport(&mut self, err: BackendError) {
        let err = StreamError::Transport {
            reason: err.to_string(),
        };
        tracing::warn!(run_id = ?self.session.run_id, error = %err, "event stream broke");
        self.set_state(ControllerState::Closing);
        self.tearing_down = true;
        self.teardown();
        self.session.status = RunStatus::Idle;
        self.notify(NoticeKind::Transient, err.to_string());
        let _ = self.reconcile().await;
        self.tearing_down = false;
        self.set_state(ControllerState::Idle);
        self.sync_requested = true;
    }

    // ─── Connection Plumbing ────────────────────────────────────────────

    async fn connect(&mut self, run_id: &RunId) -> Result<(), StreamError> {
        let stream = self
            .backend
            .open_stream(run_id)
            .await
            .map_err(StreamError::from_backend)?;

        self.generation += 1;
        let generation = self.generation;
        let task = tokio::spawn(forward_frames(stream, generation, self.input_tx.clone()));
        self.session.connection = Some(Connection { generation, task });
        self.loss_surfaced = false;
        tracing::debug!(run_id = %run_id, generation, "connection opened");
        Ok(())
    }

    /// Drop the live connection. Frames already queued from it become stale.
    fn teardown(&mut self) {
        if let Some(connection) = self.session.connection.take() {
            connection.task.abort();
            tracing::debug!(generation = connection.generation, "connection torn down");
        }
        self.generation += 1;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .connection
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    // ─── Bookkeeping ────────────────────────────────────────────────────

    /// `Running` requires a live connection and a run id; anything else is
    /// corrected to `Idle`.
    pub fn enforce_consistency(&mut self) {
        if self.session.status == RunStatus::Running
            && !(self.is_live() && self.session.run_id.is_some())
        {
            tracing::warn!(
                thread_id = %self.session.thread_id,
                run_id = ?self.session.run_id,
                state = ?self.state,
                "status running without a live run, forcing idle"
            );
            self.session.status = RunStatus::Idle;
        }
    }

    fn finish_input(&mut self) {
        self.enforce_consistency();
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn set_state(&mut self, next: ControllerState) {
        if self.state != next {
            tracing::info!(
                thread_id = %self.session.thread_id,
                from = ?self.state,
                to = ?next,
                "session state"
            );
            self.state = next;
        }
    }

    fn notify(&mut self, kind: NoticeKind, message: impl Into<String>) {
        self.notices.push(Notice {
            kind,
            message: message.into(),
        });
    }

    fn surface(&mut self, err: &StreamError) {
        match err {
            StreamError::PolicyStop { message } => {
                self.notify(NoticeKind::PolicyStop, message.clone());
            }
            other => self.notify(NoticeKind::Error, other.to_string()),
        }
    }

    /// Keep unsaved streamed output as a local assistant message.
    fn preserve_buffer(&mut self) {
        let text = self.parser.buffer().to_string();
        self.parser.reset();
        if !text.trim().is_empty() {
            let mut message = ThreadMessage::local(MessageKind::Assistant, text);
            message.connection_lost = true;
            self.messages.push(message);
        }
        self.rebuild_view();
    }

    /// Re-extract nodes from history and rebuild the paired view.
    fn rebuild_view(&mut self) {
        self.history_nodes.clear();
        for (position, message) in self.messages.iter().enumerate() {
            let side = match message.kind {
                MessageKind::Assistant => Side::Call,
                MessageKind::Tool => Side::Result,
                MessageKind::User | MessageKind::Status => continue,
            };
            let ctx = ParseContext::new(message.source_key(position), side, message.created_at);
            let parsed = parse_tags_with(&message.content, ctx);
            self.history_nodes.extend(parsed.nodes().cloned());
        }
        self.refresh_view();
    }

    /// Rebuild the paired view from history plus the live buffer's current
    /// nodes. Live nodes that a later closing tag folded into content are
    /// gone from the parse, so they leave the view too.
    fn refresh_view(&mut self) {
        let live = self.parser.result();
        self.pairing.clear();
        self.pairing
            .ingest(self.history_nodes.iter().chain(live.nodes()));
    }

    #[cfg(test)]
    pub(crate) fn force_session(&mut self, status: RunStatus, run_id: Option<RunId>) {
        self.session.status = status;
        self.session.run_id = run_id;
    }
}

impl Drop for StreamSessionController {
    fn drop(&mut self) {
        if let Some(connection) = self.session.connection.take() {
            connection.task.abort();
        }
    }
}

/// Forward one connection's frames into the controller's input channel.
async fn forward_frames(
    mut stream: FrameStream,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(raw) => {
                if tx.send(SessionInput::Frame { generation, raw }).is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = tx.send(SessionInput::Ended {
                    generation,
                    error: Some(error),
                });
                return;
            }
        }
    }
    let _ = tx.send(SessionInput::Ended {
        generation,
        error: None,
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::mock::{Failures, FrameScript, ScriptedBackend, StreamTail};
    use crate::markup::ToolTag;

    fn controller(
        backend: &Arc<ScriptedBackend>,
    ) -> (StreamSessionController, mpsc::UnboundedReceiver<SessionInput>) {
        let backend: Arc<dyn AgentBackend> = backend.clone();
        StreamSessionController::new("thread-1", backend, StreamConfig::default())
    }

    async fn pump(
        ctl: &mut StreamSessionController,
        rx: &mut mpsc::UnboundedReceiver<SessionInput>,
        count: usize,
    ) {
        for _ in 0..count {
            let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("input within timeout")
                .expect("channel open");
            ctl.handle_input(input).await;
        }
    }

    #[tokio::test]
    async fn test_content_then_completed_ends_idle_with_one_fetch() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            [
                r#"data: {"type":"content","content":"Hello "}"#,
                "data: world",
                r#"data: {"type":"status","status":"completed"}"#,
            ],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);

        ctl.submit_message("hi").await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Connecting);

        pump(&mut ctl, &mut rx, 2).await;
        assert_eq!(ctl.state(), ControllerState::Streaming);
        assert_eq!(ctl.streaming_text(), "Hello world");

        pump(&mut ctl, &mut rx, 1).await;
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.streaming_text(), "");
        assert_eq!(ctl.session().run_id, None);
        assert_eq!(backend.calls().fetch_messages, 1);
        assert_eq!(backend.calls().posted, vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_ends_idle_even_when_backend_rejects() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["partial"], StreamTail::Hang));
        backend.set_failures(Failures {
            stop: true,
            ..Failures::default()
        });
        let (mut ctl, mut rx) = controller(&backend);

        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 1).await;
        assert_eq!(ctl.state(), ControllerState::Streaming);

        ctl.stop().await;
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_ne!(ctl.session().status, RunStatus::Running);
        assert!(ctl.session().connection.is_none());
        assert_eq!(backend.calls().stop, 1);
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut ctl, _rx) = controller(&backend);
        ctl.stop().await;
        assert_eq!(backend.calls().stop, 0);
        assert_eq!(backend.calls().fetch_messages, 0);
    }

    #[tokio::test]
    async fn test_frames_from_old_connection_ignored() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut ctl, _rx) = controller(&backend);

        ctl.submit_message("first").await.unwrap();
        let old = ctl.session().connection.as_ref().unwrap().generation;
        ctl.submit_message("second").await.unwrap();
        assert_eq!(backend.calls().start, 2);

        ctl.handle_input(SessionInput::Frame {
            generation: old,
            raw: "late text".into(),
        })
        .await;
        assert_eq!(ctl.streaming_text(), "");
        assert_eq!(ctl.state(), ControllerState::Connecting);
        assert_eq!(ctl.session().run_id, Some(RunId::new("run-2")));
    }

    #[tokio::test]
    async fn test_watchdog_reconnects_once_per_cooldown() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut ctl, _rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        let t0 = Instant::now();
        assert_eq!(backend.calls().open, 1);

        ctl.on_tick_at(t0 + Duration::from_secs(5)).await;
        assert_eq!(backend.calls().open, 1);

        ctl.on_tick_at(t0 + Duration::from_secs(11)).await;
        assert_eq!(backend.calls().open, 2);

        ctl.on_tick_at(t0 + Duration::from_secs(13)).await;
        assert_eq!(backend.calls().open, 2);

        ctl.on_tick_at(t0 + Duration::from_secs(17)).await;
        assert_eq!(backend.calls().open, 3);
        assert_eq!(ctl.state(), ControllerState::Connecting);
        assert_eq!(ctl.session().run_id, Some(RunId::new("run-1")));
    }

    #[tokio::test]
    async fn test_reconnect_resets_buffer_for_replay() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["Hello"], StreamTail::Hang));
        backend.push_script(FrameScript::new(["Hello", " again"], StreamTail::Hang));
        let (mut ctl, mut rx) = controller(&backend);

        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 1).await;
        let t0 = Instant::now();

        ctl.on_tick_at(t0 + Duration::from_secs(11)).await;
        assert_eq!(ctl.streaming_text(), "");
        pump(&mut ctl, &mut rx, 2).await;
        assert_eq!(ctl.streaming_text(), "Hello again");
    }

    #[tokio::test]
    async fn test_failed_reconnect_goes_idle_and_requests_sync() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut ctl, _rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        let t0 = Instant::now();

        backend.set_failures(Failures {
            open: true,
            ..Failures::default()
        });
        ctl.on_tick_at(t0 + Duration::from_secs(11)).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.session().status, RunStatus::Idle);
        assert!(ctl.take_sync_request());
        let notices = ctl.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].kind, NoticeKind::Error);
    }

    #[tokio::test]
    async fn test_error_frame_surfaces_then_clears() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            ["some output", r#"{"type":"status","status":"error","message":"sandbox died"}"#],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 2).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.streaming_text(), "");
        assert_eq!(
            ctl.take_notices(),
            vec![Notice {
                kind: NoticeKind::Error,
                message: "sandbox died".into()
            }]
        );
        assert!(ctl.take_sync_request());
    }

    #[tokio::test]
    async fn test_policy_stop_is_distinct_notice() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            [r#"{"type":"status","status":"stopped","message":"Monthly usage limit reached"}"#],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 1).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        let notices = ctl.take_notices();
        assert_eq!(notices[0].kind, NoticeKind::PolicyStop);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_idle() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_failures(Failures {
            start: Some(500),
            ..Failures::default()
        });
        let (mut ctl, _rx) = controller(&backend);

        assert!(ctl.submit_message("go").await.is_err());
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.take_notices()[0].kind, NoticeKind::Error);
        assert_eq!(backend.calls().open, 0);
    }

    #[tokio::test]
    async fn test_payment_required_on_start_is_policy_stop() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_failures(Failures {
            start: Some(402),
            ..Failures::default()
        });
        let (mut ctl, _rx) = controller(&backend);

        let err = ctl.submit_message("go").await.unwrap_err();
        assert!(matches!(err, StreamError::PolicyStop { .. }));
        assert_eq!(ctl.take_notices()[0].kind, NoticeKind::PolicyStop);
    }

    #[tokio::test]
    async fn test_reconcile_failure_keeps_buffer_as_message() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            ["Hello world", "[DONE]"],
            StreamTail::Hang,
        ));
        backend.set_failures(Failures {
            fetch: true,
            ..Failures::default()
        });
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 2).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.streaming_text(), "");
        let last = ctl.messages().last().unwrap();
        assert_eq!(last.content, "Hello world");
        assert!(last.connection_lost);
        assert_eq!(ctl.take_notices()[0].kind, NoticeKind::ConnectionLost);
    }

    #[tokio::test]
    async fn test_stream_end_reconciles() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["done soon"], StreamTail::End));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 2).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(backend.calls().fetch_messages, 1);
    }

    #[tokio::test]
    async fn test_transport_error_requests_sync() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["partial"], StreamTail::Fail));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 2).await;

        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.session().run_id, Some(RunId::new("run-1")));
        assert_eq!(ctl.take_notices()[0].kind, NoticeKind::Transient);
        assert!(ctl.take_sync_request());
    }

    #[tokio::test]
    async fn test_live_tags_feed_pairing_view() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            [
                "Listing files. <execute-command>",
                "ls -la</execute-command>",
                r#"{"type":"tool_call","name":"execute-command","arguments":{"command":"ls -la"}}"#,
            ],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();

        pump(&mut ctl, &mut rx, 1).await;
        assert_eq!(ctl.parse_result().open.len(), 1);
        assert_eq!(ctl.tool_calls().len(), 1);

        pump(&mut ctl, &mut rx, 2).await;
        let result = ctl.parse_result();
        assert!(result.open.is_empty());
        assert_eq!(result.closed_nodes().next().unwrap().content, "ls -la");
        assert_eq!(ctl.tool_calls().len(), 1);
        assert_eq!(ctl.live_tool_call().unwrap().name, "execute-command");
    }

    #[tokio::test]
    async fn test_whitespace_only_frame_is_streamed() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            ["data: Hello", "data:  ", "data: world"],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 3).await;

        assert_eq!(ctl.streaming_text(), "Hello world");
    }

    #[tokio::test]
    async fn test_closed_outer_tag_drops_inner_live_node() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(
            ["<ask>Run <execute-command>rm x", "</execute-command>?</ask>"],
            StreamTail::Hang,
        ));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();

        pump(&mut ctl, &mut rx, 1).await;
        assert_eq!(ctl.tool_calls().len(), 2);

        pump(&mut ctl, &mut rx, 1).await;
        let parsed: Vec<ToolTag> = ctl.parse_result().nodes().map(|n| n.tag).collect();
        let shown: Vec<ToolTag> = ctl.tool_calls().iter().map(|e| e.tag()).collect();
        assert_eq!(parsed, vec![ToolTag::Ask]);
        assert_eq!(shown, parsed);
    }

    #[tokio::test]
    async fn test_new_run_drops_previous_live_nodes() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["<execute-command>ls"], StreamTail::Hang));
        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("first").await.unwrap();
        pump(&mut ctl, &mut rx, 1).await;
        assert_eq!(ctl.tool_calls().len(), 1);

        ctl.submit_message("second").await.unwrap();
        assert!(ctl.tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconciled_history_pairs_calls_with_results() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(FrameScript::new(["[DONE]"], StreamTail::Hang));
        let mut call = ThreadMessage::local(
            MessageKind::Assistant,
            r#"<execute-command command="ls">ls</execute-command>"#,
        );
        call.message_id = Some("m1".into());
        let mut result = ThreadMessage::local(
            MessageKind::Tool,
            r#"<execute-command command="ls">a.txt</execute-command>"#,
        );
        result.message_id = Some("m2".into());
        backend.set_messages(vec![call, result]);

        let (mut ctl, mut rx) = controller(&backend);
        ctl.submit_message("go").await.unwrap();
        pump(&mut ctl, &mut rx, 1).await;

        let entries = ctl.tool_calls();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], ToolCallEntry::Paired { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_published() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut ctl, _rx) = controller(&backend);
        let rx = ctl.subscribe();
        ctl.submit_message("go").await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.state, ControllerState::Connecting);
        assert_eq!(snapshot.run_id, Some(RunId::new("run-1")));
        assert_eq!(snapshot.status, RunStatus::Running);
    }
}
