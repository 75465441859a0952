//! Scripted in-memory backend for controller and synchronizer tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::errors::BackendError;
use super::types::{RunId, RunRecord, RunStatus, ThreadMessage};
use super::{AgentBackend, FrameStream};

/// What a scripted stream does after its frames are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTail {
    /// Stay open without sending anything (a silently dead transport).
    Hang,
    /// End cleanly.
    End,
    /// End with a read error.
    Fail,
}

#[derive(Debug, Clone)]
pub struct FrameScript {
    pub frames: Vec<String>,
    pub tail: StreamTail,
}

impl FrameScript {
    pub fn new<I, S>(frames: I, tail: StreamTail) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            tail,
        }
    }
}

/// Failure switches. Each one makes the named call fail until cleared.
#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub start: Option<u16>,
    pub stop: bool,
    pub status: bool,
    /// `run_status` answers with this HTTP status instead.
    pub status_rejected: Option<u16>,
    pub fetch: bool,
    pub open: bool,
}

#[derive(Debug, Default, Clone)]
pub struct CallCounts {
    pub posted: Vec<String>,
    pub start: usize,
    pub stop: usize,
    pub status: usize,
    pub fetch_messages: usize,
    pub fetch_runs: usize,
    pub open: usize,
}

#[derive(Debug, Default)]
struct MockState {
    next_run: u32,
    status: Option<RunStatus>,
    messages: Vec<ThreadMessage>,
    runs: Vec<RunRecord>,
    scripts: VecDeque<FrameScript>,
    failures: Failures,
    calls: CallCounts,
}

/// An [`AgentBackend`] whose answers are set up by the test.
///
/// Runs are numbered `run-1`, `run-2`, … Each `open_stream` call consumes the
/// next [`FrameScript`]; with none queued the stream hangs.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<MockState>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn push_script(&self, script: FrameScript) {
        self.with(|s| s.scripts.push_back(script));
    }

    /// Status reported by `run_status` for any run.
    pub fn set_status(&self, status: RunStatus) {
        self.with(|s| s.status = Some(status));
    }

    pub fn set_messages(&self, messages: Vec<ThreadMessage>) {
        self.with(|s| s.messages = messages);
    }

    pub fn set_runs(&self, runs: Vec<RunRecord>) {
        self.with(|s| s.runs = runs);
    }

    pub fn set_failures(&self, failures: Failures) {
        self.with(|s| s.failures = failures);
    }

    pub fn calls(&self) -> CallCounts {
        self.with(|s| s.calls.clone())
    }
}

fn refused(call: &str) -> BackendError {
    BackendError::ConnectionFailed {
        endpoint: format!("mock://{call}"),
        reason: "scripted failure".into(),
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn post_message(&self, _thread_id: &str, content: &str) -> Result<(), BackendError> {
        self.with(|s| s.calls.posted.push(content.to_string()));
        Ok(())
    }

    async fn start_run(&self, _thread_id: &str) -> Result<RunId, BackendError> {
        self.with(|s| {
            s.calls.start += 1;
            if let Some(status) = s.failures.start {
                return Err(BackendError::HttpError {
                    status,
                    body: "scripted failure".into(),
                });
            }
            s.next_run += 1;
            Ok(RunId::new(format!("run-{}", s.next_run)))
        })
    }

    async fn stop_run(&self, _run_id: &RunId) -> Result<(), BackendError> {
        self.with(|s| {
            s.calls.stop += 1;
            if s.failures.stop {
                Err(refused("stop"))
            } else {
                Ok(())
            }
        })
    }

    async fn run_status(&self, _run_id: &RunId) -> Result<RunStatus, BackendError> {
        self.with(|s| {
            s.calls.status += 1;
            if s.failures.status {
                return Err(refused("status"));
            }
            if let Some(status) = s.failures.status_rejected {
                return Err(BackendError::HttpError {
                    status,
                    body: "scripted rejection".into(),
                });
            }
            Ok(s.status.unwrap_or(RunStatus::Running))
        })
    }

    async fn fetch_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, BackendError> {
        self.with(|s| {
            s.calls.fetch_messages += 1;
            if s.failures.fetch {
                return Err(refused("messages"));
            }
            Ok(s.messages.clone())
        })
    }

    async fn fetch_runs(&self, _thread_id: &str) -> Result<Vec<RunRecord>, BackendError> {
        self.with(|s| {
            s.calls.fetch_runs += 1;
            if s.failures.fetch {
                return Err(refused("runs"));
            }
            Ok(s.runs.clone())
        })
    }

    async fn open_stream(&self, _run_id: &RunId) -> Result<FrameStream, BackendError> {
        let script = self.with(|s| {
            s.calls.open += 1;
            if s.failures.open {
                return Err(refused("stream"));
            }
            Ok(s.scripts.pop_front())
        })?;

        let Some(script) = script else {
            return Ok(stream::pending().boxed());
        };

        let frames = stream::iter(script.frames.into_iter().map(Ok));
        let tail = match script.tail {
            StreamTail::Hang => stream::pending().boxed(),
            StreamTail::End => stream::empty().boxed(),
            StreamTail::Fail => stream::once(async {
                Err(BackendError::StreamError {
                    reason: "connection reset".into(),
                })
            })
            .boxed(),
        };
        Ok(frames.chain(tail).boxed())
    }
}
