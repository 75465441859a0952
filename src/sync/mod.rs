//! Run/state synchronizer.
//!
//! Repairs drift between what the controller believes about the thread's run
//! and what the backend reports. Every pass is idempotent: running it twice
//! in a row leaves the same state as running it once.

use std::sync::Arc;

use crate::backend::{AgentBackend, RunId, RunRecord, RunStatus};
use crate::stream::{StreamError, StreamSessionController};

/// What a synchronizer pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No run id is known locally; only the failsafe was applied.
    NoRun,
    /// Backend and controller agree.
    InSync,
    /// The backend is still running the run; streaming was resumed.
    Resumed(RunId),
    /// The backend is done with the run; the local run id was cleared.
    Cleared(RunStatus),
    /// The status query failed transiently, or the run could not be
    /// resumed; local state was left alone.
    Unreachable,
}

pub struct RunSynchronizer {
    backend: Arc<dyn AgentBackend>,
}

impl RunSynchronizer {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }

    /// Load the thread's history and attach to a run that is already active.
    pub async fn on_load(
        &self,
        ctl: &mut StreamSessionController,
    ) -> Result<Option<RunId>, StreamError> {
        ctl.reconcile().await?;

        let Some(active) = find_active_run(ctl.runs()) else {
            tracing::debug!(thread_id = ctl.thread_id(), "no active run on load");
            return Ok(None);
        };
        let run_id = active.run_id.clone();
        ctl.resume_run(run_id.clone()).await?;
        Ok(Some(run_id))
    }

    /// One reconciliation pass against the backend's run status.
    pub async fn sync(&self, ctl: &mut StreamSessionController) -> SyncOutcome {
        ctl.enforce_consistency();

        let Some(run_id) = ctl.session().run_id.clone() else {
            return SyncOutcome::NoRun;
        };

        let status = match self.backend.run_status(&run_id).await {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                tracing::warn!(run_id = %run_id, error = %e, "run status query failed");
                return SyncOutcome::Unreachable;
            }
            // The backend answered and will keep refusing (unknown run,
            // forbidden). Retrying every pass would never converge.
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "backend rejected run, clearing");
                ctl.settle_run().await;
                ctl.enforce_consistency();
                return SyncOutcome::Cleared(RunStatus::Error);
            }
        };

        let outcome = match status {
            RunStatus::Running if ctl.is_live() => SyncOutcome::InSync,
            RunStatus::Running => match ctl.resume_run(run_id.clone()).await {
                Ok(()) => SyncOutcome::Resumed(run_id),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "could not resume run");
                    SyncOutcome::Unreachable
                }
            },
            other => {
                tracing::info!(run_id = %run_id, status = ?other, "backend reports run finished, clearing");
                ctl.settle_run().await;
                SyncOutcome::Cleared(other)
            }
        };

        ctl.enforce_consistency();
        outcome
    }
}

/// The most recently started run the backend reports as running.
fn find_active_run(runs: &[RunRecord]) -> Option<&RunRecord> {
    runs.iter()
        .filter(|run| run.status == RunStatus::Running)
        .max_by_key(|run| run.started_at)
}
