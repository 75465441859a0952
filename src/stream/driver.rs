//! The session driver: one task, one input at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::controller::{SessionInput, SessionSnapshot, StreamSessionController};
use crate::backend::AgentBackend;
use crate::sync::RunSynchronizer;

/// Commands accepted from a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Submit(String),
    Stop,
    /// Stop any live run and end the driver loop.
    Shutdown,
}

/// Handle a view keeps to talk to a running driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    pub commands: mpsc::Sender<SessionCommand>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
}

pub struct SessionDriver {
    controller: StreamSessionController,
    synchronizer: RunSynchronizer,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    commands: mpsc::Receiver<SessionCommand>,
}

impl SessionDriver {
    pub fn new(
        controller: StreamSessionController,
        inputs: mpsc::UnboundedReceiver<SessionInput>,
        backend: Arc<dyn AgentBackend>,
    ) -> (Self, DriverHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let handle = DriverHandle {
            commands: command_tx,
            snapshots: controller.subscribe(),
        };
        let driver = Self {
            controller,
            synchronizer: RunSynchronizer::new(backend),
            inputs,
            commands: command_rx,
        };
        (driver, handle)
    }

    pub fn controller(&self) -> &StreamSessionController {
        &self.controller
    }

    /// Run until shutdown and hand the controller back.
    pub async fn run(self) -> StreamSessionController {
        self.run_with(|_| {}).await
    }

    /// Run until shutdown, calling `view` after every handled input.
    pub async fn run_with<F>(mut self, mut view: F) -> StreamSessionController
    where
        F: FnMut(&mut StreamSessionController),
    {
        if let Err(e) = self.synchronizer.on_load(&mut self.controller).await {
            tracing::warn!(thread_id = self.controller.thread_id(), error = %e, "initial load failed");
        }
        view(&mut self.controller);

        let mut ticker = tokio::time::interval(self.controller.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(input) = self.inputs.recv() => {
                    self.controller.handle_input(input).await;
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Submit(text)) => {
                        if let Err(e) = self.controller.submit_message(&text).await {
                            tracing::warn!(error = %e, "submit failed");
                        }
                    }
                    Some(SessionCommand::Stop) => self.controller.stop().await,
                    Some(SessionCommand::Shutdown) | None => {
                        self.controller.stop().await;
                        view(&mut self.controller);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.controller.on_tick().await;
                }
            }

            if self.controller.take_sync_request() {
                let outcome = self.synchronizer.sync(&mut self.controller).await;
                tracing::debug!(?outcome, "synchronizer pass");
            }
            view(&mut self.controller);
        }

        tracing::info!(thread_id = self.controller.thread_id(), "session driver stopped");
        self.controller
    }
}
