//! `agent-chat`: watch one thread in the terminal, optionally sending a
//! message first. Streams the agent's text to stdout and lists tool calls
//! as they are recognised.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use agent_chat_core::backend::{AgentBackend, HttpBackend};
use agent_chat_core::config::resolve_client_config;
use agent_chat_core::logging;
use agent_chat_core::stream::{
    NoticeKind, SessionCommand, SessionDriver, StreamSessionController,
};

#[derive(Parser)]
#[command(name = "agent-chat", version, about = "Stream an agent thread in the terminal")]
struct Cli {
    /// Thread to attach to.
    #[arg(long)]
    thread: String,

    /// Message to send before streaming the reply.
    #[arg(long)]
    message: Option<String>,

    /// Config file (default: $AGENT_CHAT_CONFIG, then agent-chat.yaml upward).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the config.
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token, overriding the config.
    #[arg(long, env = "AGENT_CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Keep watching after the run ends.
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        resolve_client_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.base_url {
        config.backend.base_url = url;
    }
    if let Some(token) = cli.token {
        config.backend.api_token = Some(token);
    }

    let log_path =
        logging::init_tracing(&config.logging).context("failed to initialise logging")?;
    eprintln!("logging to {}", log_path.display());

    let backend: Arc<dyn AgentBackend> = Arc::new(
        HttpBackend::from_config(&config.backend).context("failed to create backend client")?,
    );
    let (controller, inputs) =
        StreamSessionController::new(cli.thread.as_str(), backend.clone(), config.stream.clone());
    let (driver, handle) = SessionDriver::new(controller, inputs, backend);

    if let Some(message) = &cli.message {
        handle
            .commands
            .send(SessionCommand::Submit(message.clone()))
            .await
            .context("session driver is not running")?;
    }

    let interrupt = handle.commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt.send(SessionCommand::Shutdown).await;
        }
    });

    let mut view = TerminalView::new(handle.commands.clone(), cli.follow, cli.message.is_some());
    let controller = driver.run_with(|ctl| view.render(ctl)).await;

    tracing::info!(
        thread_id = controller.thread_id(),
        messages = controller.messages().len(),
        tool_calls = controller.tool_calls().len(),
        "session finished"
    );
    Ok(())
}

/// Prints the controller's state incrementally.
struct TerminalView {
    commands: mpsc::Sender<SessionCommand>,
    follow: bool,
    awaiting_submit: bool,
    printed_len: usize,
    printed_entries: HashSet<String>,
    seen_live: bool,
    first_render: bool,
}

impl TerminalView {
    fn new(commands: mpsc::Sender<SessionCommand>, follow: bool, awaiting_submit: bool) -> Self {
        Self {
            commands,
            follow,
            awaiting_submit,
            printed_len: 0,
            printed_entries: HashSet::new(),
            seen_live: false,
            first_render: true,
        }
    }

    fn render(&mut self, ctl: &mut StreamSessionController) {
        let mut out = std::io::stdout().lock();

        let text = ctl.streaming_text();
        match text.get(self.printed_len..) {
            Some(fresh) => {
                let _ = out.write_all(fresh.as_bytes());
            }
            None => {
                let _ = writeln!(out);
                let _ = out.write_all(text.as_bytes());
            }
        }
        self.printed_len = text.len();

        for entry in ctl.tool_calls() {
            let key = format!("{}:{:?}", entry.id(), entry.status());
            if self.printed_entries.insert(key) {
                let _ = writeln!(out, "\n[{}] {:?}", entry.tag(), entry.status());
            }
        }
        let _ = out.flush();

        let mut failed = false;
        for notice in ctl.take_notices() {
            failed |= matches!(notice.kind, NoticeKind::Error | NoticeKind::PolicyStop);
            eprintln!("\n[{:?}] {}", notice.kind, notice.message);
        }

        let live = ctl.state().is_live();
        self.seen_live |= live;
        if live {
            self.awaiting_submit = false;
        }

        let nothing_to_watch = self.first_render && !live && !self.awaiting_submit;
        let finished = !live && (self.seen_live || (failed && self.awaiting_submit));
        self.first_render = false;

        if !self.follow && (nothing_to_watch || finished) {
            let _ = self.commands.try_send(SessionCommand::Shutdown);
        }
    }
}
