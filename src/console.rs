//! Line-oriented chat adapter for `serve`.
//!
//! Each stdin line is `<thread> <message>`. Replies are printed as
//! `[<thread>] <text>`. A bare `!status` line reports on the whole gateway.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{Destination, Gateway, SharedDestination};
use crate::sessions::session_id_for;
use crate::util::default_model;

/// Wait between cancelling a busy thread and resetting it.
const RESET_SETTLE: Duration = Duration::from_secs(1);

// ── Commands ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatCommand {
    Cancel,
    Reset,
    Status,
    /// `!model` shows the current model.
    ShowModel,
    /// `!model <name>` sets an override, `!model default` clears it.
    SetModel(Option<String>),
}

/// Recognize a chat command. Anything else, including unknown `!words`, is
/// a prompt for the assistant.
pub(crate) fn parse_command(text: &str) -> Option<ChatCommand> {
    let text = text.trim();
    let rest = text.strip_prefix('!')?;
    let (word, arg) = match rest.split_once(char::is_whitespace) {
        Some((word, arg)) => (word, arg.trim()),
        None => (rest, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "cancel" => Some(ChatCommand::Cancel),
        "reset" => Some(ChatCommand::Reset),
        "status" => Some(ChatCommand::Status),
        "model" if arg.is_empty() => Some(ChatCommand::ShowModel),
        "model" if arg.eq_ignore_ascii_case("default") => Some(ChatCommand::SetModel(None)),
        "model" => Some(ChatCommand::SetModel(Some(arg.to_string()))),
        _ => None,
    }
}

// ── Destination ──────────────────────────────────────────────────────────

pub(crate) struct StdoutDestination {
    thread: String,
}

impl StdoutDestination {
    pub(crate) fn shared(thread: &str) -> SharedDestination {
        Arc::new(Self {
            thread: thread.to_string(),
        })
    }
}

#[async_trait]
impl Destination for StdoutDestination {
    async fn send(&self, text: &str) -> GatewayResult<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "[{}] {}", self.thread, text)
            .and_then(|()| stdout.flush())
            .map_err(|err| GatewayError::Delivery(err.to_string()))
    }

    fn label(&self) -> String {
        format!("console {}", self.thread)
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn thread_status(gateway: &Gateway, thread: &str) -> GatewayResult<String> {
    let sessions = gateway.sessions();
    let record = sessions.get(thread).await;
    let session = record
        .as_ref()
        .map(|r| r.short_id())
        .unwrap_or_else(|| session_id_for(thread).simple().to_string()[..8].to_string());
    let busy = gateway.is_busy(thread).await?;
    let model = match sessions.model(thread).await {
        Some(model) => model,
        None => format!("{} (default)", current_default_model(gateway)),
    };
    let memory = gateway.retriever().status().await.summary();
    Ok(format!(
        "session {session} | busy: {} | initialized: {} | model: {model} | {memory}",
        yes_no(busy),
        yes_no(sessions.is_initialized(thread).await),
    ))
}

async fn global_status(gateway: &Gateway) -> GatewayResult<String> {
    let stats = gateway.snapshot().await?;
    let sessions = gateway.sessions().len().await;
    let memory = gateway.retriever().status().await.summary();
    Ok(format!(
        "{sessions} sessions | {} busy | {} queued | default model: {} | {memory}",
        stats.busy,
        stats.queued,
        current_default_model(gateway),
    ))
}

fn current_default_model(gateway: &Gateway) -> String {
    let config = gateway.config();
    default_model(&config.extra_args, config.settings_path.as_deref())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Run one chat command for `thread` and return the reply text.
pub(crate) async fn run_command(
    gateway: &Gateway,
    thread: &str,
    command: ChatCommand,
) -> GatewayResult<String> {
    match command {
        ChatCommand::Cancel => Ok(if gateway.cancel(thread).await? {
            "🛑 Cancelled.".to_string()
        } else {
            "ℹ️ Nothing is running in this thread.".to_string()
        }),
        ChatCommand::Reset => {
            if gateway.is_busy(thread).await? {
                gateway.cancel(thread).await?;
                sleep(RESET_SETTLE).await;
            }
            let report = gateway.retriever().index_pending().await;
            info!(thread, indexed = report.indexed, "indexed before reset");
            gateway.reset_session(thread).await?;
            Ok("🔄 Session reset. The next message starts a new conversation.".to_string())
        }
        ChatCommand::Status => thread_status(gateway, thread).await,
        ChatCommand::ShowModel => Ok(match gateway.sessions().model(thread).await {
            Some(model) => format!("Model: {model}"),
            None => format!("Model: {} (default)", current_default_model(gateway)),
        }),
        ChatCommand::SetModel(model) => {
            let label = model.clone();
            if !gateway.sessions().set_model(thread, model).await {
                return Ok("ℹ️ No session in this thread yet. Send a message first.".to_string());
            }
            Ok(match label {
                Some(model) => format!("✅ Model set to {model}."),
                None => "✅ Model reset to default.".to_string(),
            })
        }
    }
}

/// Handle one input line. Malformed lines are logged and skipped.
pub(crate) async fn handle_line(gateway: &Gateway, line: &str) -> GatewayResult<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    if parse_command(line) == Some(ChatCommand::Status) {
        println!("{}", global_status(gateway).await?);
        return Ok(());
    }
    let Some((thread, text)) = line.split_once(char::is_whitespace) else {
        warn!(line, "expected `<thread> <message>`");
        return Ok(());
    };
    let text = text.trim();
    let destination = StdoutDestination::shared(thread);

    match parse_command(text) {
        // Reset may wait for a cancelled run and a full indexing pass.
        Some(ChatCommand::Reset) => {
            let gateway = gateway.clone();
            let thread = thread.to_string();
            tokio::spawn(async move {
                let sent = match run_command(&gateway, &thread, ChatCommand::Reset).await {
                    Ok(reply) => destination.send(&reply).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    warn!(thread, error = %err, "reset failed");
                }
            });
            Ok(())
        }
        Some(command) => {
            let reply = run_command(gateway, thread, command).await?;
            destination.send(&reply).await
        }
        None => {
            gateway.submit(thread, text, destination).await?;
            Ok(())
        }
    }
}

/// Read stdin until EOF or `shutdown`. On EOF, waits for in-flight and
/// queued runs so piped input gets its replies.
pub(crate) async fn run_console(gateway: Gateway, shutdown: CancellationToken) -> GatewayResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("console ready: `<thread> <message>` per line");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested");
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(err) = handle_line(&gateway, &line).await {
                        warn!(error = %err, "console line failed");
                    }
                }
                None => break,
            },
        }
    }

    info!("input closed, draining active runs");
    loop {
        let stats = gateway.snapshot().await?;
        if stats.busy == 0 && stats.queued == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
