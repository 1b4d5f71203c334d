//! Per-thread single-flight executor for the assistant CLI.
//!
//! One coordinator task owns the busy/queue state for every thread and is
//! reached only through its command channel. Each run is its own task; a
//! supervisor reports completion back to the coordinator even when the run
//! panics, and the coordinator then starts the queued request, if any.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::memory::HybridRetriever;
use crate::sessions::{SessionMap, SessionRecord};
use crate::util::{kill_group, split_reply, terminate_group, truncate_chars};

pub(crate) const QUEUED_NOTICE: &str =
    "⏳ Still working on the previous request. Yours will run when it finishes.";
pub(crate) const REPLACED_NOTICE: &str =
    "⏳ Replaced the earlier queued request. Yours will run when the current one finishes.";
pub(crate) const NO_RESPONSE_NOTICE: &str = "⚠️ The assistant returned no response.";

fn timeout_notice(limit: Duration) -> String {
    format!("⏰ No response within {} seconds; the run was stopped.", limit.as_secs_f32())
}

fn error_notice(err: &dyn std::fmt::Display) -> String {
    format!("❌ Error: {err}")
}

// ── Destination ──────────────────────────────────────────────────────────

/// Where replies and notices for one conversation go.
#[async_trait]
pub(crate) trait Destination: Send + Sync {
    async fn send(&self, text: &str) -> GatewayResult<()>;

    /// Human-readable conversation name, used as the transcript title.
    fn label(&self) -> String {
        String::new()
    }
}

pub(crate) type SharedDestination = Arc<dyn Destination>;

// ── Public handle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    /// Nothing was running; the prompt started immediately.
    Started,
    /// Queued behind the active run.
    Queued,
    /// Queued behind the active run, discarding an earlier queued prompt.
    Replaced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GatewayStats {
    pub(crate) busy: usize,
    pub(crate) queued: usize,
}

enum Request {
    Submit {
        thread: String,
        prompt: String,
        destination: SharedDestination,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Cancel {
        thread: String,
        reply: oneshot::Sender<bool>,
    },
    DropQueued {
        thread: String,
        reply: oneshot::Sender<()>,
    },
    IsBusy {
        thread: String,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<GatewayStats>,
    },
}

struct RunFinished {
    thread: String,
    run_id: u64,
}

struct Shared {
    config: GatewayConfig,
    sessions: Arc<SessionMap>,
    retriever: Arc<HybridRetriever>,
}

#[derive(Clone)]
pub(crate) struct Gateway {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
}

impl Gateway {
    /// Start the coordinator on the current runtime.
    pub(crate) fn spawn(
        config: GatewayConfig,
        sessions: Arc<SessionMap>,
        retriever: Arc<HybridRetriever>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            sessions,
            retriever,
        });
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            shared: Arc::clone(&shared),
            active: HashMap::new(),
            queued: HashMap::new(),
            next_run: 0,
            done_tx,
        };
        tokio::spawn(coordinator.run(request_rx, done_rx));
        Self { requests, shared }
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionMap> {
        &self.shared.sessions
    }

    pub(crate) fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.shared.retriever
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> GatewayResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .map_err(|_| GatewayError::CoordinatorGone)?;
        rx.await.map_err(|_| GatewayError::CoordinatorGone)
    }

    /// Hand a prompt to the thread's session. If the thread is busy the
    /// prompt takes the single queue slot and the destination is told so.
    pub(crate) async fn submit(
        &self,
        thread: &str,
        prompt: &str,
        destination: SharedDestination,
    ) -> GatewayResult<SubmitOutcome> {
        let outcome = self
            .ask(|reply| Request::Submit {
                thread: thread.to_string(),
                prompt: prompt.to_string(),
                destination: Arc::clone(&destination),
                reply,
            })
            .await?;
        let notice = match outcome {
            SubmitOutcome::Started => None,
            SubmitOutcome::Queued => Some(QUEUED_NOTICE),
            SubmitOutcome::Replaced => Some(REPLACED_NOTICE),
        };
        if let Some(notice) = notice {
            if let Err(err) = destination.send(notice).await {
                warn!(thread, error = %err, "could not deliver queue notice");
            }
        }
        Ok(outcome)
    }

    /// Drop the queued prompt and stop the active run. Returns whether a run
    /// was in flight.
    pub(crate) async fn cancel(&self, thread: &str) -> GatewayResult<bool> {
        self.ask(|reply| Request::Cancel {
            thread: thread.to_string(),
            reply,
        })
        .await
    }

    /// Forget the thread's session so the next prompt starts a new one. Any
    /// queued prompt is discarded.
    pub(crate) async fn reset_session(&self, thread: &str) -> GatewayResult<()> {
        self.ask(|reply| Request::DropQueued {
            thread: thread.to_string(),
            reply,
        })
        .await?;
        self.shared.sessions.remove(thread).await;
        info!(thread, "session reset");
        Ok(())
    }

    pub(crate) async fn is_busy(&self, thread: &str) -> GatewayResult<bool> {
        self.ask(|reply| Request::IsBusy {
            thread: thread.to_string(),
            reply,
        })
        .await
    }

    pub(crate) async fn snapshot(&self) -> GatewayResult<GatewayStats> {
        self.ask(|reply| Request::Stats { reply }).await
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────

struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
}

struct QueuedRequest {
    prompt: String,
    destination: SharedDestination,
}

struct Coordinator {
    shared: Arc<Shared>,
    active: HashMap<String, ActiveRun>,
    queued: HashMap<String, QueuedRequest>,
    next_run: u64,
    done_tx: mpsc::UnboundedSender<RunFinished>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut done: mpsc::UnboundedReceiver<RunFinished>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some(finished) = done.recv() => self.finish(finished),
            }
        }
        debug!("gateway coordinator stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Submit {
                thread,
                prompt,
                destination,
                reply,
            } => {
                let outcome = if self.active.contains_key(&thread) {
                    let replaced = self
                        .queued
                        .insert(thread.clone(), QueuedRequest { prompt, destination })
                        .is_some();
                    info!(thread, replaced, "thread busy, prompt queued");
                    if replaced {
                        SubmitOutcome::Replaced
                    } else {
                        SubmitOutcome::Queued
                    }
                } else {
                    self.start(thread, prompt, destination);
                    SubmitOutcome::Started
                };
                let _ = reply.send(outcome);
            }
            Request::Cancel { thread, reply } => {
                self.queued.remove(&thread);
                let live = match self.active.get(&thread) {
                    Some(run) => {
                        run.cancel.cancel();
                        true
                    }
                    None => false,
                };
                info!(thread, live, "cancel requested");
                let _ = reply.send(live);
            }
            Request::DropQueued { thread, reply } => {
                self.queued.remove(&thread);
                let _ = reply.send(());
            }
            Request::IsBusy { thread, reply } => {
                let _ = reply.send(self.active.contains_key(&thread));
            }
            Request::Stats { reply } => {
                let _ = reply.send(GatewayStats {
                    busy: self.active.len(),
                    queued: self.queued.len(),
                });
            }
        }
    }

    fn start(&mut self, thread: String, prompt: String, destination: SharedDestination) {
        self.next_run += 1;
        let run_id = self.next_run;
        let cancel = CancellationToken::new();
        self.active.insert(
            thread.clone(),
            ActiveRun {
                run_id,
                cancel: cancel.clone(),
            },
        );

        let shared = Arc::clone(&self.shared);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(run_guarded(
                shared,
                thread.clone(),
                prompt,
                Arc::clone(&destination),
                cancel,
            ));
            if let Err(err) = run.await {
                error!(thread, error = %err, "run task aborted");
                let _ = destination.send(&error_notice(&err)).await;
            }
            let _ = done_tx.send(RunFinished { thread, run_id });
        });
    }

    fn finish(&mut self, finished: RunFinished) {
        let RunFinished { thread, run_id } = finished;
        match self.active.get(&thread) {
            Some(run) if run.run_id == run_id => {
                self.active.remove(&thread);
            }
            _ => return,
        }
        if let Some(next) = self.queued.remove(&thread) {
            info!(thread, "starting queued prompt");
            self.start(thread, next.prompt, next.destination);
        }
    }
}

// ── Run ──────────────────────────────────────────────────────────────────

/// Run boundary: any error is logged and shown in the conversation.
async fn run_guarded(
    shared: Arc<Shared>,
    thread: String,
    prompt: String,
    destination: SharedDestination,
    cancel: CancellationToken,
) {
    if let Err(err) = execute(&shared, &thread, &prompt, &destination, &cancel).await {
        error!(thread, error = %err, "run failed");
        if let Err(send_err) = destination.send(&error_notice(&err)).await {
            warn!(thread, error = %send_err, "could not deliver error notice");
        }
    }
}

/// Arguments for one invocation: create the session on first use, resume it
/// afterwards. The prompt always comes last, after `--`.
pub(crate) fn build_args(record: &SessionRecord, extra_args: &[String], prompt: &str) -> Vec<String> {
    let mut args = vec!["-p".to_string()];
    let mode = if record.initialized { "--resume" } else { "--session-id" };
    args.push(mode.to_string());
    args.push(record.session_id.to_string());
    if let Some(model) = &record.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args.extend(extra_args.iter().cloned());
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

enum ReadEnd {
    Eof,
    TimedOut,
}

async fn execute(
    shared: &Shared,
    thread: &str,
    prompt: &str,
    destination: &SharedDestination,
    cancel: &CancellationToken,
) -> GatewayResult<()> {
    let config = &shared.config;
    let (record, is_new) = shared.sessions.resolve(thread).await;
    let session = record.short_id();

    if is_new {
        let report = shared.retriever.index_pending().await;
        info!(thread, session, indexed = report.indexed, failed = report.failed, "new session, indexed pending transcripts");
    }
    if cancel.is_cancelled() {
        info!(thread, session, "cancelled before launch");
        return Ok(());
    }

    let args = build_args(&record, &config.extra_args, prompt);
    info!(thread, session, resume = record.initialized, model = record.model.as_deref().unwrap_or("default"), "launching assistant");

    let mut command = Command::new(&config.program);
    command
        .args(&args)
        .env_remove("CLAUDECODE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            shared.sessions.mark_initialized(thread).await;
            return Err(GatewayError::Spawn {
                program: config.program.clone(),
                source,
            });
        }
    };
    let pid = child.id();

    if let Some(mut stderr) = child.stderr.take() {
        let session = session.clone();
        tokio::spawn(async move {
            let mut raw = Vec::new();
            if stderr.read_to_end(&mut raw).await.is_ok() {
                let text = String::from_utf8_lossy(&raw);
                let text = text.trim();
                if !text.is_empty() {
                    warn!(session, stderr = truncate_chars(text, 500), "assistant stderr");
                }
            }
        });
    }

    let mut output = Vec::new();
    let read = read_stdout(&mut child, &mut output, pid, config.timeout, cancel).await;
    if matches!(read, Ok(ReadEnd::TimedOut)) {
        warn!(thread, session, "assistant timed out");
        if let Some(pid) = pid {
            terminate_group(pid);
        }
    }
    reap(&mut child, pid, config.grace).await;
    shared.sessions.mark_initialized(thread).await;

    if let ReadEnd::TimedOut = read? {
        destination.send(&timeout_notice(config.timeout)).await?;
        return Ok(());
    }

    let text = String::from_utf8_lossy(&output);
    let text = text.trim();
    if text.is_empty() {
        destination.send(NO_RESPONSE_NOTICE).await?;
        return Ok(());
    }

    for (idx, segment) in split_reply(text, config.segment_limit).iter().enumerate() {
        if idx > 0 {
            sleep(config.segment_pause).await;
        }
        destination.send(segment).await?;
    }
    info!(thread, session, chars = text.chars().count(), "reply delivered");

    let retriever = Arc::clone(&shared.retriever);
    let thread = thread.to_string();
    let prompt = prompt.to_string();
    let reply = text.to_string();
    let label = destination.label();
    tokio::spawn(async move {
        retriever.log_turn(&thread, &prompt, &reply, &label).await;
    });
    Ok(())
}

/// Collect stdout until EOF or the run deadline. Cancellation signals the
/// process group and keeps reading, so output already written still arrives.
async fn read_stdout(
    child: &mut Child,
    output: &mut Vec<u8>,
    pid: Option<u32>,
    limit: Duration,
    cancel: &CancellationToken,
) -> GatewayResult<ReadEnd> {
    let Some(mut stdout) = child.stdout.take() else {
        return Ok(ReadEnd::Eof);
    };
    let deadline = Instant::now() + limit;
    let mut buf = [0u8; 4096];
    let mut signalled = false;
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read? {
                0 => return Ok(ReadEnd::Eof),
                n => output.extend_from_slice(&buf[..n]),
            },
            _ = sleep_until(deadline) => return Ok(ReadEnd::TimedOut),
            _ = cancel.cancelled(), if !signalled => {
                signalled = true;
                if let Some(pid) = pid {
                    info!(pid, "terminating assistant on cancel");
                    terminate_group(pid);
                }
            }
        }
    }
}

/// Wait up to `grace` for the process to exit, then kill its group.
async fn reap(child: &mut Child, pid: Option<u32>, grace: Duration) {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) if !status.success() => debug!(%status, "assistant exited"),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(error = %err, "could not wait for assistant"),
        Err(_) => {
            warn!("assistant ignored termination, killing");
            if let Some(pid) = pid {
                kill_group(pid);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use crate::sessions::session_id_for;

    struct RecordingDestination {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Destination for RecordingDestination {
        async fn send(&self, text: &str) -> GatewayResult<()> {
            let _ = self.tx.send(text.to_string());
            Ok(())
        }

        fn label(&self) -> String {
            "test thread".to_string()
        }
    }

    fn recorder() -> (SharedDestination, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingDestination { tx }), rx)
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("destination closed")
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        loop {
            let message = next_message(rx).await;
            if message.starts_with("reply:") {
                return message;
            }
        }
    }

    async fn wait_idle(gateway: &Gateway, thread: &str) {
        let start = Instant::now();
        while gateway.is_busy(thread).await.unwrap() {
            assert!(start.elapsed() < Duration::from_secs(10), "thread never went idle");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// A fake assistant. `last` is the prompt; `$2` is the session mode flag.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-assistant.sh");
        let script = format!("#!/bin/sh\nfor last; do :; done\n{body}\n");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn gateway_with(dir: &Path, program: &Path, retriever: HybridRetriever) -> Gateway {
        let mut config = GatewayConfig::new(program.display().to_string(), dir.to_path_buf());
        config.segment_pause = Duration::from_millis(0);
        config.timeout = Duration::from_secs(5);
        config.grace = Duration::from_secs(1);
        gateway_with_config(config, retriever)
    }

    fn gateway_with_config(config: GatewayConfig, retriever: HybridRetriever) -> Gateway {
        let sessions = Arc::new(SessionMap::load(&config.sessions_file()));
        Gateway::spawn(config, sessions, Arc::new(retriever))
    }

    #[test]
    fn test_build_args_modes() {
        let mut record = SessionRecord {
            session_id: session_id_for("1"),
            initialized: false,
            model: None,
        };
        let extra = vec!["--verbose".to_string()];
        let args = build_args(&record, &extra, "hello");
        assert_eq!(
            args,
            vec![
                "-p".to_string(),
                "--session-id".to_string(),
                session_id_for("1").to_string(),
                "--verbose".to_string(),
                "--".to_string(),
                "hello".to_string(),
            ]
        );

        record.initialized = true;
        record.model = Some("opus".to_string());
        let args = build_args(&record, &[], "-starts-with-dash");
        assert_eq!(args[1], "--resume");
        assert_eq!(&args[3..5], &["--model".to_string(), "opus".to_string()]);
        assert_eq!(args.last().unwrap(), "-starts-with-dash");
        assert_eq!(args[args.len() - 2], "--");
    }

    #[tokio::test]
    async fn test_reply_delivered_and_session_advances() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), r#"echo "reply:$last mode:$2""#);
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        let outcome = gateway.submit("1", "hi", Arc::clone(&dest)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Started);
        assert_eq!(next_reply(&mut rx).await, "reply:hi mode:--session-id");
        wait_idle(&gateway, "1").await;
        assert!(gateway.sessions().get("1").await.unwrap().initialized);

        gateway.submit("1", "again", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:again mode:--resume");
    }

    #[tokio::test]
    async fn test_threads_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 1\necho \"reply:$last\"");
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest_a, mut rx_a) = recorder();
        let (dest_b, mut rx_b) = recorder();

        let started = Instant::now();
        assert_eq!(gateway.submit("a", "one", dest_a).await.unwrap(), SubmitOutcome::Started);
        assert_eq!(gateway.submit("b", "two", dest_b).await.unwrap(), SubmitOutcome::Started);
        assert_eq!(gateway.snapshot().await.unwrap().busy, 2);

        assert_eq!(next_reply(&mut rx_a).await, "reply:one");
        assert_eq!(next_reply(&mut rx_b).await, "reply:two");
        assert!(started.elapsed() < Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn test_busy_thread_keeps_only_latest_queued_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let body = format!(
            "echo \"start $last\" >> {log}\nsleep 0.5\necho \"end $last\" >> {log}\necho \"reply:$last\"",
            log = log.display()
        );
        let script = write_script(dir.path(), &body);
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        assert_eq!(gateway.submit("t", "p0", Arc::clone(&dest)).await.unwrap(), SubmitOutcome::Started);
        assert_eq!(gateway.submit("t", "p1", Arc::clone(&dest)).await.unwrap(), SubmitOutcome::Queued);
        assert_eq!(gateway.submit("t", "p2", Arc::clone(&dest)).await.unwrap(), SubmitOutcome::Replaced);
        assert_eq!(gateway.snapshot().await.unwrap(), GatewayStats { busy: 1, queued: 1 });

        assert_eq!(next_message(&mut rx).await, QUEUED_NOTICE);
        assert_eq!(next_message(&mut rx).await, REPLACED_NOTICE);
        assert_eq!(next_reply(&mut rx).await, "reply:p0");
        assert_eq!(next_reply(&mut rx).await, "reply:p2");
        wait_idle(&gateway, "t").await;

        let runs = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = runs.lines().collect();
        assert_eq!(lines, vec!["start p0", "end p0", "start p2", "end p2"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_queue_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "case \"$last\" in\n  slow) exec sleep 30 ;;\n  *) echo \"reply:$last mode:$2\" ;;\nesac",
        );
        let mut config = GatewayConfig::new(script.display().to_string(), dir.path().to_path_buf());
        config.timeout = Duration::from_millis(300);
        config.grace = Duration::from_secs(1);
        config.segment_pause = Duration::from_millis(0);
        let gateway = gateway_with_config(config, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        let started = Instant::now();
        gateway.submit("x", "slow", Arc::clone(&dest)).await.unwrap();
        gateway.submit("x", "fast", Arc::clone(&dest)).await.unwrap();

        assert_eq!(next_message(&mut rx).await, QUEUED_NOTICE);
        let notice = next_message(&mut rx).await;
        assert!(notice.starts_with("⏰"), "unexpected {notice}");
        assert_eq!(next_reply(&mut rx).await, "reply:fast mode:--resume");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(gateway.sessions().get("x").await.unwrap().initialized);
    }

    #[tokio::test]
    async fn test_term_ignoring_assistant_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("assistant.pid");
        let body = format!(
            "trap '' TERM\necho $$ > {}\nwhile :; do sleep 0.1; done",
            pid_file.display()
        );
        let script = write_script(dir.path(), &body);
        let mut config = GatewayConfig::new(script.display().to_string(), dir.path().to_path_buf());
        config.timeout = Duration::from_millis(300);
        config.grace = Duration::from_millis(500);
        let gateway = gateway_with_config(config, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        let started = Instant::now();
        gateway.submit("k", "stubborn", dest).await.unwrap();
        let notice = next_message(&mut rx).await;
        assert!(notice.starts_with("⏰"), "unexpected {notice}");
        wait_idle(&gateway, "k").await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "grace period skipped: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "assistant {pid} survived the kill");
    }

    #[tokio::test]
    async fn test_child_runs_without_claudecode_variable() {
        // SAFETY: no other test reads or writes CLAUDECODE.
        unsafe { std::env::set_var("CLAUDECODE", "1") };
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), r#"echo "reply:env:${CLAUDECODE:-unset}""#);
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        gateway.submit("v", "hi", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:env:unset");
    }

    #[tokio::test]
    async fn test_heavy_stderr_does_not_stall_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"head -c 300000 /dev/zero | tr '\0' e >&2
echo "reply:$last""#,
        );
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        gateway.submit("d", "noisy", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:noisy");
    }

    #[tokio::test]
    async fn test_cancel_stops_run_and_drops_queue() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "case \"$last\" in\n  slow) exec sleep 30 ;;\n  *) echo \"reply:$last\" ;;\nesac",
        );
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        let started = Instant::now();
        gateway.submit("c", "slow", Arc::clone(&dest)).await.unwrap();
        gateway.submit("c", "queued", Arc::clone(&dest)).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(gateway.cancel("c").await.unwrap());
        wait_idle(&gateway, "c").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!gateway.cancel("c").await.unwrap());

        sleep(Duration::from_millis(300)).await;
        while let Ok(message) = rx.try_recv() {
            assert!(!message.starts_with("reply:"), "queued prompt ran: {message}");
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_and_contained() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-assistant");
        let gateway = gateway_with(dir.path(), &missing, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        gateway.submit("e", "hi", Arc::clone(&dest)).await.unwrap();
        let message = next_message(&mut rx).await;
        assert!(message.starts_with("❌"), "unexpected {message}");
        wait_idle(&gateway, "e").await;
        assert!(gateway.sessions().get("e").await.unwrap().initialized);

        assert_eq!(gateway.submit("e", "again", dest).await.unwrap(), SubmitOutcome::Started);
        assert!(next_message(&mut rx).await.starts_with("❌"));
    }

    #[tokio::test]
    async fn test_empty_output_sends_notice_and_skips_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "if [ \"$last\" = silent ]; then exit 0; fi\necho \"reply:$last\"",
        );
        let mut retriever_config = crate::config::RetrieverConfig::new("local", dir.path().to_path_buf());
        retriever_config.embedding = crate::config::EmbeddingMode::Stub;
        let retriever = HybridRetriever::from_config(&retriever_config);
        let gateway = gateway_with(dir.path(), &script, retriever);
        let (dest, mut rx) = recorder();

        gateway.submit("s", "silent", Arc::clone(&dest)).await.unwrap();
        assert_eq!(next_message(&mut rx).await, NO_RESPONSE_NOTICE);
        wait_idle(&gateway, "s").await;
        sleep(Duration::from_millis(100)).await;
        assert!(!dir.path().join("s.md").exists());

        gateway.submit("s", "talk", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:talk");
        let transcript = dir.path().join("s.md");
        let start = Instant::now();
        while !transcript.exists() {
            assert!(start.elapsed() < Duration::from_secs(5), "turn never logged");
            sleep(Duration::from_millis(20)).await;
        }
        sleep(Duration::from_millis(100)).await;
        let text = std::fs::read_to_string(&transcript).unwrap();
        assert!(text.starts_with("# Session: test thread"));
        assert!(text.contains("**User:** talk"));
        assert!(text.contains("**Assistant:** reply:talk"));
    }

    #[tokio::test]
    async fn test_new_session_indexes_pending_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.md"), "# Session: old\n\nsome history").unwrap();
        let script = write_script(dir.path(), "echo \"reply:$last\"");
        let mut retriever_config = crate::config::RetrieverConfig::new("local", dir.path().to_path_buf());
        retriever_config.embedding = crate::config::EmbeddingMode::Stub;
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::from_config(&retriever_config));
        let (dest, mut rx) = recorder();

        gateway.submit("n", "hello", dest).await.unwrap();
        next_reply(&mut rx).await;
        let ledger = crate::memory::IndexLedger::load(&dir.path().join(".indexed.json"));
        assert!(ledger.recorded("old.md").is_some());
    }

    #[tokio::test]
    async fn test_long_reply_is_segmented_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "printf 'reply:aa\\nreply:bb\\nreply:cc\\n'");
        let mut config = GatewayConfig::new(script.display().to_string(), dir.path().to_path_buf());
        config.segment_limit = 10;
        config.segment_pause = Duration::from_millis(0);
        let gateway = gateway_with_config(config, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        gateway.submit("l", "go", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:aa");
        assert_eq!(next_reply(&mut rx).await, "reply:bb");
        assert_eq!(next_reply(&mut rx).await, "reply:cc");
    }

    #[tokio::test]
    async fn test_reset_forgets_session() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), r#"echo "reply:$last mode:$2""#);
        let gateway = gateway_with(dir.path(), &script, HybridRetriever::disabled(dir.path()));
        let (dest, mut rx) = recorder();

        gateway.submit("r", "one", Arc::clone(&dest)).await.unwrap();
        next_reply(&mut rx).await;
        wait_idle(&gateway, "r").await;

        gateway.reset_session("r").await.unwrap();
        assert!(gateway.sessions().get("r").await.is_none());
        gateway.submit("r", "two", dest).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "reply:two mode:--session-id");
    }
}
