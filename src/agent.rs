//! Agent CLI adapter — spawns and supervises one agent process per session.
//!
//! The agent runs in print mode with stream-json output. Stdout and stderr
//! are teed to the session's log files; text chunks are sampled onto the
//! event bus; termination is reported over an mpsc channel so the scheduler
//! can finalize the session. No turn-level parsing beyond the `result`
//! marker the stream already carries.

use crate::events::EventBus;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

/// Grace period between SIGTERM and SIGKILL on cancel.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to launch one session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: i64,
    pub session_uuid: String,
    pub working_dir: PathBuf,
    pub prompt: String,
    pub model: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Reported when a session's process exits.
#[derive(Debug, Clone)]
pub struct SessionExit {
    pub session_id: i64,
    pub exit_code: i64,
    pub turn_count: i64,
    pub rate_limited: bool,
    pub claude_session_id: Option<String>,
}

/// A currently supervised process.
#[derive(Debug, Clone)]
pub struct RunningSession {
    pub session_id: i64,
    pub pid: u32,
}

/// Process supervision seam. The real implementation shells out to the
/// agent CLI; tests substitute a fake.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Launch the agent. Returns the OS pid. Exit is reported
    /// asynchronously on the adapter's exit channel.
    async fn spawn(&self, spec: SpawnSpec) -> anyhow::Result<u32>;

    /// Terminate a session's process: SIGTERM, then SIGKILL after a grace
    /// period. Idempotent — unknown sessions are a no-op.
    async fn cancel(&self, session_id: i64) -> anyhow::Result<()>;

    /// Snapshot of supervised processes.
    async fn list_running(&self) -> Vec<RunningSession>;
}

/// Supervises agent CLI subprocesses.
pub struct ClaudeCliRunner {
    agent_bin: String,
    bus: Arc<EventBus>,
    exit_tx: mpsc::UnboundedSender<SessionExit>,
    running: Arc<Mutex<HashMap<i64, u32>>>,
}

impl ClaudeCliRunner {
    pub fn new(
        agent_bin: String,
        bus: Arc<EventBus>,
        exit_tx: mpsc::UnboundedSender<SessionExit>,
    ) -> Self {
        Self {
            agent_bin,
            bus,
            exit_tx,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeCliRunner {
    async fn spawn(&self, spec: SpawnSpec) -> anyhow::Result<u32> {
        tokio::fs::create_dir_all(&spec.working_dir).await?;
        if let Some(parent) = spec.stdout_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut child = Command::new(&self.agent_bin)
            .args([
                "-p",
                "--verbose",
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
                "--model",
                spec.model.as_str(),
            ])
            .arg(&spec.prompt)
            .current_dir(&spec.working_dir)
            // The agent CLI must use its own subscription, never our key.
            .env_remove("ANTHROPIC_API_KEY")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("launching agent binary `{}`", self.agent_bin))?;

        let pid = child.id().context("agent process has no pid")?;
        self.running.lock().await.insert(spec.session_id, pid);

        let stdout = child.stdout.take().context("agent stdout not piped")?;
        let stderr = child.stderr.take().context("agent stderr not piped")?;

        let bus = self.bus.clone();
        let exit_tx = self.exit_tx.clone();
        let running = self.running.clone();

        tracing::info!(
            session_id = spec.session_id,
            pid,
            model = %spec.model,
            working_dir = %spec.working_dir.display(),
            "agent spawned"
        );

        tokio::spawn(async move {
            let session_id = spec.session_id;

            let stdout_task = tokio::spawn(drain_stdout(
                stdout,
                spec.stdout_path.clone(),
                bus.clone(),
                session_id,
                spec.session_uuid.clone(),
            ));
            let stderr_task = tokio::spawn(drain_stderr(stderr, spec.stderr_path.clone()));

            let status = child.wait().await;
            let exit_code = match &status {
                Ok(s) => s.code().map(i64::from).unwrap_or(-1),
                Err(_) => -1,
            };

            let stdout_scan = stdout_task.await.unwrap_or_default();
            let stderr_rate_limited = stderr_task.await.unwrap_or(false);

            running.lock().await.remove(&session_id);

            tracing::info!(session_id, exit_code, "agent process exited");

            let exit = SessionExit {
                session_id,
                exit_code,
                turn_count: stdout_scan.turn_count,
                rate_limited: stdout_scan.rate_limited || stderr_rate_limited,
                claude_session_id: stdout_scan.claude_session_id,
            };
            if exit_tx.send(exit).is_err() {
                tracing::warn!(session_id, "exit channel closed, session result dropped");
            }
        });

        Ok(pid)
    }

    async fn cancel(&self, session_id: i64) -> anyhow::Result<()> {
        let pid = match self.running.lock().await.get(&session_id).copied() {
            Some(pid) => pid,
            None => return Ok(()),
        };

        tracing::info!(session_id, pid, "terminating agent process");
        signal_process(pid, "TERM").await;

        let running = self.running.clone();
        tokio::spawn(async move {
            sleep(KILL_GRACE).await;
            if running.lock().await.contains_key(&session_id) {
                tracing::warn!(session_id, pid, "grace expired, killing agent process");
                signal_process(pid, "KILL").await;
            }
        });
        Ok(())
    }

    async fn list_running(&self) -> Vec<RunningSession> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(&session_id, &pid)| RunningSession { session_id, pid })
            .collect()
    }
}

async fn signal_process(pid: u32, signal: &str) {
    let _ = Command::new("kill")
        .args([&format!("-{signal}"), &pid.to_string()])
        .output()
        .await;
}

#[derive(Default)]
struct StdoutScan {
    turn_count: i64,
    rate_limited: bool,
    claude_session_id: Option<String>,
}

/// Tee stdout lines to the log file, sampling text chunks onto the bus and
/// scanning the stream for result markers.
async fn drain_stdout(
    stdout: tokio::process::ChildStdout,
    path: PathBuf,
    bus: Arc<EventBus>,
    session_id: i64,
    session_uuid: String,
) -> StdoutScan {
    let mut scan = StdoutScan::default();
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(session_id, ?e, "cannot open stdout log");
            None
        }
    };

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(f) = file.as_mut() {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }

        let Ok(event) = serde_json::from_str::<Value>(&line) else {
            if is_rate_limit_text(&line) {
                scan.rate_limited = true;
            }
            continue;
        };

        if event.get("type").and_then(Value::as_str) == Some("result") {
            if let Some(turns) = event.get("num_turns").and_then(Value::as_i64) {
                scan.turn_count = scan.turn_count.max(turns);
            }
            if let Some(sid) = event.get("session_id").and_then(Value::as_str) {
                scan.claude_session_id = Some(sid.to_string());
            }
            if event.get("is_error").and_then(Value::as_bool) == Some(true) {
                let text = event.get("result").and_then(Value::as_str).unwrap_or("");
                if is_rate_limit_text(text) {
                    scan.rate_limited = true;
                }
            }
        }

        if let Some(text) = extract_stream_text(&event) {
            let sample: String = text.chars().take(500).collect();
            let _ = bus
                .emit(
                    "session.output",
                    "session",
                    Some(&session_uuid),
                    json!({"session_id": session_id, "output": sample}),
                )
                .await;
        }
    }
    scan
}

/// Drain stderr to the log file; report whether it mentioned rate limiting.
async fn drain_stderr(stderr: tokio::process::ChildStderr, path: PathBuf) -> bool {
    let mut buf = String::new();
    let mut reader = BufReader::new(stderr);
    let _ = reader.read_to_string(&mut buf).await;
    if !buf.is_empty() {
        if let Err(e) = tokio::fs::write(&path, &buf).await {
            tracing::warn!(?e, "cannot write stderr log");
        }
    }
    is_rate_limit_text(&buf)
}

/// Displayable text from a stream-json event.
pub fn extract_stream_text(event: &Value) -> Option<String> {
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let content = event.get("message")?.get("content")?.as_array()?;
            let texts: Vec<&str> = content
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        Some("result") => event
            .get("result")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        _ => None,
    }
}

/// Readable assistant text from a whole captured stream-json log.
pub fn extract_session_text(raw: &str) -> String {
    let mut chunks = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => {
                if let Some(text) = extract_stream_text(&event) {
                    chunks.push(text);
                }
            }
            // Not JSON — keep as-is
            Err(_) => chunks.push(line.to_string()),
        }
    }
    chunks.join("\n\n")
}

/// Phrases in agent output that indicate the account hit its usage limit.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    [
        "you've hit your limit",
        "rate limit",
        "too many requests",
        "usage limit",
        "exceeded your quota",
    ]
    .iter()
    .any(|p| lower.contains(p))
}
