//! Agent process adapter
//!
//! Spawns the external agent CLI and normalizes its stdout into typed
//! events. Two modes: one-shot iterations ([`AmpAdapter::run_iteration`])
//! and keep-alive interactive handles ([`interactive`]).

pub mod events;
pub mod interactive;
pub mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AmpConfig;
use session_core::TokenUsage;

pub use events::{AgentEvent, AgentEventKind};
pub use interactive::{HandleState, InteractiveEvent, InteractiveHandle};
pub use stream::{JsonStreamParser, StreamChunk};

/// Cap stored tool-call argument payloads.
const ARGS_TRUNCATE_LEN: usize = 4 * 1024;

/// Result type alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors from driving the agent process.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("agent binary not found: {path}")]
    AgentNotFound { path: PathBuf },

    #[error("agent run timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent run cancelled: {0}")]
    Cancelled(String),

    /// Interactive sends require a ready handle.
    #[error("interactive handle not ready")]
    HandleNotReady,

    #[error("io error driving agent: {0}")]
    Io(#[from] std::io::Error),
}

/// One agent invocation against a session worktree.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub worktree: PathBuf,
    pub prompt: String,
    /// Prior agent-issued thread id, when continuing a conversation.
    pub thread_id: Option<String>,
    pub model_override: Option<String>,
    /// Overrides the configured iteration timeout (batch items do this).
    pub timeout: Option<Duration>,
}

/// A paired (or orphaned) tool invocation observed during a run.
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub args_json: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Finish arrived without a matching start.
    pub orphan: bool,
}

/// Aggregate outcome of one agent run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Agent-issued thread id observed during the run.
    pub thread_id: Option<String>,
    pub exit_code: Option<i32>,
    pub usage: TokenUsage,
    pub model: Option<String>,
    pub tool_calls: Vec<CompletedToolCall>,
    pub error_messages: Vec<String>,
    /// The run was respawned fresh after the agent rejected the supplied
    /// thread id.
    pub thread_fallback: bool,
}

enum DriveEnd {
    Finished {
        exit_code: Option<i32>,
    },
    /// Agent rejected the supplied thread id; caller respawns fresh.
    ThreadNotFound,
}

/// Spawns and drives the agent CLI.
#[derive(Debug, Clone)]
pub struct AmpAdapter {
    config: AmpConfig,
}

impl AmpAdapter {
    pub fn new(config: AmpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AmpConfig {
        &self.config
    }

    /// Argument vector for one spawn. The adapter never synthesizes
    /// authentication; secrets travel via the environment only.
    fn build_args(&self, request: &RunRequest, thread_id: Option<&str>) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        if self.config.enable_jsonl {
            args.push("--stream-json".to_string());
        }
        if let Some(agent_id) = &self.config.agent_id {
            args.push("--agent".to_string());
            args.push(agent_id.clone());
        }
        if let Some(routing) = &self.config.routing {
            args.push("--routing".to_string());
            args.push(routing.clone());
        }
        if self.config.multi_provider {
            args.push("--multi-provider".to_string());
        }
        if let Some(model) = &request.model_override {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        match thread_id {
            Some(thread) => {
                args.push("continue".to_string());
                args.push(thread.to_string());
                args.push(request.prompt.clone());
            }
            None => args.push(request.prompt.clone()),
        }
        args
    }

    fn spawn(&self, request: &RunRequest, thread_id: Option<&str>) -> AdapterResult<Child> {
        let args = self.build_args(request, thread_id);
        debug!(
            bin = %self.config.bin.display(),
            worktree = %request.worktree.display(),
            continuing = thread_id.is_some(),
            "spawning agent"
        );
        Command::new(&self.config.bin)
            .args(&args)
            .current_dir(&request.worktree)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AdapterError::AgentNotFound {
                        path: self.config.bin.clone(),
                    }
                } else {
                    AdapterError::Io(e)
                }
            })
    }

    /// Run one iteration to completion, streaming typed events to `events_tx`.
    ///
    /// Thread continuity: a supplied thread id is validated by attempting the
    /// continuation; if the agent rejects it, the process is terminated and
    /// respawned without a thread flag, and the fresh id is captured from
    /// `system/init`.
    pub async fn run_iteration(
        &self,
        request: &RunRequest,
        events_tx: mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> AdapterResult<RunOutcome> {
        let timeout = request.timeout.unwrap_or(self.config.iteration_timeout);
        let deadline = Instant::now() + timeout;

        let mut thread_id = request.thread_id.clone();
        let mut outcome = RunOutcome::default();
        loop {
            let child = self.spawn(request, thread_id.as_deref())?;
            let had_thread = thread_id.is_some();
            let end = drive(
                child,
                &events_tx,
                cancel,
                deadline,
                timeout,
                had_thread,
                &mut outcome,
            )
            .await?;
            match end {
                DriveEnd::Finished { exit_code } => {
                    outcome.exit_code = exit_code;
                    return Ok(outcome);
                }
                DriveEnd::ThreadNotFound => {
                    warn!(
                        thread = thread_id.as_deref().unwrap_or_default(),
                        "agent rejected thread; respawning fresh"
                    );
                    thread_id = None;
                    outcome = RunOutcome {
                        thread_fallback: true,
                        ..RunOutcome::default()
                    };
                }
            }
        }
    }
}

/// Incremental UTF-8 decoder tolerant of chunk boundaries inside a
/// multi-byte character.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).expect("validated"));
                    match e.error_len() {
                        // Invalid sequence: replace and continue.
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        // Incomplete sequence: keep the tail for next chunk.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    mut child: Child,
    events_tx: &mpsc::Sender<AgentEvent>,
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    had_thread: bool,
    outcome: &mut RunOutcome,
) -> AdapterResult<DriveEnd> {
    let mut stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    // Drain stderr in the background so the agent cannot block on it.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut reader = stderr;
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).to_string()
    });

    let mut parser = JsonStreamParser::new();
    let mut decoder = Utf8Decoder::default();
    let mut pending_tools: HashMap<String, PendingTool> = HashMap::new();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                session_core::git::terminate_child(&mut child).await;
                return Err(AdapterError::Cancelled("cancellation requested".into()));
            }
            _ = tokio::time::sleep_until(deadline) => {
                session_core::git::terminate_child(&mut child).await;
                return Err(AdapterError::Timeout(timeout));
            }
            read = stdout.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let text = decoder.push(&buf[..n]);
                for chunk in parser.push(&text) {
                    match chunk {
                        StreamChunk::Raw(raw) => {
                            debug!(raw = raw.trim(), "agent prose");
                        }
                        StreamChunk::Json(value) => {
                            let event = AgentEvent::from_value(value);
                            if had_thread && event.is_thread_not_found() {
                                session_core::git::terminate_child(&mut child).await;
                                return Ok(DriveEnd::ThreadNotFound);
                            }
                            absorb(outcome, &mut pending_tools, &event);
                            let _ = events_tx.send(event).await;
                        }
                    }
                }
            }
        }
    }

    for chunk in parser.finish() {
        if let StreamChunk::Raw(raw) = chunk {
            debug!(raw = raw.trim(), "agent trailing prose");
        }
    }

    // Unmatched starts become orphaned failures so nothing is silently lost.
    for (id, pending) in pending_tools.drain() {
        outcome.tool_calls.push(CompletedToolCall {
            id,
            name: pending.name,
            args_json: pending.args_json,
            success: false,
            started_at: pending.started_at,
            duration_ms: None,
            orphan: true,
        });
    }

    let status = tokio::time::timeout_at(deadline, child.wait())
        .await
        .map_err(|_| AdapterError::Timeout(timeout))??;

    if !status.success() {
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !stderr_text.trim().is_empty() {
            debug!(stderr = stderr_text.trim(), "agent stderr");
        }
    } else {
        stderr_task.abort();
    }

    Ok(DriveEnd::Finished {
        exit_code: status.code(),
    })
}

struct PendingTool {
    name: String,
    args_json: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Fold one event into the run outcome, pairing tool starts with finishes.
fn absorb(
    outcome: &mut RunOutcome,
    pending_tools: &mut HashMap<String, PendingTool>,
    event: &AgentEvent,
) {
    match &event.kind {
        AgentEventKind::SystemInit { thread_id } => {
            if let Some(thread_id) = thread_id {
                outcome.thread_id = Some(thread_id.clone());
            }
        }
        AgentEventKind::ToolUse { id, name, args } => {
            let mut args_json = args.to_string();
            if args_json.len() > ARGS_TRUNCATE_LEN {
                args_json.truncate(ARGS_TRUNCATE_LEN);
            }
            pending_tools.insert(
                id.clone(),
                PendingTool {
                    name: name.clone(),
                    args_json,
                    started_at: Utc::now(),
                    started: Instant::now(),
                },
            );
        }
        AgentEventKind::ToolResult { id, success } => {
            match pending_tools.remove(id) {
                Some(pending) => outcome.tool_calls.push(CompletedToolCall {
                    id: id.clone(),
                    name: pending.name,
                    args_json: pending.args_json,
                    success: *success,
                    started_at: pending.started_at,
                    duration_ms: Some(pending.started.elapsed().as_millis() as u64),
                    orphan: false,
                }),
                // Finish without a start: record as orphan.
                None => outcome.tool_calls.push(CompletedToolCall {
                    id: id.clone(),
                    name: String::new(),
                    args_json: String::new(),
                    success: *success,
                    started_at: Utc::now(),
                    duration_ms: None,
                    orphan: true,
                }),
            }
        }
        AgentEventKind::TokenUsage { model, usage } => {
            outcome.usage.add(*usage);
            if model.is_some() {
                outcome.model = model.clone();
            }
        }
        AgentEventKind::Result { exit_code, usage } => {
            if let Some(usage) = usage {
                // Terminal record is authoritative over incremental counts.
                outcome.usage = *usage;
            }
            if exit_code.is_some() {
                outcome.exit_code = *exit_code;
            }
        }
        AgentEventKind::Error { message } => {
            outcome.error_messages.push(message.clone());
        }
        _ => {}
    }
}
