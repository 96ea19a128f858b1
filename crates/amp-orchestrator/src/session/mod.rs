//! Session lifecycle and per-iteration orchestration
//!
//! The manager owns create → iterate → cleanup for worktree-isolated agent
//! sessions, wiring git operations, the agent adapter, the store, and the
//! event bus together. Iterations within a session are serialized; a second
//! `iterate` while one is running is refused.

pub mod context;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{
    AdapterError, AgentEvent, AgentEventKind, AmpAdapter, RunOutcome, RunRequest,
};
use session_core::{
    BusError, DiffStats, GitError, GitOps, Iteration, MetricEvent, Session, SessionMode,
    SessionStatus, SharedEventBus, SharedStore, StoreError, TestResult, ToolCallRecord,
};

pub use context::ContextBundle;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not a git working tree: {0}")]
    NotARepo(PathBuf),

    #[error("repository has no commits: {0}")]
    EmptyRepo(PathBuf),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("an iteration is already running for session {0}")]
    IterationInFlight(String),

    #[error("session {0} is done; only cleanup may touch it")]
    SessionDone(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub repo_root: PathBuf,
    pub name: String,
    pub prompt: String,
    pub base_branch: String,
    pub script_command: Option<String>,
    pub model_override: Option<String>,
    pub auto_commit: bool,
    pub mode: SessionMode,
    /// Per-iteration wall-clock budget override (batch items set this).
    pub timeout: Option<Duration>,
}

impl CreateSessionOptions {
    pub fn new(repo_root: impl Into<PathBuf>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            name: name.into(),
            prompt: prompt.into(),
            base_branch: "main".to_string(),
            script_command: None,
            model_override: None,
            auto_commit: true,
            mode: SessionMode::Async,
            timeout: None,
        }
    }
}

/// Runtime inputs for one iteration.
#[derive(Debug, Clone, Default)]
pub struct IterateOptions {
    pub notes: Option<String>,
    pub model_override: Option<String>,
    pub timeout: Option<Duration>,
}

/// Orchestrates session worktrees and agent iterations.
pub struct SessionManager {
    store: SharedStore,
    bus: SharedEventBus,
    git: GitOps,
    adapter: AmpAdapter,
    running: Mutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(store: SharedStore, bus: SharedEventBus, git: GitOps, adapter: AmpAdapter) -> Self {
        Self {
            store,
            bus,
            git,
            adapter,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    /// Create a session: validate the repo, cut the branch and worktree,
    /// write the context bundle, persist, and run the initial iteration.
    ///
    /// Batch callers rely on this producing the first (and only) iteration.
    pub async fn create_session(
        &self,
        options: CreateSessionOptions,
        cancel: &CancellationToken,
    ) -> SessionResult<Session> {
        let repo = options.repo_root.clone();
        if !self.git.is_work_tree(&repo).await {
            return Err(SessionError::NotARepo(repo));
        }
        if !self.git.has_commits(&repo).await {
            return Err(SessionError::EmptyRepo(repo));
        }

        let session_id = Uuid::new_v4().to_string();
        let branch_name = format!(
            "agent/{}/{}",
            kebab_slug(&options.name),
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let worktree = repo.join(".worktrees").join(&session_id);

        self.git
            .create_worktree(&repo, &branch_name, &worktree, &options.base_branch)
            .await?;
        // Context metadata must never reach diffs or commits.
        self.git
            .ensure_excluded(&worktree, &format!("{}/", context::CONTEXT_DIR))
            .await?;

        let mut session = Session::new(
            &options.name,
            &options.prompt,
            repo.display().to_string(),
            &options.base_branch,
            &branch_name,
            worktree.display().to_string(),
        );
        session.id = session_id;
        session.script_command = options.script_command.clone();
        session.model_override = options.model_override.clone();
        session.auto_commit = options.auto_commit;
        session.mode = options.mode;

        ContextBundle::new(&worktree).write_initial(&session)?;
        self.store.insert_session(&session)?;
        info!(session_id = %session.id, branch = %branch_name, "session created");

        // Initial iteration. The session record survives an iteration
        // failure; the worktree is left intact for inspection.
        self.iterate(
            &session.id,
            IterateOptions {
                timeout: options.timeout,
                ..IterateOptions::default()
            },
            cancel,
        )
        .await?;

        self.store
            .get_session(&session.id)?
            .ok_or_else(|| SessionError::NotFound(session.id.clone()))
    }

    /// Run one agent iteration for an existing session.
    pub async fn iterate(
        &self,
        session_id: &str,
        options: IterateOptions,
        cancel: &CancellationToken,
    ) -> SessionResult<Iteration> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status == SessionStatus::Running {
            return Err(SessionError::IterationInFlight(session_id.to_string()));
        }
        if session.status == SessionStatus::Done {
            return Err(SessionError::SessionDone(session_id.to_string()));
        }

        let _guard = self.claim(session_id)?;
        self.set_status(session_id, SessionStatus::Running, None).await?;

        let result = self.run_iteration_inner(&session, &options, cancel).await;

        match result {
            Ok((iteration, final_status, note)) => {
                self.set_status(session_id, final_status, note.as_deref())
                    .await?;
                self.store.touch_session_last_run(session_id)?;
                Ok(iteration)
            }
            Err(e) => {
                let note = format!("iteration failed: {e}");
                self.set_status(session_id, SessionStatus::Error, Some(&note))
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_iteration_inner(
        &self,
        session: &Session,
        options: &IterateOptions,
        cancel: &CancellationToken,
    ) -> SessionResult<(Iteration, SessionStatus, Option<String>)> {
        let worktree = PathBuf::from(&session.worktree_path);
        let bundle = ContextBundle::new(&worktree);

        // Refresh the diff summary before the agent looks at the tree.
        let diff = self.git.diff_unified0(&worktree).await.unwrap_or_default();
        bundle.write_diff_summary(&diff)?;

        let pre_sha = self.git.current_head(&worktree).await?;
        let mut iteration = Iteration::begin(&session.id);
        iteration.thread_id = session.thread_id.clone();
        self.store.insert_iteration(&iteration)?;
        self.publish(MetricEvent::IterationStarted {
            session_id: session.id.clone(),
            iteration_id: iteration.id.clone(),
            timestamp: iteration.started_at,
        })
        .await;

        // Operator notes ride along with the prompt for this iteration.
        let prompt = match &options.notes {
            Some(notes) => format!("{}\n\nOperator notes:\n{notes}", session.initial_prompt),
            None => session.initial_prompt.clone(),
        };
        let request = RunRequest {
            worktree: worktree.clone(),
            prompt,
            thread_id: session.thread_id.clone(),
            model_override: options
                .model_override
                .clone()
                .or_else(|| session.model_override.clone()),
            timeout: options.timeout,
        };

        let (events_tx, events_rx) = mpsc::channel::<AgentEvent>(64);
        let forwarder = tokio::spawn(forward_events(
            self.bus.clone(),
            session.id.clone(),
            iteration.id.clone(),
            events_rx,
        ));

        let run = self.adapter.run_iteration(&request, events_tx, cancel).await;
        let _ = forwarder.await;

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e) => {
                // Finalize as an error; the worktree stays intact.
                iteration.ended_at = Some(Utc::now());
                self.store.finalize_iteration(&iteration)?;
                let reason = match &e {
                    AdapterError::Cancelled(r) => format!("cancelled: {r}"),
                    AdapterError::Timeout(d) => format!("timed out after {d:?}"),
                    other => other.to_string(),
                };
                bundle
                    .append_iteration_log(&format!("iteration aborted: {reason}"))
                    .ok();
                return Err(e.into());
            }
        };

        // Thread ids are only ever persisted when the agent issued them.
        if let Some(thread_id) = &outcome.thread_id {
            self.store.attach_thread(&session.id, thread_id)?;
            self.store.touch_thread(thread_id)?;
        }

        // Auto-commit anything the agent left dirty.
        let mut commit_sha = None;
        if session.auto_commit && self.git.is_dirty(&worktree).await? {
            let dirty = self.git.status_porcelain(&worktree).await?;
            let message = commit_message(&dirty);
            commit_sha = self.git.commit_changes(&worktree, &message).await?;
        }

        // The agent may also have committed on its own.
        let post_sha = self.git.current_head(&worktree).await?;
        if commit_sha.is_none() && post_sha != pre_sha {
            commit_sha = Some(post_sha.clone());
        }

        // Optional script command decides testResult.
        let mut test_result = TestResult::None;
        let mut test_exit_code = None;
        if let Some(script) = &session.script_command {
            let code = run_script(script, &worktree, cancel).await?;
            test_exit_code = Some(code);
            test_result = if code == 0 {
                TestResult::Pass
            } else {
                TestResult::Fail
            };
        }

        // Diff stats come from numstat alone; agent-emitted file events are
        // provenance, never re-added to the totals.
        let stats = if post_sha != pre_sha {
            self.git
                .diff_numstat_range(&worktree, &pre_sha, &post_sha)
                .await?
        } else {
            self.git.diff_numstat_worktree(&worktree).await?
        };

        finalize_from_outcome(&mut iteration, &outcome, commit_sha, stats, test_result, test_exit_code);
        self.store.finalize_iteration(&iteration)?;

        for call in &outcome.tool_calls {
            self.publish(MetricEvent::ToolCall {
                session_id: session.id.clone(),
                iteration_id: Some(iteration.id.clone()),
                call: tool_call_record(session, &iteration, call),
            })
            .await;
        }
        self.publish(MetricEvent::IterationFinished {
            session_id: session.id.clone(),
            iteration_id: iteration.id.clone(),
            timestamp: iteration.ended_at.unwrap_or_else(Utc::now),
            commit_sha: iteration.commit_sha.clone(),
        })
        .await;

        bundle
            .append_iteration_log(&format!(
                "{}: {} file(s), +{} -{}, tokens {}, test {}",
                iteration.id,
                iteration.files_changed,
                iteration.lines_added,
                iteration.lines_deleted,
                iteration.token_usage.total,
                iteration.test_result.as_str(),
            ))
            .ok();

        let (status, note) = outcome_status(session, &outcome, test_result);
        bundle
            .write_last_status(&serde_json::json!({
                "sessionId": session.id,
                "iterationId": iteration.id,
                "status": status.as_str(),
                "commitSha": iteration.commit_sha,
                "filesChanged": iteration.files_changed,
                "testResult": iteration.test_result.as_str(),
                "updatedAt": Utc::now().to_rfc3339(),
            }))
            .ok();

        Ok((iteration, status, note))
    }

    /// Remove the session worktree and branch.
    ///
    /// Without `force`, deletion requires the session HEAD to be an ancestor
    /// of base. With `force`, worktree, branch, and any residual directory
    /// are removed; the session record is kept (marked done) unless
    /// `delete_record` is set.
    pub async fn cleanup(
        &self,
        session_id: &str,
        force: bool,
        delete_record: bool,
    ) -> SessionResult<()> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let repo = PathBuf::from(&session.repo_root);
        let worktree = PathBuf::from(&session.worktree_path);

        if worktree.exists() {
            if force {
                self.git
                    .force_remove_worktree_and_branch(&repo, &worktree, &session.branch_name)
                    .await?;
            } else {
                self.git
                    .safe_remove_worktree_and_branch(
                        &repo,
                        &worktree,
                        &session.branch_name,
                        &session.base_branch,
                    )
                    .await?;
            }
        }

        if delete_record {
            self.store.delete_session(session_id)?;
        } else if session.status != SessionStatus::Done {
            self.set_status(session_id, SessionStatus::Done, None).await?;
        }
        info!(session_id, force, "session cleaned up");
        Ok(())
    }

    /// Current working-tree diff for UI consumption.
    pub async fn diff(&self, session_id: &str) -> SessionResult<String> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(self
            .git
            .diff_unified0(Path::new(&session.worktree_path))
            .await?)
    }

    fn claim(&self, session_id: &str) -> SessionResult<RunningGuard<'_>> {
        let mut running = self.running.lock().expect("session mutex poisoned");
        if !running.insert(session_id.to_string()) {
            return Err(SessionError::IterationInFlight(session_id.to_string()));
        }
        Ok(RunningGuard {
            manager: self,
            session_id: session_id.to_string(),
        })
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        notes: Option<&str>,
    ) -> SessionResult<()> {
        self.store.update_session_status(session_id, status, notes)?;
        self.publish(MetricEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            status,
        })
        .await;
        Ok(())
    }

    async fn publish(&self, event: MetricEvent) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "event publish failed");
        }
    }
}

struct RunningGuard<'a> {
    manager: &'a SessionManager,
    session_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .running
            .lock()
            .expect("session mutex poisoned")
            .remove(&self.session_id);
    }
}

/// Forward raw agent events onto the bus as stream events, with live token
/// usage for UI subscribers.
async fn forward_events(
    bus: SharedEventBus,
    session_id: String,
    iteration_id: String,
    mut rx: mpsc::Receiver<AgentEvent>,
) {
    while let Some(event) = rx.recv().await {
        let stream = MetricEvent::StreamEvent {
            session_id: session_id.clone(),
            iteration_id: Some(iteration_id.clone()),
            timestamp: Utc::now(),
            event_type: event.event_type().to_string(),
            data: event.raw.clone(),
        };
        if bus.publish(stream).await.is_err() {
            break;
        }
        if let AgentEventKind::TokenUsage { model, usage } = &event.kind {
            let _ = bus
                .publish(MetricEvent::TokenUsage {
                    session_id: session_id.clone(),
                    iteration_id: Some(iteration_id.clone()),
                    timestamp: Utc::now(),
                    model: model.clone(),
                    usage: *usage,
                })
                .await;
        }
    }
}

fn finalize_from_outcome(
    iteration: &mut Iteration,
    outcome: &RunOutcome,
    commit_sha: Option<String>,
    stats: DiffStats,
    test_result: TestResult,
    test_exit_code: Option<i32>,
) {
    iteration.ended_at = Some(Utc::now());
    iteration.commit_sha = commit_sha;
    iteration.files_changed = stats.files_changed;
    iteration.lines_added = stats.lines_added;
    iteration.lines_deleted = stats.lines_deleted;
    iteration.test_result = test_result;
    iteration.test_exit_code = test_exit_code;
    iteration.model = outcome.model.clone();
    iteration.exit_code = outcome.exit_code;
    iteration.token_usage = outcome.usage;
    if outcome.thread_id.is_some() {
        iteration.thread_id = outcome.thread_id.clone();
    }
}

fn tool_call_record(
    session: &Session,
    iteration: &Iteration,
    call: &crate::adapter::CompletedToolCall,
) -> ToolCallRecord {
    ToolCallRecord {
        id: call.id.clone(),
        session_id: session.id.clone(),
        iteration_id: Some(iteration.id.clone()),
        timestamp: call.started_at,
        tool_name: call.name.clone(),
        args_json: call.args_json.clone(),
        success: call.success,
        duration_ms: call.duration_ms,
        raw_json: None,
    }
}

fn outcome_status(
    session: &Session,
    outcome: &RunOutcome,
    _test_result: TestResult,
) -> (SessionStatus, Option<String>) {
    if let Some(first_error) = outcome.error_messages.first() {
        if outcome.exit_code.unwrap_or(0) != 0 {
            return (SessionStatus::Error, Some(first_error.clone()));
        }
    }
    if outcome.exit_code.unwrap_or(0) != 0 {
        return (
            SessionStatus::Error,
            Some(format!(
                "agent exited with code {}",
                outcome.exit_code.unwrap_or(-1)
            )),
        );
    }
    if session.mode == SessionMode::Interactive {
        return (SessionStatus::AwaitingInput, None);
    }
    (SessionStatus::Idle, None)
}

/// Commit message for an auto-commit, derived from the dirty file list.
fn commit_message(porcelain: &str) -> String {
    let files: Vec<&str> = porcelain
        .lines()
        .filter_map(|line| line.get(3..))
        .collect();
    match files.len() {
        0 => "agent: update".to_string(),
        1 => format!("agent: update {}", files[0]),
        n if n <= 3 => format!("agent: update {}", files.join(", ")),
        n => format!(
            "agent: update {} and {} more file(s)",
            files[..3].join(", "),
            n - 3
        ),
    }
}

/// Run the session's script command inside the worktree; returns exit code.
async fn run_script(
    script: &str,
    worktree: &Path,
    cancel: &CancellationToken,
) -> SessionResult<i32> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(worktree)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    tokio::select! {
        _ = cancel.cancelled() => {
            session_core::git::terminate_child(&mut child).await;
            Err(SessionError::Adapter(AdapterError::Cancelled(
                "script cancelled".into(),
            )))
        }
        status = child.wait() => Ok(status?.code().unwrap_or(-1)),
    }
}

/// Lowercase kebab slug for branch names.
pub fn kebab_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed
    }
}
