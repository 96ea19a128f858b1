//! Controller facade
//!
//! Process-wide coordinator wiring the store, event bus, git, adapter,
//! session manager, merge engine, and batch scheduler together, and exposing
//! the operations external transports call. Methods are cancel-safe and
//! idempotent where the underlying operation is.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::{AmpAdapter, InteractiveEvent, InteractiveHandle};
use crate::batch::{BatchResult, BatchScheduler};
use crate::config::OrchestratorConfig;
use crate::session::{CreateSessionOptions, IterateOptions, SessionManager, SessionResult};
use session_core::{
    BatchItem, BatchPlan, BatchRun, EventBus, GitOps, Iteration, MergeEngine, MergeStepResult,
    MetricEvent, PreflightReport, RebaseOutcome, Session, SessionStatus, SessionSummary,
    SharedEventBus, SharedStore, SquashMode, SquashOutcome, Store, StoreOptions, StoreSink,
    StreamEventRecord, ThreadRecord, TokenUsage, ToolCallRecord,
};

/// Top-level coordinator handed to transports (CLI, HTTP, UI shells).
pub struct Controller {
    config: OrchestratorConfig,
    store: SharedStore,
    bus: SharedEventBus,
    sessions: Arc<SessionManager>,
    merge: Arc<MergeEngine>,
    batches: Arc<BatchScheduler>,
    adapter: AmpAdapter,
    handles: Mutex<HashMap<String, (String, Arc<InteractiveHandle>)>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Construct the whole orchestrator from configuration.
    ///
    /// There is no module-level mutable state: everything hangs off this
    /// value, built once at startup.
    pub fn bootstrap(config: OrchestratorConfig) -> Result<Self> {
        let store = Store::open_with(
            &config.db_path,
            StoreOptions {
                retention_days: config.retention_days,
            },
        )
        .with_context(|| format!("opening store at {}", config.db_path.display()))?
        .shared();

        let bus = EventBus::spawn(vec![Box::new(StoreSink::new(store.clone()))]).shared();
        let git = GitOps::new(config.git.clone());
        let adapter = AmpAdapter::new(config.amp.clone());
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            bus.clone(),
            git.clone(),
            adapter.clone(),
        ));
        let merge = Arc::new(MergeEngine::new(git, store.clone()));
        let batches = Arc::new(BatchScheduler::new(
            store.clone(),
            bus.clone(),
            sessions.clone(),
            merge.clone(),
            config.clone(),
        ));

        info!(db = %config.db_path.display(), "controller ready");
        Ok(Self {
            config,
            store,
            bus,
            sessions,
            merge,
            batches,
            adapter,
            handles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Token cancelled when the process is shutting down; threaded into
    /// every long operation started here.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to all metric events (UI streaming).
    pub fn subscribe_events(&self) -> broadcast::Receiver<MetricEvent> {
        self.bus.subscribe()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.bus.shutdown().await;
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    pub fn list_sessions(&self) -> SessionResult<Vec<Session>> {
        Ok(self.store.list_sessions()?)
    }

    pub fn sessions_by_repo(&self, repo: &str) -> SessionResult<Vec<Session>> {
        Ok(self.store.sessions_by_repo(repo)?)
    }

    pub fn get_session(&self, session_id: &str) -> SessionResult<Option<Session>> {
        Ok(self.store.get_session(session_id)?)
    }

    pub async fn create_session(&self, options: CreateSessionOptions) -> SessionResult<Session> {
        self.sessions
            .create_session(options, &self.shutdown.child_token())
            .await
    }

    pub async fn iterate(
        &self,
        session_id: &str,
        options: IterateOptions,
    ) -> SessionResult<Iteration> {
        self.sessions
            .iterate(session_id, options, &self.shutdown.child_token())
            .await
    }

    pub async fn cleanup(
        &self,
        session_id: &str,
        force: bool,
        delete_record: bool,
    ) -> SessionResult<()> {
        self.sessions.cleanup(session_id, force, delete_record).await
    }

    pub async fn diff(&self, session_id: &str) -> SessionResult<String> {
        self.sessions.diff(session_id).await
    }

    pub fn iterations(&self, session_id: &str) -> SessionResult<Vec<Iteration>> {
        Ok(self.store.iterations_for_session(session_id)?)
    }

    pub fn threads(&self, session_id: &str) -> SessionResult<Vec<ThreadRecord>> {
        Ok(self.store.threads_for_session(session_id)?)
    }

    pub fn stream_events(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> SessionResult<Vec<StreamEventRecord>> {
        Ok(self.store.stream_events_for_session(session_id, after_seq)?)
    }

    pub fn tool_calls(&self, session_id: &str) -> SessionResult<Vec<ToolCallRecord>> {
        Ok(self.store.tool_calls_for_session(session_id)?)
    }

    pub fn session_summary(&self, session_id: &str) -> SessionResult<SessionSummary> {
        Ok(self.store.session_summary(session_id)?)
    }

    pub fn token_usage(&self, session_id: &str) -> SessionResult<TokenUsage> {
        Ok(self.store.token_usage_for_session(session_id)?)
    }

    // =========================================================================
    // Merge operations
    // =========================================================================

    pub async fn preflight(&self, session_id: &str) -> MergeStepResult<PreflightReport> {
        self.merge.preflight(session_id).await
    }

    pub async fn squash(
        &self,
        session_id: &str,
        message: &str,
        mode: SquashMode,
    ) -> MergeStepResult<SquashOutcome> {
        self.merge.squash(session_id, message, mode).await
    }

    pub async fn rebase(&self, session_id: &str) -> MergeStepResult<RebaseOutcome> {
        self.merge.rebase(session_id).await
    }

    pub async fn continue_merge(&self, session_id: &str) -> MergeStepResult<RebaseOutcome> {
        self.merge.continue_merge(session_id).await
    }

    pub async fn abort_merge(&self, session_id: &str) -> MergeStepResult<()> {
        self.merge.abort_merge(session_id).await
    }

    pub async fn fast_forward(&self, session_id: &str, no_ff: bool) -> MergeStepResult<()> {
        self.merge.fast_forward(session_id, no_ff).await
    }

    // =========================================================================
    // Batch operations
    // =========================================================================

    pub fn start_batch(self: &Arc<Self>, plan: BatchPlan) -> BatchResult<String> {
        self.batches.start(plan)
    }

    pub fn abort_batch(&self, run_id: &str) -> bool {
        self.batches.abort(run_id)
    }

    pub async fn wait_batch(&self, run_id: &str) {
        self.batches.wait(run_id).await;
    }

    pub fn list_runs(&self) -> BatchResult<Vec<BatchRun>> {
        Ok(self.store.list_batch_runs()?)
    }

    pub fn get_run(&self, run_id: &str) -> BatchResult<Option<BatchRun>> {
        Ok(self.store.get_batch_run(run_id)?)
    }

    pub fn list_items(&self, run_id: &str) -> BatchResult<Vec<BatchItem>> {
        Ok(self.store.items_for_run(run_id)?)
    }

    /// Export a run's items as NDJSON, one item per line.
    pub fn export_run(&self, run_id: &str) -> BatchResult<String> {
        let items = self.store.items_for_run(run_id)?;
        let mut out = String::new();
        for item in items {
            if let Ok(line) = serde_json::to_string(&item) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Interactive operations
    // =========================================================================

    /// Start an interactive handle against a session's worktree.
    pub async fn start_interactive(&self, session_id: &str) -> SessionResult<String> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| crate::session::SessionError::NotFound(session_id.to_string()))?;
        // The agent's last-thread file is a resumption hint only; a stale id
        // surfaces as an agent error, never as fabricated store state.
        let thread_id = session
            .thread_id
            .clone()
            .or_else(crate::config::AmpConfig::read_last_thread_hint);
        let handle = InteractiveHandle::start(
            &self.adapter,
            PathBuf::from(&session.worktree_path),
            thread_id,
        )
        .await?;
        let handle_id = handle.handle_id().to_string();
        self.handles
            .lock()
            .expect("controller mutex poisoned")
            .insert(handle_id.clone(), (session_id.to_string(), Arc::new(handle)));
        self.store
            .update_session_status(session_id, SessionStatus::AwaitingInput, None)?;
        Ok(handle_id)
    }

    pub async fn send_interactive(&self, handle_id: &str, text: &str) -> SessionResult<()> {
        let (session_id, handle) = self.interactive_handle(handle_id)?;
        // Persist the agent-issued thread id as soon as it is known.
        if let Some(thread_id) = handle.thread_id() {
            self.store.attach_thread(&session_id, &thread_id)?;
            self.store.touch_thread(&thread_id)?;
        }
        Ok(handle.send(text).await?)
    }

    pub async fn stop_interactive(&self, handle_id: &str) -> SessionResult<Option<i32>> {
        let entry = {
            self.handles
                .lock()
                .expect("controller mutex poisoned")
                .remove(handle_id)
        };
        match entry {
            Some((session_id, handle)) => {
                let exit_code = handle.stop().await?;
                self.store
                    .update_session_status(&session_id, SessionStatus::Idle, None)?;
                Ok(exit_code)
            }
            None => Ok(None),
        }
    }

    pub fn subscribe_interactive(
        &self,
        handle_id: &str,
    ) -> SessionResult<broadcast::Receiver<InteractiveEvent>> {
        Ok(self.interactive_handle(handle_id)?.1.subscribe())
    }

    fn interactive_handle(
        &self,
        handle_id: &str,
    ) -> SessionResult<(String, Arc<InteractiveHandle>)> {
        self.handles
            .lock()
            .expect("controller mutex poisoned")
            .get(handle_id)
            .cloned()
            .ok_or(crate::session::SessionError::Adapter(
                crate::adapter::AdapterError::HandleNotReady,
            ))
    }
}
