//! Bounded-concurrency batch execution over a plan matrix
//!
//! Each item runs createSession (which performs the single iteration),
//! the optional script, and an optional merge-on-pass. Workers share a FIFO
//! queue; a per-run cancellation token aborts queued and in-flight items.
//! Retries apply only to process/OS errors, never to script failures or
//! timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::AdapterError;
use crate::config::OrchestratorConfig;
use crate::session::{CreateSessionOptions, SessionError, SessionManager};
use session_core::{
    BatchItem, BatchItemStatus, BatchPlan, BatchRun, BatchStatus, EventSink, MergeEngine,
    MetricEvent, NdjsonSink, PlanError, ResolvedItem, SessionMode, SharedEventBus, SharedStore,
    SquashMode, StoreError, TestResult,
};

/// Result type alias for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors from batch scheduling.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("batch run not found: {0}")]
    RunNotFound(String),
}

struct QueuedItem {
    item: BatchItem,
    resolved: ResolvedItem,
    retries_left: u32,
}

/// Executes batch plans with a bounded worker pool.
pub struct BatchScheduler {
    store: SharedStore,
    bus: SharedEventBus,
    sessions: Arc<SessionManager>,
    merge: Arc<MergeEngine>,
    config: OrchestratorConfig,
    aborts: Mutex<HashMap<String, CancellationToken>>,
    runs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(
        store: SharedStore,
        bus: SharedEventBus,
        sessions: Arc<SessionManager>,
        merge: Arc<MergeEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            sessions,
            merge,
            config,
            aborts: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Persist the run and start executing it in the background.
    ///
    /// Returns the run id immediately; progress flows over the event bus.
    pub fn start(self: &Arc<Self>, plan: BatchPlan) -> BatchResult<String> {
        plan.validate()?;
        let run_id = plan
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let run = BatchRun {
            run_id: run_id.clone(),
            created_at: Utc::now(),
            defaults_json: serde_json::to_string(&plan.defaults).unwrap_or_else(|_| "{}".into()),
            concurrency: plan.concurrency,
            status: BatchStatus::Running,
        };
        let resolved = plan.resolved_items();
        let items: Vec<BatchItem> = resolved
            .iter()
            .map(|r| BatchItem {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                repo: r.repo.clone(),
                prompt: r.prompt.clone(),
                model: r.model.clone(),
                script_command: r.script_command.clone(),
                timeout_sec: r.timeout_sec,
                status: BatchItemStatus::Queued,
                started_at: None,
                finished_at: None,
                session_id: None,
                tokens_total: 0,
                attempt: 0,
                error: None,
            })
            .collect();
        self.store.insert_batch_run(&run, &items)?;

        let cancel = CancellationToken::new();
        self.aborts
            .lock()
            .expect("batch mutex poisoned")
            .insert(run_id.clone(), cancel.clone());

        let queue: VecDeque<QueuedItem> = items
            .into_iter()
            .zip(resolved)
            .map(|(item, resolved)| QueuedItem {
                item,
                resolved,
                retries_left: plan.defaults.retries,
            })
            .collect();

        let scheduler = Arc::clone(self);
        let run_id_for_task = run_id.clone();
        let concurrency = plan.concurrency as usize;
        let task = tokio::spawn(async move {
            scheduler
                .execute_run(run_id_for_task, queue, concurrency, cancel)
                .await;
        });
        self.runs
            .lock()
            .expect("batch mutex poisoned")
            .insert(run_id.clone(), task);

        info!(run_id, concurrency = plan.concurrency, "batch run started");
        Ok(run_id)
    }

    /// Flip the per-run cancellation flag. Workers abort queued items and
    /// cancel in-flight agent processes.
    pub fn abort(&self, run_id: &str) -> bool {
        let aborts = self.aborts.lock().expect("batch mutex poisoned");
        match aborts.get(run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id, "batch run abort requested");
                true
            }
            None => false,
        }
    }

    /// Wait for a running batch to finish. No-op for unknown runs.
    pub async fn wait(&self, run_id: &str) {
        let task = self
            .runs
            .lock()
            .expect("batch mutex poisoned")
            .remove(run_id);
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn execute_run(
        self: Arc<Self>,
        run_id: String,
        queue: VecDeque<QueuedItem>,
        concurrency: usize,
        cancel: CancellationToken,
    ) {
        // Per-run append-only NDJSON log, fed from the broadcast tap.
        let log_task = spawn_run_log(
            self.bus.clone(),
            NdjsonSink::new(self.config.run_log_path(&run_id)),
            run_id.clone(),
        );

        let queue = Arc::new(Mutex::new(queue));
        let mut workers = Vec::new();
        for worker_index in 0..concurrency {
            let scheduler = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let run_id = run_id.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().expect("batch mutex poisoned").pop_front();
                    let Some(queued) = next else { break };
                    scheduler
                        .run_item(&run_id, queued, &queue, &cancel, worker_index)
                        .await;
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        let status = if cancel.is_cancelled() {
            BatchStatus::Aborted
        } else {
            BatchStatus::Completed
        };
        if let Err(e) = self.store.update_batch_run_status(&run_id, status) {
            warn!(run_id, error = %e, "failed to persist run status");
        }
        self.aborts
            .lock()
            .expect("batch mutex poisoned")
            .remove(&run_id);
        log_task.abort();
        info!(run_id, status = status.as_str(), "batch run finished");
    }

    async fn run_item(
        &self,
        run_id: &str,
        queued: QueuedItem,
        queue: &Arc<Mutex<VecDeque<QueuedItem>>>,
        cancel: &CancellationToken,
        worker_index: usize,
    ) {
        let item_id = queued.item.id.clone();

        if cancel.is_cancelled() {
            self.transition(run_id, &item_id, BatchItemStatus::Aborted, None, None)
                .await;
            return;
        }

        self.transition(run_id, &item_id, BatchItemStatus::Running, None, None)
            .await;

        let item_cancel = cancel.child_token();
        let timeout = queued
            .resolved
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.config.amp.iteration_timeout);

        let result = {
            let work = self.execute_item(&queued.resolved, &item_cancel, timeout);
            tokio::pin!(work);
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    item_cancel.cancel();
                    // Let the item clean up (finalize iteration, kill agent).
                    let _ = work.as_mut().await;
                    ItemResult::Timeout
                }
                result = &mut work => result,
            }
        };

        match result {
            ItemResult::Success { session_id, tokens } => {
                if let Err(e) = self
                    .store
                    .set_batch_item_session(&item_id, &session_id, tokens)
                {
                    warn!(item_id, error = %e, "failed to link session to item");
                }
                self.transition(
                    run_id,
                    &item_id,
                    BatchItemStatus::Success,
                    Some(session_id),
                    None,
                )
                .await;
            }
            ItemResult::Fail { session_id, tokens } => {
                if let Err(e) = self
                    .store
                    .set_batch_item_session(&item_id, &session_id, tokens)
                {
                    warn!(item_id, error = %e, "failed to link session to item");
                }
                self.transition(
                    run_id,
                    &item_id,
                    BatchItemStatus::Fail,
                    Some(session_id),
                    Some("script command failed".into()),
                )
                .await;
            }
            ItemResult::Timeout => {
                self.transition(run_id, &item_id, BatchItemStatus::Timeout, None, None)
                    .await;
            }
            ItemResult::Aborted => {
                self.transition(run_id, &item_id, BatchItemStatus::Aborted, None, None)
                    .await;
            }
            ItemResult::Error { message, retryable } => {
                self.transition(
                    run_id,
                    &item_id,
                    BatchItemStatus::Error,
                    None,
                    Some(message.clone()),
                )
                .await;
                if retryable && queued.retries_left > 0 && !cancel.is_cancelled() {
                    match self.store.requeue_batch_item(&item_id) {
                        Ok(()) => {
                            info!(
                                item_id,
                                worker_index,
                                retries_left = queued.retries_left - 1,
                                "requeueing errored item"
                            );
                            let mut requeued = queued;
                            requeued.retries_left -= 1;
                            requeued.item.status = BatchItemStatus::Queued;
                            queue
                                .lock()
                                .expect("batch mutex poisoned")
                                .push_back(requeued);
                        }
                        Err(e) => warn!(item_id, error = %e, "requeue failed"),
                    }
                }
            }
        }
    }

    async fn execute_item(
        &self,
        resolved: &ResolvedItem,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> ItemResult {
        let name = item_session_name(&resolved.prompt);
        let options = CreateSessionOptions {
            repo_root: resolved.repo.clone().into(),
            name,
            prompt: resolved.prompt.clone(),
            base_branch: resolved.base_branch.clone(),
            script_command: resolved.script_command.clone(),
            model_override: resolved.model.clone(),
            auto_commit: true,
            mode: SessionMode::Async,
            timeout: Some(timeout),
        };

        // createSession runs the single iteration; no second iteration here.
        let session = match self.sessions.create_session(options, cancel).await {
            Ok(session) => session,
            Err(SessionError::Adapter(AdapterError::Cancelled(_))) => return ItemResult::Aborted,
            Err(SessionError::Adapter(AdapterError::Timeout(_))) => return ItemResult::Timeout,
            Err(e) => {
                return ItemResult::Error {
                    retryable: is_retryable(&e),
                    message: e.to_string(),
                }
            }
        };

        let tokens = self
            .store
            .token_usage_for_session(&session.id)
            .map(|u| u.total)
            .unwrap_or(0);

        // The iteration completed but the agent reported failure; the item
        // is a retryable process error, not a script failure.
        if session.status == session_core::SessionStatus::Error {
            return ItemResult::Error {
                retryable: true,
                message: session
                    .notes
                    .unwrap_or_else(|| "agent run failed".to_string()),
            };
        }

        let last_test = self
            .store
            .iterations_for_session(&session.id)
            .ok()
            .and_then(|iterations| iterations.last().map(|i| i.test_result))
            .unwrap_or(TestResult::None);

        if last_test == TestResult::Fail {
            return ItemResult::Fail {
                session_id: session.id,
                tokens,
            };
        }

        if resolved.merge_on_pass && last_test == TestResult::Pass {
            if let Err(e) = self.merge_session(&session.id, &resolved.prompt).await {
                warn!(session_id = %session.id, error = %e, "merge-on-pass failed; session kept for manual merge");
            }
        }

        ItemResult::Success {
            session_id: session.id,
            tokens,
        }
    }

    async fn merge_session(&self, session_id: &str, prompt: &str) -> anyhow::Result<()> {
        let message = format!("agent batch: {}", item_session_name(prompt));
        match self
            .merge
            .squash(session_id, &message, SquashMode::IncludeManual)
            .await?
        {
            session_core::SquashOutcome::Done(_) => {}
            session_core::SquashOutcome::Conflict { files } => {
                anyhow::bail!("squash conflicts in {}", files.join(", "));
            }
        }
        match self.merge.rebase(session_id).await? {
            session_core::RebaseOutcome::Clean => {}
            session_core::RebaseOutcome::Conflict { files } => {
                self.merge.abort_merge(session_id).await?;
                anyhow::bail!("rebase conflicts in {}", files.join(", "));
            }
        }
        self.merge.fast_forward(session_id, false).await?;
        Ok(())
    }

    async fn transition(
        &self,
        run_id: &str,
        item_id: &str,
        status: BatchItemStatus,
        session_id: Option<String>,
        error: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .transition_batch_item(item_id, status, error.as_deref())
        {
            warn!(item_id, status = status.as_str(), error = %e, "item transition rejected");
            return;
        }
        let event = MetricEvent::BatchItemProgress {
            run_id: run_id.to_string(),
            item_id: item_id.to_string(),
            session_id,
            timestamp: Utc::now(),
            status,
        };
        if let Err(e) = self.bus.publish(event).await {
            warn!(item_id, error = %e, "progress publish failed");
        }
    }
}

enum ItemResult {
    Success { session_id: String, tokens: u64 },
    Fail { session_id: String, tokens: u64 },
    Timeout,
    Aborted,
    Error { message: String, retryable: bool },
}

/// Transient process/OS failures are retryable; input and script problems
/// are not.
fn is_retryable(error: &SessionError) -> bool {
    match error {
        SessionError::Store(StoreError::Unavailable(_)) => true,
        SessionError::Git(session_core::GitError::Timeout { .. }) => true,
        SessionError::Git(session_core::GitError::Io(_)) => true,
        SessionError::Adapter(AdapterError::Io(_)) => true,
        SessionError::Io(_) => true,
        _ => false,
    }
}

/// Short session name derived from the prompt.
fn item_session_name(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(6).collect();
    if words.is_empty() {
        "batch-item".to_string()
    } else {
        words.join(" ")
    }
}

/// Mirror a run's bus traffic into its NDJSON log until aborted.
fn spawn_run_log(
    bus: SharedEventBus,
    sink: NdjsonSink,
    run_id: String,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(run_id, skipped, "run log fell behind the bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let matches_run = event.run_id() == Some(run_id.as_str());
            // Session-scoped events are logged too; the store links sessions
            // to items, and replay filters on ids.
            if matches_run || event.run_id().is_none() {
                if let Err(e) = sink.handle(&event).await {
                    warn!(run_id, error = %e, "run log write failed");
                    break;
                }
            }
        }
    })
}
