//! Merge pipeline: preflight → squash → rebase → fast-forward
//!
//! A per-session state machine over the session branch. Conflicts are states,
//! not errors; every step writes a MergeHistory audit row. Base-branch
//! mutation is serialized per repository, and transient index-lock contention
//! is retried with bounded exponential backoff, only here and never in plain
//! git calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::git::{
    is_retryable_stderr, GitError, GitOps, RebaseOutcome, SquashMode, SquashOutcome,
};
use crate::store::{
    MergeHistoryRecord, MergeResult, Session, SessionStatus, SharedStore, StoreError,
};

/// Retry budget for index-lock contention.
const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Result type alias for merge operations.
pub type MergeStepResult<T> = Result<T, MergeError>;

/// Errors from the merge engine.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("a merge step is already running for session {0}")]
    StepInProgress(String),

    #[error("session {session} is {status}; merge steps require an idle session")]
    SessionBusy { session: String, status: String },

    #[error("invalid merge step from phase {phase:?}")]
    InvalidStep { phase: MergePhase },
}

/// Phase of a session's merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Clean,
    Preflighted,
    Squashed,
    Rebased,
    Merged,
    Conflict,
    Aborted,
}

/// Advisory mergeability report. Never mutates the repository.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub repo_clean: bool,
    pub base_up_to_date: bool,
    pub ahead_by: u32,
    pub behind_by: u32,
    pub branchpoint_sha: String,
    pub agent_commits_count: usize,
    pub tests_pass: Option<bool>,
    pub typecheck_passes: Option<bool>,
    pub issues: Vec<String>,
}

/// State machine driving a session branch back into its base branch.
pub struct MergeEngine {
    git: GitOps,
    store: SharedStore,
    phases: Mutex<HashMap<String, MergePhase>>,
    active: Mutex<std::collections::HashSet<String>>,
    repo_locks: Mutex<HashMap<PathBuf, std::sync::Arc<AsyncMutex<()>>>>,
}

impl MergeEngine {
    pub fn new(git: GitOps, store: SharedStore) -> Self {
        Self {
            git,
            store,
            phases: Mutex::new(HashMap::new()),
            active: Mutex::new(std::collections::HashSet::new()),
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, session_id: &str) -> MergePhase {
        self.phases
            .lock()
            .expect("merge mutex poisoned")
            .get(session_id)
            .copied()
            .unwrap_or(MergePhase::Clean)
    }

    fn set_phase(&self, session_id: &str, phase: MergePhase) {
        self.phases
            .lock()
            .expect("merge mutex poisoned")
            .insert(session_id.to_string(), phase);
    }

    fn session(&self, session_id: &str) -> MergeStepResult<Session> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| MergeError::SessionNotFound(session_id.to_string()))
    }

    fn repo_lock(&self, repo: &Path) -> std::sync::Arc<AsyncMutex<()>> {
        self.repo_locks
            .lock()
            .expect("merge mutex poisoned")
            .entry(repo.to_path_buf())
            .or_default()
            .clone()
    }

    /// Mark a mutating step as active for the session, refusing concurrency.
    fn begin_step(&self, session: &Session) -> MergeStepResult<StepGuard<'_>> {
        if session.status == SessionStatus::Running {
            return Err(MergeError::SessionBusy {
                session: session.id.clone(),
                status: session.status.as_str().to_string(),
            });
        }
        let mut active = self.active.lock().expect("merge mutex poisoned");
        if !active.insert(session.id.clone()) {
            return Err(MergeError::StepInProgress(session.id.clone()));
        }
        Ok(StepGuard {
            engine: self,
            session_id: session.id.clone(),
        })
    }

    /// Retry a git closure on index-lock contention with exponential backoff.
    async fn with_lock_retry<T, F, Fut>(&self, mut op: F) -> MergeStepResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GitError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(GitError::CommandFailed { command, stderr })
                    if is_retryable_stderr(&stderr) && attempt < LOCK_RETRIES =>
                {
                    let delay = LOCK_RETRY_BASE_DELAY * (1 << attempt);
                    warn!(%command, attempt, "index lock contention; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn record_step(
        &self,
        session: &Session,
        mode: &str,
        squash_message: Option<&str>,
    ) -> MergeStepResult<MergeHistoryRecord> {
        let mut record = MergeHistoryRecord::begin(&session.id, &session.base_branch, mode);
        record.squash_message = squash_message.map(str::to_string);
        self.store.insert_merge_history(&record)?;
        Ok(record)
    }

    fn finish_step(
        &self,
        record: &MergeHistoryRecord,
        result: MergeResult,
        conflict_files: &[String],
    ) -> MergeStepResult<()> {
        self.store
            .finish_merge_history(&record.id, result, conflict_files)?;
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Read-only mergeability report. Idempotent: identical on an unchanged
    /// branch.
    pub async fn preflight(&self, session_id: &str) -> MergeStepResult<PreflightReport> {
        let session = self.session(session_id)?;
        let worktree = Path::new(&session.worktree_path);
        let repo = Path::new(&session.repo_root);

        let repo_clean = !self.git.is_dirty(repo).await?;
        let info = self.git.branch_info(worktree, &session.base_branch).await?;
        let commits = self
            .git
            .commits_since_base(worktree, &session.base_branch)
            .await?;
        let agent_commits_count = commits.iter().filter(|c| c.is_agent_commit()).count();

        let mut issues = Vec::new();
        if !repo_clean {
            issues.push("base repository has uncommitted changes".to_string());
        }
        if info.behind > 0 {
            issues.push(format!(
                "session branch is {} commit(s) behind {}; rebase required",
                info.behind, session.base_branch
            ));
        }
        if info.ahead == 0 {
            issues.push("session branch has no commits to merge".to_string());
        }
        if self.git.is_dirty(worktree).await? {
            issues.push("session worktree has uncommitted changes".to_string());
        }

        if self.phase(session_id) == MergePhase::Clean {
            self.set_phase(session_id, MergePhase::Preflighted);
        }

        Ok(PreflightReport {
            repo_clean,
            base_up_to_date: info.behind == 0,
            ahead_by: info.ahead,
            behind_by: info.behind,
            branchpoint_sha: info.branchpoint,
            agent_commits_count,
            tests_pass: None,
            typecheck_passes: None,
            issues,
        })
    }

    /// Collapse the session branch into a single commit.
    pub async fn squash(
        &self,
        session_id: &str,
        message: &str,
        mode: SquashMode,
    ) -> MergeStepResult<SquashOutcome> {
        let session = self.session(session_id)?;
        let _guard = self.begin_step(&session)?;
        let worktree = PathBuf::from(&session.worktree_path);
        let mode_str = match mode {
            SquashMode::IncludeManual => "squash:include",
            SquashMode::ExcludeManual => "squash:exclude",
        };
        let record = self.record_step(&session, mode_str, Some(message))?;

        let base = session.base_branch.clone();
        let outcome = self
            .with_lock_retry(|| {
                let git = self.git.clone();
                let worktree = worktree.clone();
                let base = base.clone();
                let message = message.to_string();
                async move { git.squash_commits(&worktree, &base, &message, mode).await }
            })
            .await;

        match outcome {
            Ok(SquashOutcome::Done(sha)) => {
                self.finish_step(&record, MergeResult::Success, &[])?;
                self.set_phase(session_id, MergePhase::Squashed);
                info!(session_id, sha = sha.as_deref().unwrap_or("-"), "squash complete");
                Ok(SquashOutcome::Done(sha))
            }
            Ok(SquashOutcome::Conflict { files }) => {
                self.finish_step(&record, MergeResult::Conflict, &files)?;
                self.set_phase(session_id, MergePhase::Conflict);
                Ok(SquashOutcome::Conflict { files })
            }
            Err(e) => {
                self.finish_step(&record, MergeResult::Error, &[])?;
                Err(e)
            }
        }
    }

    /// Rebase the squashed branch onto base.
    pub async fn rebase(&self, session_id: &str) -> MergeStepResult<RebaseOutcome> {
        let session = self.session(session_id)?;
        let _guard = self.begin_step(&session)?;
        let worktree = PathBuf::from(&session.worktree_path);
        let record = self.record_step(&session, "rebase", None)?;

        let base = session.base_branch.clone();
        let outcome = self
            .with_lock_retry(|| {
                let git = self.git.clone();
                let worktree = worktree.clone();
                let base = base.clone();
                async move { git.rebase_onto_base(&worktree, &base).await }
            })
            .await;

        self.apply_rebase_outcome(session_id, &record, outcome, MergePhase::Rebased)
    }

    /// Resume a conflicted rebase after manual resolution.
    pub async fn continue_merge(&self, session_id: &str) -> MergeStepResult<RebaseOutcome> {
        let session = self.session(session_id)?;
        let _guard = self.begin_step(&session)?;
        if self.phase(session_id) != MergePhase::Conflict {
            return Err(MergeError::InvalidStep {
                phase: self.phase(session_id),
            });
        }
        let worktree = PathBuf::from(&session.worktree_path);
        let record = self.record_step(&session, "continue", None)?;

        let outcome = self
            .with_lock_retry(|| {
                let git = self.git.clone();
                let worktree = worktree.clone();
                async move { git.continue_rebase(&worktree).await }
            })
            .await;

        self.apply_rebase_outcome(session_id, &record, outcome, MergePhase::Rebased)
    }

    fn apply_rebase_outcome(
        &self,
        session_id: &str,
        record: &MergeHistoryRecord,
        outcome: MergeStepResult<RebaseOutcome>,
        on_clean: MergePhase,
    ) -> MergeStepResult<RebaseOutcome> {
        match outcome {
            Ok(RebaseOutcome::Clean) => {
                self.finish_step(record, MergeResult::Success, &[])?;
                self.set_phase(session_id, on_clean);
                Ok(RebaseOutcome::Clean)
            }
            Ok(RebaseOutcome::Conflict { files }) => {
                self.finish_step(record, MergeResult::Conflict, &files)?;
                self.set_phase(session_id, MergePhase::Conflict);
                Ok(RebaseOutcome::Conflict { files })
            }
            Err(e) => {
                self.finish_step(record, MergeResult::Error, &[])?;
                Err(e)
            }
        }
    }

    /// Abort a conflicted rebase and return to the clean phase.
    pub async fn abort_merge(&self, session_id: &str) -> MergeStepResult<()> {
        let session = self.session(session_id)?;
        let _guard = self.begin_step(&session)?;
        let worktree = PathBuf::from(&session.worktree_path);
        let record = self.record_step(&session, "abort", None)?;

        match self.git.abort_rebase(&worktree).await {
            Ok(()) => {
                self.finish_step(&record, MergeResult::Aborted, &[])?;
                self.set_phase(session_id, MergePhase::Clean);
                Ok(())
            }
            Err(e) => {
                self.finish_step(&record, MergeResult::Error, &[])?;
                Err(e.into())
            }
        }
    }

    /// Fast-forward (or `--no-ff`) the base branch to the session branch.
    ///
    /// Requires a completed rebase. Base mutation is serialized per repo.
    pub async fn fast_forward(&self, session_id: &str, no_ff: bool) -> MergeStepResult<()> {
        let session = self.session(session_id)?;
        let _guard = self.begin_step(&session)?;
        if self.phase(session_id) != MergePhase::Rebased {
            return Err(MergeError::InvalidStep {
                phase: self.phase(session_id),
            });
        }
        let repo = PathBuf::from(&session.repo_root);
        let mode = if no_ff { "merge:no-ff" } else { "merge:ff" };
        let record = self.record_step(&session, mode, None)?;

        let repo_lock = self.repo_lock(&repo);
        let _repo_guard = repo_lock.lock().await;

        let branch = session.branch_name.clone();
        let base = session.base_branch.clone();
        let outcome = self
            .with_lock_retry(|| {
                let git = self.git.clone();
                let repo = repo.clone();
                let branch = branch.clone();
                let base = base.clone();
                async move { git.fast_forward_merge(&repo, &branch, &base, no_ff).await }
            })
            .await;

        match outcome {
            Ok(()) => {
                self.finish_step(&record, MergeResult::Success, &[])?;
                self.set_phase(session_id, MergePhase::Merged);
                info!(session_id, base = %session.base_branch, "merge complete");
                Ok(())
            }
            Err(e) => {
                self.finish_step(&record, MergeResult::Error, &[])?;
                Err(e)
            }
        }
    }
}

/// Clears the per-session active flag when a step ends.
struct StepGuard<'a> {
    engine: &'a MergeEngine,
    session_id: String,
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.engine
            .active
            .lock()
            .expect("merge mutex poisoned")
            .remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::process::Command;
    use tempfile::tempdir;

    fn run(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    async fn setup() -> (tempfile::TempDir, MergeEngine, Session) {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        run(&repo, &["init", "-b", "main"]);
        run(&repo, &["config", "user.email", "test@test.com"]);
        run(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# repo\n").unwrap();
        run(&repo, &["add", "."]);
        run(&repo, &["commit", "-m", "Initial commit"]);

        let git = GitOps::default();
        let branch = "agent/t1/20250101-000000";
        let worktree = repo.join(".worktrees").join("t1");
        git.create_worktree(&repo, branch, &worktree, "main")
            .await
            .unwrap();

        let store = Store::open(dir.path().join("state.db")).unwrap().shared();
        let session = Session::new(
            "t1",
            "do it",
            repo.display().to_string(),
            "main",
            branch,
            worktree.display().to_string(),
        );
        store.insert_session(&session).unwrap();

        let engine = MergeEngine::new(git, store);
        (dir, engine, session)
    }

    #[tokio::test]
    async fn preflight_is_idempotent() {
        let (_dir, engine, session) = setup().await;
        let wt = Path::new(&session.worktree_path);
        std::fs::write(wt.join("a.txt"), "a\n").unwrap();
        engine
            .git
            .commit_changes(wt, "agent: add a")
            .await
            .unwrap();

        let first = engine.preflight(&session.id).await.unwrap();
        let second = engine.preflight(&session.id).await.unwrap();
        assert_eq!(first.ahead_by, second.ahead_by);
        assert_eq!(first.branchpoint_sha, second.branchpoint_sha);
        assert_eq!(first.agent_commits_count, 1);
        assert!(first.base_up_to_date);
        assert_eq!(first.issues, second.issues);
    }

    #[tokio::test]
    async fn full_pipeline_merges_into_base() {
        let (_dir, engine, session) = setup().await;
        let wt = Path::new(&session.worktree_path);
        std::fs::write(wt.join("X"), "hi\n").unwrap();
        engine.git.commit_changes(wt, "agent: add X").await.unwrap();

        engine.preflight(&session.id).await.unwrap();
        let squashed = engine
            .squash(&session.id, "feat: X", SquashMode::IncludeManual)
            .await
            .unwrap();
        assert!(matches!(squashed, SquashOutcome::Done(Some(_))));

        let rebased = engine.rebase(&session.id).await.unwrap();
        assert_eq!(rebased, RebaseOutcome::Clean);

        engine.fast_forward(&session.id, false).await.unwrap();
        assert_eq!(engine.phase(&session.id), MergePhase::Merged);

        let repo = Path::new(&session.repo_root);
        assert!(repo.join("X").exists());
        assert_eq!(std::fs::read_to_string(repo.join("X")).unwrap(), "hi\n");

        let history = engine.store.merge_history_for_session(&session.id).unwrap();
        assert!(history
            .iter()
            .all(|h| h.result != MergeResult::InProgress));
        assert_eq!(
            history.last().unwrap().result,
            MergeResult::Success
        );
    }

    #[tokio::test]
    async fn fast_forward_requires_rebased_phase() {
        let (_dir, engine, session) = setup().await;
        let err = engine.fast_forward(&session.id, false).await.unwrap_err();
        assert!(matches!(err, MergeError::InvalidStep { .. }));
    }

    #[tokio::test]
    async fn conflict_recovery_via_continue() {
        let (_dir, engine, session) = setup().await;
        let wt = Path::new(&session.worktree_path);
        let repo = Path::new(&session.repo_root);

        // Both sides edit the same line of Y.
        std::fs::write(repo.join("Y"), "base line\n").unwrap();
        run(repo, &["add", "."]);
        run(repo, &["commit", "-m", "base adds Y"]);
        std::fs::write(wt.join("Y"), "session line\n").unwrap();
        engine
            .git
            .commit_changes(wt, "agent: session edits Y")
            .await
            .unwrap();

        let outcome = engine.rebase(&session.id).await.unwrap();
        let RebaseOutcome::Conflict { files } = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(files, vec!["Y".to_string()]);
        assert_eq!(engine.phase(&session.id), MergePhase::Conflict);

        // Resolve and continue.
        std::fs::write(wt.join("Y"), "merged line\n").unwrap();
        engine.git.runner().run_ok(wt, &["add", "Y"]).await.unwrap();
        let cont = engine.continue_merge(&session.id).await.unwrap();
        assert_eq!(cont, RebaseOutcome::Clean);

        engine.fast_forward(&session.id, false).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.join("Y")).unwrap(),
            "merged line\n"
        );
    }

    #[tokio::test]
    async fn abort_restores_clean_phase() {
        let (_dir, engine, session) = setup().await;
        let wt = Path::new(&session.worktree_path);
        let repo = Path::new(&session.repo_root);

        std::fs::write(repo.join("Z"), "base\n").unwrap();
        run(repo, &["add", "."]);
        run(repo, &["commit", "-m", "base adds Z"]);
        std::fs::write(wt.join("Z"), "session\n").unwrap();
        engine
            .git
            .commit_changes(wt, "agent: session edits Z")
            .await
            .unwrap();
        let pre_head = engine.git.current_head(wt).await.unwrap();

        let outcome = engine.rebase(&session.id).await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Conflict { .. }));

        engine.abort_merge(&session.id).await.unwrap();
        assert_eq!(engine.phase(&session.id), MergePhase::Clean);
        assert_eq!(engine.git.current_head(wt).await.unwrap(), pre_head);
    }
}
