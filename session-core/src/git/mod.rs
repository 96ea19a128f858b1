//! Typed wrappers over the system `git` binary
//!
//! Every invocation is scoped to an explicit working directory, enforces a
//! wall-clock timeout, and returns a typed [`GitOutput`] instead of raising
//! on non-zero exit. Callers decide what a failure means.

pub mod ops;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

pub use ops::{
    BranchInfo, CommitEntry, DiffStats, GitOps, RebaseOutcome, SquashMode, SquashOutcome,
};

/// Default wall-clock timeout for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between polite and forced termination on timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Result type alias for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Errors from git subprocess execution.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The git executable could not be found.
    #[error("git executable not found: {path}")]
    NotFound { path: PathBuf },

    /// The requested working directory does not exist.
    #[error("working directory missing: {cwd}")]
    CwdMissing { cwd: PathBuf },

    /// The command exceeded its wall-clock timeout.
    #[error("git {command} timed out after {timeout_secs}s in {cwd}")]
    Timeout {
        command: String,
        cwd: PathBuf,
        timeout_secs: u64,
    },

    /// A command that must succeed exited non-zero.
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Refusal to delete a branch whose work is not merged into base.
    #[error("refusing to delete {branch}: HEAD is not an ancestor of {base}")]
    UnmergedDeletion { branch: String, base: String },

    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub(crate) fn failed(args: &[&str], stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: args.join(" "),
            stderr: stderr.into(),
        }
    }
}

/// Configuration for the git runner.
#[derive(Debug, Clone)]
pub struct GitConfig {
    /// Path to the git binary. Populated from `GIT_PATH` env var when set.
    pub git_path: PathBuf,
    /// Wall-clock timeout per invocation.
    pub timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            git_path: std::env::var("GIT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("git")),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

/// Captured output of a completed git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Contextual hint for well-known stderr patterns. Informational only;
    /// never changes exit codes.
    pub fn hint(&self) -> Option<&'static str> {
        stderr_hint(&self.stderr)
    }

    /// Stderr with the hint appended when one matches.
    pub fn stderr_with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{} (hint: {})", self.stderr.trim(), hint),
            None => self.stderr.trim().to_string(),
        }
    }
}

fn stderr_hint(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();
    if lower.contains("not a git repository") {
        Some("the directory is not inside a git working tree")
    } else if lower.contains("permission denied") {
        Some("check filesystem permissions on the repository")
    } else if lower.contains("did not match any file") || lower.contains("no such file") {
        Some("a referenced path does not exist in this worktree")
    } else if lower.contains("index.lock") || lower.contains("another git process") {
        Some("another git process holds the index lock; retry shortly")
    } else {
        None
    }
}

/// Whether a failed command looks like transient index-lock contention.
///
/// Only the merge engine retries on this; plain git calls are single-attempt.
pub fn is_retryable_stderr(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("index.lock")
        || lower.contains("could not lock")
        || lower.contains("another git process")
}

/// Executes git commands with timeout and termination escalation.
#[derive(Debug, Clone, Default)]
pub struct GitRunner {
    config: GitConfig,
}

impl GitRunner {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    /// Run a git command in `cwd` and capture its output.
    ///
    /// Non-zero exit is not an error; inspect [`GitOutput::exit_code`].
    pub async fn run(&self, cwd: &Path, args: &[&str]) -> GitResult<GitOutput> {
        if !cwd.is_dir() {
            return Err(GitError::CwdMissing {
                cwd: cwd.to_path_buf(),
            });
        }

        let mut child = Command::new(&self.config.git_path)
            .args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GitError::NotFound {
                        path: self.config.git_path.clone(),
                    }
                } else {
                    GitError::Io(e)
                }
            })?;

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let waited = tokio::time::timeout(self.config.timeout, async {
            let _ = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
            );
            child.wait().await
        })
        .await;

        match waited {
            Ok(status) => {
                let status = status?;
                Ok(GitOutput {
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Err(_) => {
                terminate_child(&mut child).await;
                Err(GitError::Timeout {
                    command: args.join(" "),
                    cwd: cwd.to_path_buf(),
                    timeout_secs: self.config.timeout.as_secs(),
                })
            }
        }
    }

    /// Run a command that must succeed; returns trimmed stdout.
    pub async fn run_ok(&self, cwd: &Path, args: &[&str]) -> GitResult<String> {
        let out = self.run(cwd, args).await?;
        if !out.success() {
            return Err(GitError::failed(args, out.stderr_with_hint()));
        }
        Ok(out.stdout.trim().to_string())
    }
}

/// Polite SIGTERM, bounded grace period, then forced kill.
///
/// Shared by every subprocess the orchestrator owns, not just git.
pub async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill timed-out child");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn run_reports_exit_code_without_error() {
        let dir = tempdir().unwrap();
        let runner = GitRunner::default();
        // `git status` outside a repository exits non-zero but must not Err.
        let out = runner.run(dir.path(), &["status"]).await.unwrap();
        assert_ne!(out.exit_code, 0);
        assert!(out.stderr.to_lowercase().contains("not a git repository"));
        assert_eq!(
            out.hint(),
            Some("the directory is not inside a git working tree")
        );
    }

    #[tokio::test]
    async fn missing_cwd_is_typed() {
        let runner = GitRunner::default();
        let err = runner
            .run(Path::new("/nonexistent/cwd/for/test"), &["status"])
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::CwdMissing { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_typed() {
        let dir = tempdir().unwrap();
        let runner = GitRunner::new(GitConfig {
            git_path: PathBuf::from("/nonexistent/git-binary"),
            timeout: DEFAULT_GIT_TIMEOUT,
        });
        let err = runner.run(dir.path(), &["status"]).await.unwrap_err();
        assert!(matches!(err, GitError::NotFound { .. }));
    }

    #[test]
    fn retryable_stderr_classification() {
        assert!(is_retryable_stderr(
            "fatal: Unable to create '.git/index.lock': File exists"
        ));
        assert!(is_retryable_stderr("another git process seems to be running"));
        assert!(!is_retryable_stderr("fatal: not a git repository"));
    }
}
