//! Semantic git operations for session worktrees
//!
//! Built on [`GitRunner`]; each operation maps to the small set of plumbing
//! the orchestrator needs: worktree lifecycle, commit discipline, the
//! squash/rebase/fast-forward pipeline, and numstat-based diff stats.

use std::path::Path;

use tracing::{debug, warn};

use super::{GitConfig, GitError, GitOutput, GitResult, GitRunner};

/// Ahead/behind counts of a session branch relative to its base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub ahead: u32,
    pub behind: u32,
    /// Merge base of the session branch and the base branch.
    pub branchpoint: String,
}

/// Aggregated `git diff --numstat` result.
///
/// Binary files contribute to `files_changed` but not to the line counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files_changed: u32,
    pub lines_added: u64,
    pub lines_deleted: u64,
}

/// One commit in `base..HEAD`, oldest first.
#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub sha: String,
    pub subject: String,
}

impl CommitEntry {
    /// Automated commits carry the `agent:` prefix; everything else is manual.
    pub fn is_agent_commit(&self) -> bool {
        self.subject.starts_with("agent:")
    }
}

/// Result of a rebase-family operation. Conflict is a state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    Conflict { files: Vec<String> },
}

/// How manual commits are treated when squashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashMode {
    /// Fold every commit, manual or automated, into the squash commit.
    IncludeManual,
    /// Replay manual commits first, then squash the remainder on top.
    ExcludeManual,
}

/// Result of a squash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashOutcome {
    /// New branch tip, or `None` when there was nothing to squash.
    Done(Option<String>),
    /// Replaying manual commits hit a conflict; repository state preserved.
    Conflict { files: Vec<String> },
}

/// Semantic git operations scoped to explicit repo / worktree paths.
#[derive(Debug, Clone, Default)]
pub struct GitOps {
    runner: GitRunner,
}

impl GitOps {
    pub fn new(config: GitConfig) -> Self {
        Self {
            runner: GitRunner::new(config),
        }
    }

    pub fn runner(&self) -> &GitRunner {
        &self.runner
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> GitResult<GitOutput> {
        self.runner.run(cwd, args).await
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> GitResult<String> {
        self.runner.run_ok(cwd, args).await
    }

    // =========================================================================
    // Repository inspection
    // =========================================================================

    pub async fn is_work_tree(&self, dir: &Path) -> bool {
        matches!(
            self.git(dir, &["rev-parse", "--is-inside-work-tree"]).await,
            Ok(out) if out.success() && out.stdout.trim() == "true"
        )
    }

    pub async fn has_commits(&self, dir: &Path) -> bool {
        matches!(
            self.git(dir, &["rev-parse", "--verify", "HEAD"]).await,
            Ok(out) if out.success()
        )
    }

    pub async fn has_remote(&self, dir: &Path) -> GitResult<bool> {
        let out = self.git_ok(dir, &["remote"]).await?;
        Ok(!out.is_empty())
    }

    pub async fn current_head(&self, dir: &Path) -> GitResult<String> {
        self.git_ok(dir, &["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self, dir: &Path) -> GitResult<String> {
        self.git_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn status_porcelain(&self, dir: &Path) -> GitResult<String> {
        self.git_ok(dir, &["status", "--porcelain"]).await
    }

    pub async fn is_dirty(&self, dir: &Path) -> GitResult<bool> {
        Ok(!self.status_porcelain(dir).await?.is_empty())
    }

    pub async fn is_ancestor(&self, dir: &Path, ancestor: &str, descendant: &str) -> GitResult<bool> {
        let out = self
            .git(dir, &["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(out.success())
    }

    /// Zero-context unified diff of the working tree against HEAD.
    pub async fn diff_unified0(&self, dir: &Path) -> GitResult<String> {
        self.git_ok(dir, &["diff", "--unified=0", "HEAD"]).await
    }

    // =========================================================================
    // Worktree lifecycle
    // =========================================================================

    /// Bring the base branch up to date. Network operations only run when the
    /// repository has at least one remote; local-only repos skip them.
    pub async fn refresh_base(&self, repo: &Path, base: &str) -> GitResult<()> {
        if self.has_remote(repo).await? {
            let fetch = self.git(repo, &["fetch", "--prune", "origin", base]).await?;
            if !fetch.success() {
                warn!(base, stderr = %fetch.stderr.trim(), "fetch failed; continuing with local base");
                return Ok(());
            }
            self.git_ok(repo, &["checkout", base]).await?;
            let pull = self.git(repo, &["pull", "--ff-only", "origin", base]).await?;
            if !pull.success() {
                warn!(base, stderr = %pull.stderr.trim(), "pull --ff-only failed; local base kept");
            }
        }
        Ok(())
    }

    /// Create `branch` from `base` and attach a worktree at `path`.
    ///
    /// Partial failures are rolled back: a branch without a worktree is
    /// deleted before the error is returned.
    pub async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
        base: &str,
    ) -> GitResult<()> {
        self.refresh_base(repo, base).await?;

        let path_str = path.display().to_string();
        let args = ["worktree", "add", "-b", branch, &path_str, base];
        let out = self.git(repo, &args).await?;
        if !out.success() {
            // Roll back whatever half-finished: worktree first, then branch.
            let _ = self
                .git(repo, &["worktree", "remove", "--force", &path_str])
                .await;
            let _ = self.git(repo, &["branch", "-D", branch]).await;
            return Err(GitError::failed(&args, out.stderr_with_hint()));
        }
        debug!(branch, path = %path.display(), "worktree created");
        Ok(())
    }

    /// Stage everything and commit. Returns `None` when nothing was staged.
    pub async fn commit_changes(&self, worktree: &Path, message: &str) -> GitResult<Option<String>> {
        self.git_ok(worktree, &["add", "-A"]).await?;

        let staged = self.git(worktree, &["diff", "--cached", "--quiet"]).await?;
        if staged.success() {
            return Ok(None);
        }

        self.git_ok(worktree, &["commit", "-m", message]).await?;
        let sha = self.current_head(worktree).await?;
        Ok(Some(sha))
    }

    /// Add a pattern to the repository's `info/exclude` so orchestrator
    /// metadata never shows up in status, diffs, or commits.
    pub async fn ensure_excluded(&self, worktree: &Path, pattern: &str) -> GitResult<()> {
        let raw = self
            .git_ok(worktree, &["rev-parse", "--git-path", "info/exclude"])
            .await?;
        let path = if Path::new(&raw).is_absolute() {
            std::path::PathBuf::from(raw)
        } else {
            worktree.join(raw)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if !existing.lines().any(|line| line.trim() == pattern) {
            let mut contents = existing;
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(pattern);
            contents.push('\n');
            std::fs::write(&path, contents)?;
        }
        Ok(())
    }

    pub async fn branch_info(&self, worktree: &Path, base: &str) -> GitResult<BranchInfo> {
        let branchpoint = self.git_ok(worktree, &["merge-base", base, "HEAD"]).await?;
        let range = format!("{base}...HEAD");
        let counts = self
            .git_ok(worktree, &["rev-list", "--left-right", "--count", &range])
            .await?;
        let mut parts = counts.split_whitespace();
        let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(BranchInfo {
            ahead,
            behind,
            branchpoint,
        })
    }

    /// Commits in `base..HEAD`, oldest first.
    pub async fn commits_since_base(&self, worktree: &Path, base: &str) -> GitResult<Vec<CommitEntry>> {
        let range = format!("{base}..HEAD");
        let out = self
            .git_ok(worktree, &["log", "--reverse", "--format=%H|%s", &range])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let (sha, subject) = line.split_once('|')?;
                Some(CommitEntry {
                    sha: sha.to_string(),
                    subject: subject.to_string(),
                })
            })
            .collect())
    }

    // =========================================================================
    // Squash / rebase / merge pipeline
    // =========================================================================

    /// Collapse `base..HEAD` into a single commit whose tree equals the
    /// current session HEAD tree.
    ///
    /// Idempotent: re-invoking at the same HEAD with the same message is a
    /// no-op returning the existing tip.
    pub async fn squash_commits(
        &self,
        worktree: &Path,
        base: &str,
        message: &str,
        mode: SquashMode,
    ) -> GitResult<SquashOutcome> {
        let commits = self.commits_since_base(worktree, base).await?;
        if commits.is_empty() {
            return Ok(SquashOutcome::Done(None));
        }
        if commits.len() == 1 && commits[0].subject == message {
            // Already squashed at this HEAD.
            return Ok(SquashOutcome::Done(Some(commits[0].sha.clone())));
        }

        let original_head = self.current_head(worktree).await?;

        match mode {
            SquashMode::IncludeManual => {
                self.git_ok(worktree, &["reset", "--soft", base]).await?;
                let staged = self.git(worktree, &["diff", "--cached", "--quiet"]).await?;
                if staged.success() {
                    // Session tree equals base tree; nothing survives the squash.
                    return Ok(SquashOutcome::Done(None));
                }
                self.git_ok(worktree, &["commit", "-m", message]).await?;
                let sha = self.current_head(worktree).await?;
                Ok(SquashOutcome::Done(Some(sha)))
            }
            SquashMode::ExcludeManual => {
                let manual: Vec<CommitEntry> = commits
                    .iter()
                    .filter(|c| !c.is_agent_commit())
                    .cloned()
                    .collect();

                self.git_ok(worktree, &["reset", "--hard", base]).await?;
                for commit in &manual {
                    let pick = self.git(worktree, &["cherry-pick", commit.sha.as_str()]).await?;
                    if !pick.success() {
                        let files = self.conflicted_files(worktree).await?;
                        if !files.is_empty() {
                            return Ok(SquashOutcome::Conflict { files });
                        }
                        let _ = self.git(worktree, &["cherry-pick", "--abort"]).await;
                        self.git_ok(worktree, &["reset", "--hard", &original_head])
                            .await?;
                        return Err(GitError::failed(
                            &["cherry-pick", &commit.sha],
                            pick.stderr_with_hint(),
                        ));
                    }
                }

                // Final squash restores the exact original tree on top of the
                // replayed manual commits via commit-tree plumbing.
                let tree = self
                    .git_ok(worktree, &["rev-parse", &format!("{original_head}^{{tree}}")])
                    .await?;
                let head_tree = self.git_ok(worktree, &["rev-parse", "HEAD^{tree}"]).await?;
                if tree == head_tree {
                    let sha = self.current_head(worktree).await?;
                    return Ok(SquashOutcome::Done(Some(sha)));
                }
                let head = self.current_head(worktree).await?;
                let new = self
                    .git_ok(worktree, &["commit-tree", &tree, "-p", &head, "-m", message])
                    .await?;
                self.git_ok(worktree, &["reset", "--hard", &new]).await?;
                Ok(SquashOutcome::Done(Some(new)))
            }
        }
    }

    pub async fn rebase_onto_base(&self, worktree: &Path, base: &str) -> GitResult<RebaseOutcome> {
        let out = self.git(worktree, &["rebase", base]).await?;
        self.rebase_result(worktree, out, &["rebase", base]).await
    }

    pub async fn continue_rebase(&self, worktree: &Path) -> GitResult<RebaseOutcome> {
        let args = ["-c", "core.editor=true", "rebase", "--continue"];
        let out = self.git(worktree, &args).await?;
        self.rebase_result(worktree, out, &args).await
    }

    pub async fn abort_rebase(&self, worktree: &Path) -> GitResult<()> {
        self.git_ok(worktree, &["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn rebase_result(
        &self,
        worktree: &Path,
        out: GitOutput,
        args: &[&str],
    ) -> GitResult<RebaseOutcome> {
        if out.success() {
            return Ok(RebaseOutcome::Clean);
        }
        let files = self.conflicted_files(worktree).await?;
        if !files.is_empty() {
            return Ok(RebaseOutcome::Conflict { files });
        }
        Err(GitError::failed(args, out.stderr_with_hint()))
    }

    pub async fn conflicted_files(&self, worktree: &Path) -> GitResult<Vec<String>> {
        let out = self
            .git_ok(worktree, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Merge `branch` into `base` in the main repository checkout.
    pub async fn fast_forward_merge(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        no_ff: bool,
    ) -> GitResult<()> {
        self.git_ok(repo, &["checkout", base]).await?;
        if no_ff {
            let msg = format!("merge {branch}");
            self.git_ok(repo, &["merge", "--no-ff", branch, "-m", &msg])
                .await?;
        } else {
            self.git_ok(repo, &["merge", "--ff-only", branch]).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove a session worktree and branch only when its HEAD is already an
    /// ancestor of `base`.
    pub async fn safe_remove_worktree_and_branch(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> GitResult<()> {
        let head = self.current_head(worktree).await?;
        if !self.is_ancestor(repo, &head, base).await? {
            return Err(GitError::UnmergedDeletion {
                branch: branch.to_string(),
                base: base.to_string(),
            });
        }
        let path_str = worktree.display().to_string();
        self.git_ok(repo, &["worktree", "remove", &path_str]).await?;
        let del = self.git(repo, &["branch", "-d", branch]).await?;
        if !del.success() {
            warn!(branch, stderr = %del.stderr.trim(), "branch delete warning");
        }
        Ok(())
    }

    /// Force-remove the worktree, branch, and any residual directory.
    pub async fn force_remove_worktree_and_branch(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
    ) -> GitResult<()> {
        let path_str = worktree.display().to_string();
        let rm = self
            .git(repo, &["worktree", "remove", "--force", &path_str])
            .await?;
        if !rm.success() {
            warn!(path = %path_str, stderr = %rm.stderr.trim(), "worktree remove warning");
        }
        let del = self.git(repo, &["branch", "-D", branch]).await?;
        if !del.success() {
            warn!(branch, stderr = %del.stderr.trim(), "branch delete warning");
        }
        if worktree.exists() {
            std::fs::remove_dir_all(worktree)?;
        }
        let _ = self.git(repo, &["worktree", "prune"]).await;
        Ok(())
    }

    // =========================================================================
    // Diff stats
    // =========================================================================

    /// Numstat between two commits.
    pub async fn diff_numstat_range(
        &self,
        worktree: &Path,
        pre: &str,
        post: &str,
    ) -> GitResult<DiffStats> {
        let range = format!("{pre}..{post}");
        let out = self.git_ok(worktree, &["diff", "--numstat", &range]).await?;
        Ok(parse_numstat(&out))
    }

    /// Numstat of the index and working tree against HEAD. Untracked files
    /// are made visible via intent-to-add entries first.
    pub async fn diff_numstat_worktree(&self, worktree: &Path) -> GitResult<DiffStats> {
        let _ = self.git(worktree, &["add", "--intent-to-add", "."]).await;
        let out = self.git_ok(worktree, &["diff", "--numstat", "HEAD"]).await?;
        Ok(parse_numstat(&out))
    }
}

/// Parse `git diff --numstat` output. Binary files appear as `-\t-\tpath`
/// and count as a changed file with zero line deltas.
pub fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(deleted), Some(_path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stats.files_changed += 1;
        if added != "-" {
            stats.lines_added += added.parse::<u64>().unwrap_or(0);
        }
        if deleted != "-" {
            stats.lines_deleted += deleted.parse::<u64>().unwrap_or(0);
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn setup_git_repo() -> (tempfile::TempDir, GitOps) {
        let dir = tempdir().unwrap();
        run(dir.path(), &["init", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "test@test.com"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "Initial commit"]);
        (dir, GitOps::default())
    }

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

    #[test]
    fn numstat_parsing_counts_binary_files() {
        let stats = parse_numstat("3\t1\tsrc/main.rs\n-\t-\tassets/logo.png\n10\t0\tREADME.md\n");
        assert_eq!(stats.files_changed, 3);
        assert_eq!(stats.lines_added, 13);
        assert_eq!(stats.lines_deleted, 1);
    }

    #[tokio::test]
    async fn commit_changes_returns_none_when_clean() {
        let (dir, ops) = setup_git_repo();
        let sha = ops.commit_changes(dir.path(), "agent: noop").await.unwrap();
        assert!(sha.is_none());
    }

    #[tokio::test]
    async fn commit_changes_commits_dirty_tree() {
        let (dir, ops) = setup_git_repo();
        std::fs::write(dir.path().join("x.txt"), "hi\n").unwrap();
        let sha = ops
            .commit_changes(dir.path(), "agent: add x")
            .await
            .unwrap()
            .expect("commit created");
        assert_eq!(sha, ops.current_head(dir.path()).await.unwrap());
        assert!(!ops.is_dirty(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn worktree_create_and_safe_remove() {
        let (dir, ops) = setup_git_repo();
        let wt = dir.path().join(".worktrees").join("s1");
        ops.create_worktree(dir.path(), "agent/t/20250101-000000", &wt, "main")
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());

        // Branch HEAD equals base HEAD, so safe removal succeeds.
        ops.safe_remove_worktree_and_branch(dir.path(), &wt, "agent/t/20250101-000000", "main")
            .await
            .unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn safe_remove_refuses_unmerged_work() {
        let (dir, ops) = setup_git_repo();
        let wt = dir.path().join(".worktrees").join("s2");
        ops.create_worktree(dir.path(), "agent/u/20250101-000000", &wt, "main")
            .await
            .unwrap();
        std::fs::write(wt.join("new.txt"), "work\n").unwrap();
        ops.commit_changes(&wt, "agent: work").await.unwrap();

        let err = ops
            .safe_remove_worktree_and_branch(dir.path(), &wt, "agent/u/20250101-000000", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::UnmergedDeletion { .. }));
        assert!(wt.exists());

        ops.force_remove_worktree_and_branch(dir.path(), &wt, "agent/u/20250101-000000")
            .await
            .unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn branch_info_counts_ahead_and_behind() {
        let (dir, ops) = setup_git_repo();
        let base_head = ops.current_head(dir.path()).await.unwrap();
        let wt = dir.path().join(".worktrees").join("s3");
        ops.create_worktree(dir.path(), "agent/b/20250101-000000", &wt, "main")
            .await
            .unwrap();

        std::fs::write(wt.join("a.txt"), "a\n").unwrap();
        ops.commit_changes(&wt, "agent: a").await.unwrap();
        std::fs::write(wt.join("b.txt"), "b\n").unwrap();
        ops.commit_changes(&wt, "agent: b").await.unwrap();

        let info = ops.branch_info(&wt, "main").await.unwrap();
        assert_eq!(info.ahead, 2);
        assert_eq!(info.behind, 0);
        assert_eq!(info.branchpoint, base_head);
    }

    #[tokio::test]
    async fn squash_include_collapses_to_one_commit() {
        let (dir, ops) = setup_git_repo();
        let wt = dir.path().join(".worktrees").join("s4");
        ops.create_worktree(dir.path(), "agent/s/20250101-000000", &wt, "main")
            .await
            .unwrap();

        std::fs::write(wt.join("a.txt"), "a\n").unwrap();
        ops.commit_changes(&wt, "agent: a").await.unwrap();
        std::fs::write(wt.join("b.txt"), "b\n").unwrap();
        ops.commit_changes(&wt, "agent: b").await.unwrap();
        let pre_tree_head = ops.current_head(&wt).await.unwrap();

        let outcome = ops
            .squash_commits(&wt, "main", "feat: ab", SquashMode::IncludeManual)
            .await
            .unwrap();
        let SquashOutcome::Done(Some(sha)) = outcome else {
            panic!("expected squash commit");
        };

        let commits = ops.commits_since_base(&wt, "main").await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "feat: ab");

        // Tree is preserved.
        let old_tree = ops
            .git_ok(&wt, &["rev-parse", &format!("{pre_tree_head}^{{tree}}")])
            .await
            .unwrap();
        let new_tree = ops
            .git_ok(&wt, &["rev-parse", &format!("{sha}^{{tree}}")])
            .await
            .unwrap();
        assert_eq!(old_tree, new_tree);

        // Idempotent when re-invoked at the same HEAD.
        let again = ops
            .squash_commits(&wt, "main", "feat: ab", SquashMode::IncludeManual)
            .await
            .unwrap();
        assert_eq!(again, SquashOutcome::Done(Some(sha)));
    }

    #[tokio::test]
    async fn squash_exclude_preserves_manual_commits() {
        let (dir, ops) = setup_git_repo();
        let wt = dir.path().join(".worktrees").join("s5");
        ops.create_worktree(dir.path(), "agent/x/20250101-000000", &wt, "main")
            .await
            .unwrap();

        std::fs::write(wt.join("agent.txt"), "a\n").unwrap();
        ops.commit_changes(&wt, "agent: add agent.txt").await.unwrap();
        std::fs::write(wt.join("manual.txt"), "m\n").unwrap();
        ops.commit_changes(&wt, "operator tweak").await.unwrap();
        std::fs::write(wt.join("agent2.txt"), "a2\n").unwrap();
        ops.commit_changes(&wt, "agent: add agent2.txt").await.unwrap();
        let orig_head = ops.current_head(&wt).await.unwrap();

        let outcome = ops
            .squash_commits(&wt, "main", "feat: squashed", SquashMode::ExcludeManual)
            .await
            .unwrap();
        let SquashOutcome::Done(Some(sha)) = outcome else {
            panic!("expected squash commit");
        };

        let commits = ops.commits_since_base(&wt, "main").await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].subject, "operator tweak");
        assert_eq!(commits[1].subject, "feat: squashed");

        let old_tree = ops
            .git_ok(&wt, &["rev-parse", &format!("{orig_head}^{{tree}}")])
            .await
            .unwrap();
        let new_tree = ops
            .git_ok(&wt, &["rev-parse", &format!("{sha}^{{tree}}")])
            .await
            .unwrap();
        assert_eq!(old_tree, new_tree);
    }

    #[tokio::test]
    async fn rebase_reports_conflict_files() {
        let (dir, ops) = setup_git_repo();
        std::fs::write(dir.path().join("y.txt"), "line\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "add y"]);

        let wt = dir.path().join(".worktrees").join("s6");
        ops.create_worktree(dir.path(), "agent/c/20250101-000000", &wt, "main")
            .await
            .unwrap();

        // Session edits y.txt; base edits the same line.
        std::fs::write(wt.join("y.txt"), "session\n").unwrap();
        ops.commit_changes(&wt, "agent: session edit").await.unwrap();
        std::fs::write(dir.path().join("y.txt"), "base\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "base edit"]);

        let outcome = ops.rebase_onto_base(&wt, "main").await.unwrap();
        let RebaseOutcome::Conflict { files } = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(files, vec!["y.txt".to_string()]);

        // Resolve and continue.
        std::fs::write(wt.join("y.txt"), "resolved\n").unwrap();
        ops.git_ok(&wt, &["add", "y.txt"]).await.unwrap();
        let cont = ops.continue_rebase(&wt).await.unwrap();
        assert_eq!(cont, RebaseOutcome::Clean);
    }

    #[tokio::test]
    async fn fast_forward_merge_moves_base() {
        let (dir, ops) = setup_git_repo();
        let wt = dir.path().join(".worktrees").join("s7");
        ops.create_worktree(dir.path(), "agent/m/20250101-000000", &wt, "main")
            .await
            .unwrap();
        std::fs::write(wt.join("f.txt"), "f\n").unwrap();
        ops.commit_changes(&wt, "agent: add f").await.unwrap();
        let branch_head = ops.current_head(&wt).await.unwrap();

        ops.fast_forward_merge(dir.path(), "agent/m/20250101-000000", "main", false)
            .await
            .unwrap();
        assert_eq!(ops.current_head(dir.path()).await.unwrap(), branch_head);
        assert!(dir.path().join("f.txt").exists());
    }
}
