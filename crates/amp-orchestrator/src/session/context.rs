//! AGENT_CONTEXT bundle
//!
//! Every session worktree carries an `AGENT_CONTEXT/` folder the agent can
//! read: a rendered briefing, the current diff summary, an append-only
//! iteration log, and the last machine-readable status.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use session_core::Session;

pub const CONTEXT_DIR: &str = "AGENT_CONTEXT";
pub const SESSION_FILE: &str = "SESSION.md";
pub const DIFF_SUMMARY_FILE: &str = "DIFF_SUMMARY.md";
pub const ITERATION_LOG_FILE: &str = "ITERATION_LOG.md";
pub const LAST_STATUS_FILE: &str = "LAST_STATUS.json";

/// Writer for a session's context folder.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    dir: PathBuf,
}

impl ContextBundle {
    pub fn new(worktree: &Path) -> Self {
        Self {
            dir: worktree.join(CONTEXT_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the initial bundle for a freshly created session.
    pub fn write_initial(&self, session: &Session) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let brief = format!(
            "# Session: {name}\n\n\
             - Branch: `{branch}`\n\
             - Base: `{base}`\n\
             - Created: {created}\n\n\
             ## Objective\n\n{prompt}\n",
            name = session.name,
            branch = session.branch_name,
            base = session.base_branch,
            created = session.created_at.to_rfc3339(),
            prompt = session.initial_prompt,
        );
        std::fs::write(self.dir.join(SESSION_FILE), brief)?;
        std::fs::write(
            self.dir.join(DIFF_SUMMARY_FILE),
            "# Diff Summary\n\n_No changes yet._\n",
        )?;
        std::fs::write(self.dir.join(ITERATION_LOG_FILE), "# Iteration Log\n")?;
        self.write_last_status(&serde_json::json!({
            "sessionId": session.id,
            "status": session.status.as_str(),
            "updatedAt": Utc::now().to_rfc3339(),
        }))
    }

    /// Replace the diff summary with the current working-tree diff.
    pub fn write_diff_summary(&self, diff: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let body = if diff.trim().is_empty() {
            "# Diff Summary\n\n_No changes yet._\n".to_string()
        } else {
            format!("# Diff Summary\n\n```diff\n{}\n```\n", diff.trim_end())
        };
        std::fs::write(self.dir.join(DIFF_SUMMARY_FILE), body)
    }

    /// Append one line to the iteration log.
    pub fn append_iteration_log(&self, line: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ITERATION_LOG_FILE))?;
        writeln!(file, "- {line}")
    }

    pub fn write_last_status(&self, status: &serde_json::Value) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(
            self.dir.join(LAST_STATUS_FILE),
            serde_json::to_string_pretty(status).unwrap_or_else(|_| "{}".into()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initial_bundle_contains_all_files() {
        let dir = tempdir().unwrap();
        let session = Session::new(
            "T1",
            "create file X",
            dir.path().display().to_string(),
            "main",
            "agent/t1/20250101-000000",
            dir.path().join(".worktrees/t1").display().to_string(),
        );
        let bundle = ContextBundle::new(dir.path());
        bundle.write_initial(&session).unwrap();

        let ctx = dir.path().join(CONTEXT_DIR);
        assert!(ctx.join(SESSION_FILE).exists());
        assert!(ctx.join(DIFF_SUMMARY_FILE).exists());
        assert!(ctx.join(ITERATION_LOG_FILE).exists());
        assert!(ctx.join(LAST_STATUS_FILE).exists());

        let brief = std::fs::read_to_string(ctx.join(SESSION_FILE)).unwrap();
        assert!(brief.contains("create file X"));
        assert!(brief.contains("agent/t1/20250101-000000"));
    }

    #[test]
    fn iteration_log_appends() {
        let dir = tempdir().unwrap();
        let bundle = ContextBundle::new(dir.path());
        bundle.append_iteration_log("iteration 1: 2 files").unwrap();
        bundle.append_iteration_log("iteration 2: clean").unwrap();
        let log =
            std::fs::read_to_string(dir.path().join(CONTEXT_DIR).join(ITERATION_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.ends_with("clean\n"));
    }

    #[test]
    fn diff_summary_wraps_in_fence() {
        let dir = tempdir().unwrap();
        let bundle = ContextBundle::new(dir.path());
        bundle.write_diff_summary("+added line\n-removed line").unwrap();
        let body =
            std::fs::read_to_string(dir.path().join(CONTEXT_DIR).join(DIFF_SUMMARY_FILE)).unwrap();
        assert!(body.contains("```diff"));
        assert!(body.contains("+added line"));
    }
}
