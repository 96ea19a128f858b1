//! Entity types persisted by the store
//!
//! Mirrors the durable data model: sessions own iterations, tool calls,
//! stream events, and merge history; batch runs own batch items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle status. Mutated only by the worktree manager, merge
/// engine, and batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Running,
    AwaitingInput,
    Error,
    Done,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingInput => "awaitingInput",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "awaitingInput" => Some(Self::AwaitingInput),
            "error" => Some(Self::Error),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// How the session is driven: batch-style iterations or an interactive chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    Async,
    Interactive,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Interactive => "interactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async" => Some(Self::Async),
            "interactive" => Some(Self::Interactive),
            _ => None,
        }
    }
}

/// A branch-scoped unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub initial_prompt: String,
    pub repo_root: String,
    pub base_branch: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub script_command: Option<String>,
    pub model_override: Option<String>,
    pub auto_commit: bool,
    pub thread_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        initial_prompt: impl Into<String>,
        repo_root: impl Into<String>,
        base_branch: impl Into<String>,
        branch_name: impl Into<String>,
        worktree_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            initial_prompt: initial_prompt.into(),
            repo_root: repo_root.into(),
            base_branch: base_branch.into(),
            branch_name: branch_name.into(),
            worktree_path: worktree_path.into(),
            status: SessionStatus::Idle,
            mode: SessionMode::Async,
            script_command: None,
            model_override: None,
            auto_commit: true,
            thread_id: None,
            notes: None,
            created_at: Utc::now(),
            last_run: None,
        }
    }
}

/// Outcome of the optional per-iteration script command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestResult {
    Pass,
    Fail,
    None,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Token counts reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// One agent run within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub commit_sha: Option<String>,
    pub files_changed: u32,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub test_result: TestResult,
    pub test_exit_code: Option<i32>,
    pub model: Option<String>,
    pub agent_version: Option<String>,
    pub exit_code: Option<i32>,
    pub token_usage: TokenUsage,
    pub thread_id: Option<String>,
}

impl Iteration {
    pub fn begin(session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            commit_sha: None,
            files_changed: 0,
            lines_added: 0,
            lines_deleted: 0,
            test_result: TestResult::None,
            test_exit_code: None,
            model: None,
            agent_version: None,
            exit_code: None,
            token_usage: TokenUsage::default(),
            thread_id: None,
        }
    }
}

/// One tool invocation emitted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub session_id: String,
    pub iteration_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    /// Possibly truncated for large payloads.
    pub args_json: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub raw_json: Option<String>,
}

/// Raw, ordered agent event kept verbatim for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEventRecord {
    pub session_id: String,
    /// Monotonic per session; assigned by the store.
    pub seq: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data_json: String,
}

/// A conversation identifier owned by the agent CLI.
///
/// Ids are authoritative only when issued by the agent; the store never
/// fabricates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u32,
}

/// Terminal state of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeResult {
    InProgress,
    Success,
    Conflict,
    Aborted,
    Error,
}

impl MergeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::Success => "success",
            Self::Conflict => "conflict",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inProgress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "conflict" => Some(Self::Conflict),
            "aborted" => Some(Self::Aborted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Audit record of one merge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeHistoryRecord {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub base_branch: String,
    pub mode: String,
    pub result: MergeResult,
    pub conflict_files: Vec<String>,
    pub squash_message: Option<String>,
}

impl MergeHistoryRecord {
    pub fn begin(
        session_id: impl Into<String>,
        base_branch: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            base_branch: base_branch.into(),
            mode: mode.into(),
            result: MergeResult::InProgress,
            conflict_files: Vec::new(),
            squash_message: None,
        }
    }
}

/// Status of a whole batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Running,
    Completed,
    Aborted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Status of one scheduled batch item.
///
/// Transitions queued → running → terminal exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchItemStatus {
    Queued,
    Running,
    Success,
    Fail,
    Error,
    Timeout,
    Aborted,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Legal single-step transitions.
    pub fn can_transition_to(&self, next: BatchItemStatus) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Aborted),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// A scheduled run over a plan matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub defaults_json: String,
    pub concurrency: u32,
    pub status: BatchStatus,
}

/// One item of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub run_id: String,
    pub repo: String,
    pub prompt: String,
    pub model: Option<String>,
    pub script_command: Option<String>,
    pub timeout_sec: Option<u64>,
    pub status: BatchItemStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub tokens_total: u64,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Derived per-session rollup, maintained transactionally with iteration
/// finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub iterations: u32,
    pub files_changed: u32,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub total_tokens: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            SessionStatus::Idle,
            SessionStatus::Running,
            SessionStatus::AwaitingInput,
            SessionStatus::Error,
            SessionStatus::Done,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn batch_item_transitions() {
        use BatchItemStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Aborted));
        assert!(!Queued.can_transition_to(Success));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Timeout));
        assert!(!Success.can_transition_to(Running));
        assert!(!Aborted.can_transition_to(Running));
    }

    #[test]
    fn token_usage_accumulates() {
        let mut u = TokenUsage::default();
        u.add(TokenUsage {
            prompt: 10,
            completion: 5,
            total: 15,
        });
        u.add(TokenUsage {
            prompt: 1,
            completion: 2,
            total: 3,
        });
        assert_eq!(u.total, 18);
        assert_eq!(u.prompt, 11);
    }
}
