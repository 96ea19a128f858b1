//! Session orchestration core
//!
//! This library provides:
//! - Typed git operations scoped to per-session worktrees
//! - A single-file durable store for sessions, iterations, and telemetry
//! - An event bus with store and NDJSON sinks
//! - The preflight → squash → rebase → fast-forward merge pipeline
//! - Batch plan parsing and validation
//!
//! The agent adapter, worktree manager, and batch scheduler live in the
//! `amp-orchestrator` crate and build on these primitives.

pub mod events;
pub mod git;
pub mod merge;
pub mod plan;
pub mod store;

// Re-export key git types
pub use git::{
    BranchInfo, CommitEntry, DiffStats, GitConfig, GitError, GitOps, GitOutput, GitResult,
    GitRunner, RebaseOutcome, SquashMode, SquashOutcome,
};

// Re-export key store types
pub use store::{
    BatchItem, BatchItemStatus, BatchRun, BatchStatus, Iteration, MergeHistoryRecord, MergeResult,
    Session, SessionMode, SessionStatus, SessionSummary, SharedStore, Store, StoreError,
    StoreOptions, StoreResult, StreamEventRecord, TestResult, ThreadRecord, TokenUsage,
    ToolCallRecord,
};

// Re-export key event types
pub use events::{
    BusError, BusResult, EventBus, EventSink, MetricEvent, NdjsonSink, SharedEventBus, StoreSink,
};

// Re-export merge pipeline types
pub use merge::{MergeEngine, MergeError, MergePhase, MergeStepResult, PreflightReport};

// Re-export plan types
pub use plan::{BatchPlan, PlanDefaults, PlanError, PlanItem, PlanResult, ResolvedItem};
