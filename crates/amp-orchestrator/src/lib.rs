//! Worktree-isolated session orchestrator for the Amp coding agent
//!
//! This crate drives the external agent CLI as a subprocess: it creates an
//! isolated git worktree per session, streams the agent's JSON output into a
//! durable event log and typed telemetry store, supports batch and
//! interactive modes, and merges session branches back into their base via
//! the squash → rebase → fast-forward pipeline in `session-core`.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod controller;
pub mod session;
pub mod telemetry;

// Re-export the adapter surface
pub use adapter::{
    AdapterError, AdapterResult, AgentEvent, AgentEventKind, AmpAdapter, CompletedToolCall,
    HandleState, InteractiveEvent, InteractiveHandle, JsonStreamParser, RunOutcome, RunRequest,
    StreamChunk,
};

// Re-export session lifecycle types
pub use session::{
    ContextBundle, CreateSessionOptions, IterateOptions, SessionError, SessionManager,
    SessionResult,
};

// Re-export batch and controller types
pub use batch::{BatchError, BatchResult, BatchScheduler};
pub use config::{AmpConfig, OrchestratorConfig};
pub use controller::Controller;
