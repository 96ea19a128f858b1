//! Typed metric events flowing between producers and sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{BatchItemStatus, SessionStatus, TokenUsage, ToolCallRecord};

/// Event published on the bus by the agent adapter, worktree manager, merge
/// engine, and batch scheduler.
///
/// Unknown agent payloads stay inside `StreamEvent::data` verbatim; every
/// variant carries the ids consumers need for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    /// Raw agent event, retained verbatim for replay.
    StreamEvent {
        session_id: String,
        iteration_id: Option<String>,
        timestamp: DateTime<Utc>,
        event_type: String,
        data: serde_json::Value,
    },

    /// A completed (paired) tool invocation.
    ToolCall {
        session_id: String,
        iteration_id: Option<String>,
        call: ToolCallRecord,
    },

    /// Token accounting reported by the agent, possibly incremental.
    TokenUsage {
        session_id: String,
        iteration_id: Option<String>,
        timestamp: DateTime<Utc>,
        model: Option<String>,
        usage: TokenUsage,
    },

    IterationStarted {
        session_id: String,
        iteration_id: String,
        timestamp: DateTime<Utc>,
    },

    IterationFinished {
        session_id: String,
        iteration_id: String,
        timestamp: DateTime<Utc>,
        commit_sha: Option<String>,
    },

    SessionStatusChanged {
        session_id: String,
        timestamp: DateTime<Utc>,
        status: SessionStatus,
    },

    MergeStep {
        session_id: String,
        timestamp: DateTime<Utc>,
        step: String,
        ok: bool,
    },

    /// Batch item progress; routed by run id.
    BatchItemProgress {
        run_id: String,
        item_id: String,
        session_id: Option<String>,
        timestamp: DateTime<Utc>,
        status: BatchItemStatus,
    },
}

impl MetricEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamEvent { .. } => "stream_event",
            Self::ToolCall { .. } => "tool_call",
            Self::TokenUsage { .. } => "token_usage",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationFinished { .. } => "iteration_finished",
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::MergeStep { .. } => "merge_step",
            Self::BatchItemProgress { .. } => "batch_item_progress",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StreamEvent { session_id, .. }
            | Self::ToolCall { session_id, .. }
            | Self::TokenUsage { session_id, .. }
            | Self::IterationStarted { session_id, .. }
            | Self::IterationFinished { session_id, .. }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::MergeStep { session_id, .. } => Some(session_id),
            Self::BatchItemProgress { session_id, .. } => session_id.as_deref(),
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::BatchItemProgress { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    pub fn iteration_id(&self) -> Option<&str> {
        match self {
            Self::StreamEvent { iteration_id, .. }
            | Self::ToolCall { iteration_id, .. }
            | Self::TokenUsage { iteration_id, .. } => iteration_id.as_deref(),
            Self::IterationStarted { iteration_id, .. }
            | Self::IterationFinished { iteration_id, .. } => Some(iteration_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StreamEvent { timestamp, .. }
            | Self::TokenUsage { timestamp, .. }
            | Self::IterationStarted { timestamp, .. }
            | Self::IterationFinished { timestamp, .. }
            | Self::SessionStatusChanged { timestamp, .. }
            | Self::MergeStep { timestamp, .. }
            | Self::BatchItemProgress { timestamp, .. } => *timestamp,
            Self::ToolCall { call, .. } => call.timestamp,
        }
    }

    /// One NDJSON log line: `{type, sessionId, iterationId?, timestamp, data}`.
    pub fn to_ndjson_line(&self) -> serde_json::Value {
        let mut line = serde_json::json!({
            "type": self.event_type(),
            "sessionId": self.session_id().unwrap_or_default(),
            "timestamp": self.timestamp().to_rfc3339(),
            "data": serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        });
        if let Some(iteration_id) = self.iteration_id() {
            line["iterationId"] = serde_json::Value::String(iteration_id.to_string());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_line_shape() {
        let event = MetricEvent::TokenUsage {
            session_id: "s1".into(),
            iteration_id: Some("i1".into()),
            timestamp: Utc::now(),
            model: Some("m".into()),
            usage: TokenUsage {
                prompt: 10,
                completion: 5,
                total: 15,
            },
        };
        let line = event.to_ndjson_line();
        assert_eq!(line["type"], "token_usage");
        assert_eq!(line["sessionId"], "s1");
        assert_eq!(line["iterationId"], "i1");
        assert!(line["timestamp"].is_string());
        assert_eq!(line["data"]["usage"]["total"], 15);
    }

    #[test]
    fn batch_events_route_by_run() {
        let event = MetricEvent::BatchItemProgress {
            run_id: "r1".into(),
            item_id: "it1".into(),
            session_id: None,
            timestamp: Utc::now(),
            status: BatchItemStatus::Running,
        };
        assert_eq!(event.run_id(), Some("r1"));
        assert_eq!(event.session_id(), None);
    }
}
