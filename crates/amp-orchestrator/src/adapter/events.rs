//! Typed events decoded from the agent's JSON stream
//!
//! Each stdout object carries a `type` discriminator. Known types decode to
//! typed variants; unknown types are preserved verbatim so forward-compatible
//! payloads survive replay.

use serde_json::Value;
use session_core::TokenUsage;

/// Decoded agent event plus the raw object it came from.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEventKind {
    /// First event of a spawn; carries the agent-issued thread id.
    SystemInit { thread_id: Option<String> },

    /// Echo of the user message.
    User { text: String },

    /// Assistant content chunk.
    AssistantMessage { text: String },

    /// A tool invocation started.
    ToolUse {
        id: String,
        name: String,
        args: Value,
    },

    /// A tool invocation finished.
    ToolResult { id: String, success: bool },

    /// Token accounting, possibly incremental.
    TokenUsage {
        model: Option<String>,
        usage: TokenUsage,
    },

    /// Terminal record with exit status and aggregate usage.
    Result {
        exit_code: Option<i32>,
        usage: Option<TokenUsage>,
    },

    /// Error reported by the agent or the parser.
    Error { message: String },

    /// Unrecognized type; kept verbatim in `raw`.
    Unknown { event_type: String },
}

impl AgentEvent {
    /// Decode one stdout object.
    pub fn from_value(raw: Value) -> Self {
        let kind = decode(&raw);
        Self { kind, raw }
    }

    /// Wire-level type string used for stream-event persistence.
    pub fn event_type(&self) -> &str {
        match &self.kind {
            AgentEventKind::SystemInit { .. } => "system",
            AgentEventKind::User { .. } => "user",
            AgentEventKind::AssistantMessage { .. } => "assistant",
            AgentEventKind::ToolUse { .. } => "tool_use",
            AgentEventKind::ToolResult { .. } => "tool_result",
            AgentEventKind::TokenUsage { .. } => "usage",
            AgentEventKind::Result { .. } => "result",
            AgentEventKind::Error { .. } => "error",
            AgentEventKind::Unknown { event_type } => event_type,
        }
    }

    /// Whether the agent is telling us a supplied thread id is stale.
    pub fn is_thread_not_found(&self) -> bool {
        matches!(
            &self.kind,
            AgentEventKind::Error { message } if message.to_lowercase().contains("thread not found")
        )
    }
}

fn decode(raw: &Value) -> AgentEventKind {
    let event_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" => AgentEventKind::SystemInit {
            thread_id: raw
                .get("session_id")
                .or_else(|| raw.get("thread_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "user" => AgentEventKind::User {
            text: text_of(raw),
        },
        "assistant" | "assistant_message" => AgentEventKind::AssistantMessage {
            text: text_of(raw),
        },
        "tool_use" => AgentEventKind::ToolUse {
            id: str_field(raw, "id").unwrap_or_default(),
            name: str_field(raw, "name")
                .or_else(|| str_field(raw, "tool"))
                .unwrap_or_default(),
            args: raw
                .get("input")
                .or_else(|| raw.get("args"))
                .cloned()
                .unwrap_or(Value::Null),
        },
        "tool_result" => AgentEventKind::ToolResult {
            id: str_field(raw, "id")
                .or_else(|| str_field(raw, "tool_use_id"))
                .unwrap_or_default(),
            success: !raw
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "usage" | "token_usage" => AgentEventKind::TokenUsage {
            model: str_field(raw, "model"),
            usage: usage_of(raw),
        },
        "result" => AgentEventKind::Result {
            exit_code: raw
                .get("exit_code")
                .and_then(Value::as_i64)
                .map(|v| v as i32),
            usage: raw.get("usage").map(usage_of),
        },
        "error" => AgentEventKind::Error {
            message: str_field(raw, "message")
                .or_else(|| str_field(raw, "error"))
                .unwrap_or_else(|| "unknown agent error".to_string()),
        },
        other => AgentEventKind::Unknown {
            event_type: if other.is_empty() {
                "unknown".to_string()
            } else {
                other.to_string()
            },
        },
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

fn text_of(raw: &Value) -> String {
    str_field(raw, "text")
        .or_else(|| str_field(raw, "message"))
        .or_else(|| str_field(raw, "content"))
        .unwrap_or_default()
}

fn usage_of(raw: &Value) -> TokenUsage {
    let prompt = raw
        .get("prompt")
        .or_else(|| raw.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = raw
        .get("completion")
        .or_else(|| raw.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = raw
        .get("total")
        .or_else(|| raw.get("total_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    TokenUsage {
        prompt,
        completion,
        total,
    }
}
