//! Event sinks: durable store writes and append-only NDJSON logs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::types::MetricEvent;
use crate::store::SharedStore;

/// Consumer of bus events. Implementations must be idempotent on replay
/// where the event carries a stable id.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &MetricEvent) -> anyhow::Result<()>;
}

/// Writes tool calls and stream events into the store.
///
/// Token usage reaches the store through iteration finalization; this sink
/// persists only the provenance streams, so agent-reported numbers are never
/// double counted into session totals.
pub struct StoreSink {
    store: SharedStore,
}

impl StoreSink {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn handle(&self, event: &MetricEvent) -> anyhow::Result<()> {
        match event {
            MetricEvent::StreamEvent {
                session_id,
                timestamp,
                event_type,
                data,
                ..
            } => {
                self.store.record_stream_event(
                    session_id,
                    event_type,
                    *timestamp,
                    &serde_json::to_string(data)?,
                )?;
            }
            MetricEvent::ToolCall { call, .. } => {
                self.store.record_tool_call(call)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Append-only NDJSON file sink for benchmark and audit trails.
///
/// One JSON object per line: `{type, sessionId, iterationId?, timestamp, data}`.
pub struct NdjsonSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl NdjsonSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for NdjsonSink {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    async fn handle(&self, event: &MetricEvent) -> anyhow::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!(path = %self.path.display(), "opened ndjson event log");
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("file opened above");
        let mut line = serde_json::to_vec(&event.to_ndjson_line())?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionStatus, Store, TokenUsage};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn ndjson_sink_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.ndjson");
        let sink = NdjsonSink::new(&path);

        for i in 0..3 {
            let event = MetricEvent::SessionStatusChanged {
                session_id: format!("s{i}"),
                timestamp: Utc::now(),
                status: SessionStatus::Idle,
            };
            sink.handle(&event).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["type"], "session_status_changed");
            assert!(parsed["sessionId"].as_str().unwrap().starts_with('s'));
        }
    }

    #[tokio::test]
    async fn store_sink_persists_stream_events_and_tool_calls() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("state.db")).unwrap().shared();
        let session = crate::store::Session::new(
            "sink",
            "prompt",
            "/tmp/r",
            "main",
            "agent/sink/20250101-000000",
            "/tmp/r/.worktrees/sink",
        );
        store.insert_session(&session).unwrap();
        let sink = StoreSink::new(store.clone());

        sink.handle(&MetricEvent::StreamEvent {
            session_id: session.id.clone(),
            iteration_id: None,
            timestamp: Utc::now(),
            event_type: "assistant".into(),
            data: serde_json::json!({"text": "hi"}),
        })
        .await
        .unwrap();

        sink.handle(&MetricEvent::TokenUsage {
            session_id: session.id.clone(),
            iteration_id: None,
            timestamp: Utc::now(),
            model: None,
            usage: TokenUsage {
                prompt: 1,
                completion: 1,
                total: 2,
            },
        })
        .await
        .unwrap();

        let events = store.stream_events_for_session(&session.id, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "assistant");
        // Token usage is not a stream row; totals come from iterations.
        assert_eq!(store.token_usage_for_session(&session.id).unwrap().total, 0);
    }
}
