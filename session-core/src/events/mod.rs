//! In-process pub/sub for typed metric events
//!
//! Producers publish onto a bounded queue; a dispatcher task fans events out
//! to the registered sinks and to in-memory broadcast subscribers. A full
//! queue applies backpressure by blocking the publisher; telemetry is never
//! silently dropped.

pub mod sinks;
pub mod types;

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use sinks::{EventSink, NdjsonSink, StoreSink};
pub use types::MetricEvent;

/// Capacity of the bounded publish queue.
const QUEUE_CAPACITY: usize = 512;

/// Capacity of the broadcast channel for in-memory subscribers.
const BROADCAST_CAPACITY: usize = 256;

/// Error type for event bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Events must carry a session id (or a run id for batch progress).
    #[error("event missing routing id: {event_type}")]
    MissingSessionId { event_type: &'static str },

    #[error("event bus closed")]
    Closed,
}

/// Result type alias for event bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Shared reference to an EventBus.
pub type SharedEventBus = Arc<EventBus>;

/// Bounded-queue event bus with sink fan-out.
pub struct EventBus {
    tx: Mutex<Option<mpsc::Sender<MetricEvent>>>,
    broadcast_tx: broadcast::Sender<MetricEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Spawn a bus dispatching to the given sinks.
    pub fn spawn(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<MetricEvent>(QUEUE_CAPACITY);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let fanout = broadcast_tx.clone();

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Subscribers are best-effort; no receivers is fine.
                let _ = fanout.send(event.clone());
                for sink in &sinks {
                    if let Err(e) = sink.handle(&event).await {
                        warn!(
                            sink = sink.name(),
                            event_type = event.event_type(),
                            error = %e,
                            "sink write failed"
                        );
                    }
                }
            }
            debug!("event bus dispatcher drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            broadcast_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event. Blocks when the queue is full (backpressure).
    pub async fn publish(&self, event: MetricEvent) -> BusResult<()> {
        if event.session_id().is_none() && event.run_id().is_none() {
            return Err(BusError::MissingSessionId {
                event_type: event.event_type(),
            });
        }
        let tx = self
            .tx
            .lock()
            .expect("bus mutex poisoned")
            .clone()
            .ok_or(BusError::Closed)?;
        tx.send(event).await.map_err(|_| BusError::Closed)
    }

    /// Subscribe to the in-memory event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Close the queue and wait for the dispatcher to drain every queued
    /// event into the sinks.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().expect("bus mutex poisoned").take();
        drop(tx);
        let handle = self.dispatcher.lock().expect("bus mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct RecordingSink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn handle(&self, event: &MetricEvent) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(event.event_type().to_string());
            Ok(())
        }
    }

    fn status_event(session_id: &str) -> MetricEvent {
        MetricEvent::SessionStatusChanged {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            status: crate::store::SessionStatus::Running,
        }
    }

    #[tokio::test]
    async fn publishes_to_sinks_and_subscribers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::spawn(vec![Box::new(RecordingSink { seen: seen.clone() })]);
        let mut sub = bus.subscribe();

        bus.publish(status_event("s1")).await.unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_type(), "session_status_changed");

        bus.shutdown().await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["session_status_changed"]);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::spawn(vec![Box::new(RecordingSink { seen: seen.clone() })]);

        for i in 0..20 {
            bus.publish(status_event(&format!("s{i}"))).await.unwrap();
        }
        bus.shutdown().await;
        assert_eq!(seen.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_closed() {
        let bus = EventBus::spawn(vec![]);
        bus.shutdown().await;
        let err = bus.publish(status_event("s1")).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }
}
