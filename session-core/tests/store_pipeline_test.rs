//! Cross-module integration: concurrent producers through the bus into the
//! store, and uniqueness constraints across sessions.

use std::sync::Arc;

use chrono::Utc;
use session_core::{
    EventBus, MetricEvent, Session, SessionStatus, Store, StoreError, StoreSink, TokenUsage,
};
use tempfile::tempdir;

fn session(name: &str, repo: &str) -> Session {
    Session::new(
        name,
        "prompt",
        repo,
        "main",
        format!("agent/{name}/20250101-000000"),
        format!("{repo}/.worktrees/{name}"),
    )
}

#[tokio::test]
async fn concurrent_publishers_preserve_per_session_order() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("state.db")).unwrap().shared();
    let bus = Arc::new(EventBus::spawn(vec![Box::new(StoreSink::new(store.clone()))]));

    let a = session("a", "/tmp/ra");
    let b = session("b", "/tmp/rb");
    store.insert_session(&a).unwrap();
    store.insert_session(&b).unwrap();

    let mut tasks = Vec::new();
    for session in [a.clone(), b.clone()] {
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                bus.publish(MetricEvent::StreamEvent {
                    session_id: session.id.clone(),
                    iteration_id: None,
                    timestamp: Utc::now(),
                    event_type: "assistant".into(),
                    data: serde_json::json!({"i": i}),
                })
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    bus.shutdown().await;

    for session in [&a, &b] {
        let events = store.stream_events_for_session(&session.id, 0).unwrap();
        assert_eq!(events.len(), 50);
        // Sequence numbers are dense and ordered.
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<i64>>());
        // Publish order for one session is preserved.
        let payload_order: Vec<i64> = events
            .iter()
            .map(|e| {
                serde_json::from_str::<serde_json::Value>(&e.data_json).unwrap()["i"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        assert_eq!(payload_order, (0..50).collect::<Vec<i64>>());
    }
}

#[test]
fn branch_and_worktree_uniqueness_is_enforced() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("state.db")).unwrap();

    let first = session("dup", "/tmp/repo");
    store.insert_session(&first).unwrap();

    // Same branch in the same repo is refused.
    let mut same_branch = session("dup2", "/tmp/repo");
    same_branch.branch_name = first.branch_name.clone();
    assert!(matches!(
        store.insert_session(&same_branch).unwrap_err(),
        StoreError::Conflict(_)
    ));

    // Same branch name in a different repo is fine.
    let mut other_repo = session("dup3", "/tmp/other");
    other_repo.branch_name = first.branch_name.clone();
    store.insert_session(&other_repo).unwrap();

    // Same worktree path is refused everywhere.
    let mut same_worktree = session("dup4", "/tmp/third");
    same_worktree.worktree_path = first.worktree_path.clone();
    assert!(matches!(
        store.insert_session(&same_worktree).unwrap_err(),
        StoreError::Conflict(_)
    ));
}

#[test]
fn summary_tracks_multiple_iterations() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("state.db")).unwrap();
    let s = session("multi", "/tmp/repo");
    store.insert_session(&s).unwrap();
    store
        .update_session_status(&s.id, SessionStatus::Idle, None)
        .unwrap();

    for i in 0..3 {
        let mut iteration = session_core::Iteration::begin(&s.id);
        store.insert_iteration(&iteration).unwrap();
        iteration.ended_at = Some(Utc::now());
        iteration.files_changed = 2;
        iteration.lines_added = 5;
        iteration.lines_deleted = 1;
        iteration.token_usage = TokenUsage {
            prompt: 10 * (i + 1),
            completion: 5,
            total: 10 * (i + 1) + 5,
        };
        store.finalize_iteration(&iteration).unwrap();
    }

    let summary = store.session_summary(&s.id).unwrap();
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.files_changed, 6);
    assert_eq!(summary.lines_added, 15);
    assert_eq!(summary.total_tokens, 15 + 25 + 35);
}
