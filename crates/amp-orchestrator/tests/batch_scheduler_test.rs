//! Batch scheduler: happy path, abort semantics, retry policy.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use amp_orchestrator::config::OrchestratorConfig;
use amp_orchestrator::{BatchScheduler, SessionManager};
use session_core::{
    BatchItemStatus, BatchPlan, BatchStatus, EventBus, GitOps, MergeEngine, SharedEventBus,
    SharedStore, Store, StoreSink,
};
use tempfile::tempdir;

use common::{amp_config, init_repo, write_fake_agent, HAPPY_AGENT};

fn scheduler(
    state_dir: &std::path::Path,
    agent_bin: &std::path::Path,
) -> (SharedStore, SharedEventBus, Arc<BatchScheduler>) {
    let store = Store::open(state_dir.join("state.db")).unwrap().shared();
    let bus = EventBus::spawn(vec![Box::new(StoreSink::new(store.clone()))]).shared();
    let adapter = amp_orchestrator::AmpAdapter::new(amp_config(agent_bin));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        bus.clone(),
        GitOps::default(),
        adapter,
    ));
    let merge = Arc::new(MergeEngine::new(GitOps::default(), store.clone()));
    let mut config = OrchestratorConfig::default();
    config.db_path = state_dir.join("state.db");
    let scheduler = Arc::new(BatchScheduler::new(
        store.clone(),
        bus.clone(),
        sessions,
        merge,
        config,
    ));
    (store, bus, scheduler)
}

fn plan_json(repos: &[std::path::PathBuf], concurrency: u32, extra_defaults: &str) -> BatchPlan {
    let matrix: Vec<String> = repos
        .iter()
        .map(|r| format!(r#"{{"repo": "{}", "prompt": "do the task"}}"#, r.display()))
        .collect();
    let json = format!(
        r#"{{"concurrency": {concurrency}, "defaults": {{{extra_defaults}}}, "matrix": [{}]}}"#,
        matrix.join(",")
    );
    BatchPlan::from_json(&json).unwrap()
}

#[tokio::test]
async fn batch_items_run_one_iteration_each() {
    let dir = tempdir().unwrap();
    let mut repos = Vec::new();
    for i in 0..2 {
        let repo = dir.path().join(format!("repo{i}"));
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        repos.push(repo);
    }
    let agent = write_fake_agent(dir.path(), HAPPY_AGENT);
    let (store, _bus, scheduler) = scheduler(dir.path(), &agent);

    let run_id = scheduler.start(plan_json(&repos, 2, "")).unwrap();
    scheduler.wait(&run_id).await;

    let run = store.get_batch_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, BatchStatus::Completed);

    let items = store.items_for_run(&run_id).unwrap();
    assert_eq!(items.len(), 2);
    for item in &items {
        assert_eq!(item.status, BatchItemStatus::Success);
        assert_eq!(item.attempt, 1);
        assert_eq!(item.tokens_total, 15);
        // Exactly one iteration per successful item.
        let session_id = item.session_id.as_ref().unwrap();
        let iterations = store.iterations_for_session(session_id).unwrap();
        assert_eq!(iterations.len(), 1);
    }
}

#[tokio::test]
async fn abort_cancels_running_and_queued_items() {
    let dir = tempdir().unwrap();
    let mut repos = Vec::new();
    for i in 0..6 {
        let repo = dir.path().join(format!("repo{i}"));
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        repos.push(repo);
    }
    // Agent sleeps long enough that every started item is mid-flight on abort.
    let agent = write_fake_agent(
        dir.path(),
        r#"
printf '{"type":"system","session_id":"T-slow"}\n'
sleep 2
printf '{"type":"result","exit_code":0}\n'
"#,
    );
    let (store, _bus, scheduler) = scheduler(dir.path(), &agent);

    let started = Instant::now();
    let run_id = scheduler.start(plan_json(&repos, 3, "")).unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(scheduler.abort(&run_id));
    scheduler.wait(&run_id).await;

    // Within the grace window everything is terminal; nothing succeeded.
    assert!(started.elapsed() < Duration::from_secs(6));
    let items = store.items_for_run(&run_id).unwrap();
    assert_eq!(items.len(), 6);
    for item in &items {
        assert_eq!(
            item.status,
            BatchItemStatus::Aborted,
            "item {} ended as {:?}",
            item.id,
            item.status
        );
    }
    let run = store.get_batch_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, BatchStatus::Aborted);

    assert!(!scheduler.abort("no-such-run"));
}

#[tokio::test]
async fn script_failures_are_not_retried() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    let agent = write_fake_agent(dir.path(), HAPPY_AGENT);
    let (store, _bus, scheduler) = scheduler(dir.path(), &agent);

    let plan = plan_json(
        &[repo],
        1,
        r#""retries": 2, "scriptCommand": "test -f MISSING_FILE""#,
    );
    let run_id = scheduler.start(plan).unwrap();
    scheduler.wait(&run_id).await;

    let items = store.items_for_run(&run_id).unwrap();
    assert_eq!(items[0].status, BatchItemStatus::Fail);
    // One attempt only: fail is a script verdict, not a process error.
    assert_eq!(items[0].attempt, 1);
}

#[tokio::test]
async fn process_errors_retry_within_budget() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    // Fails on the first invocation, succeeds afterwards.
    let marker = dir.path().join("first-attempt-done");
    let agent = write_fake_agent(
        dir.path(),
        &format!(
            r#"
if [ ! -f "{marker}" ]; then
  touch "{marker}"
  printf '{{"type":"error","message":"model backend unavailable"}}\n'
  exit 3
fi
printf '{{"type":"system","session_id":"T-retry"}}\n'
printf '{{"type":"result","exit_code":0}}\n'
"#,
            marker = marker.display()
        ),
    );
    let (store, _bus, scheduler) = scheduler(dir.path(), &agent);

    let run_id = scheduler
        .start(plan_json(&[repo], 1, r#""retries": 1"#))
        .unwrap();
    scheduler.wait(&run_id).await;

    let items = store.items_for_run(&run_id).unwrap();
    assert_eq!(items[0].status, BatchItemStatus::Success);
    assert_eq!(items[0].attempt, 2);
}

#[tokio::test]
async fn merge_on_pass_lands_changes_on_base() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);
    let agent = write_fake_agent(dir.path(), HAPPY_AGENT);
    let (store, _bus, scheduler) = scheduler(dir.path(), &agent);

    let plan = plan_json(
        &[repo.clone()],
        1,
        r#""scriptCommand": "test -f X", "mergeOnPass": true"#,
    );
    let run_id = scheduler.start(plan).unwrap();
    scheduler.wait(&run_id).await;

    let items = store.items_for_run(&run_id).unwrap();
    assert_eq!(items[0].status, BatchItemStatus::Success);
    assert_eq!(std::fs::read_to_string(repo.join("X")).unwrap(), "hi\n");
}
