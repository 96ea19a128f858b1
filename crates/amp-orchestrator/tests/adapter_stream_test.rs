//! Adapter integration tests against a scripted fake agent.

mod common;

use std::time::{Duration, Instant};

use amp_orchestrator::{AgentEvent, AgentEventKind, AmpAdapter, RunRequest};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{amp_config, write_fake_agent};

fn request(worktree: &std::path::Path) -> RunRequest {
    RunRequest {
        worktree: worktree.to_path_buf(),
        prompt: "do the task".into(),
        thread_id: None,
        model_override: None,
        timeout: None,
    }
}

async fn run_collecting(
    adapter: &AmpAdapter,
    request: &RunRequest,
) -> (
    amp_orchestrator::AdapterResult<amp_orchestrator::RunOutcome>,
    Vec<AgentEvent>,
) {
    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let result = adapter.run_iteration(request, tx, &cancel).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

#[tokio::test]
async fn multiline_and_concatenated_json_parse_in_order() {
    let dir = tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        r#"
printf 'prose\n'
printf '{\n  "type": "system",\n  "session_id": "T-1"\n}\n'
printf '{"type":"usage","prompt":10,"completion":5,"total":15}\n'
"#,
    );
    let adapter = AmpAdapter::new(amp_config(&agent));

    let (result, events) = run_collecting(&adapter, &request(dir.path())).await;
    let outcome = result.unwrap();

    assert_eq!(
        events[0].kind,
        AgentEventKind::SystemInit {
            thread_id: Some("T-1".into())
        }
    );
    let AgentEventKind::TokenUsage { usage, .. } = &events[1].kind else {
        panic!("expected usage event, got {:?}", events[1].kind);
    };
    assert_eq!(usage.total, 15);
    assert_eq!(outcome.thread_id.as_deref(), Some("T-1"));
    assert_eq!(outcome.usage.total, 15);
}

#[tokio::test]
async fn thread_not_found_triggers_fresh_respawn() {
    let dir = tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        r#"
for a in "$@"; do
  if [ "$a" = "continue" ]; then
    printf '{"type":"error","message":"Thread not found"}\n'
    sleep 5
    exit 1
  fi
done
printf '{"type":"system","session_id":"T-new"}\n'
printf '{"type":"result","exit_code":0}\n'
"#,
    );
    let adapter = AmpAdapter::new(amp_config(&agent));

    let mut req = request(dir.path());
    req.thread_id = Some("T-old".into());
    let started = Instant::now();
    let (result, events) = run_collecting(&adapter, &req).await;
    let outcome = result.unwrap();

    // Old process was terminated rather than waited out.
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(outcome.thread_fallback);
    assert_eq!(outcome.thread_id.as_deref(), Some("T-new"));
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, AgentEventKind::SystemInit { thread_id } if thread_id.as_deref() == Some("T-new"))));
}

#[tokio::test]
async fn tool_pairing_produces_durations_and_orphans() {
    let dir = tempdir().unwrap();
    let agent = write_fake_agent(
        dir.path(),
        r#"
printf '{"type":"system","session_id":"T-1"}\n'
printf '{"type":"tool_use","id":"t1","name":"run_tests","input":{}}\n'
sleep 0.1
printf '{"type":"tool_result","id":"t1"}\n'
printf '{"type":"tool_result","id":"ghost","is_error":true}\n'
printf '{"type":"result","exit_code":0}\n'
"#,
    );
    let adapter = AmpAdapter::new(amp_config(&agent));

    let (result, _) = run_collecting(&adapter, &request(dir.path())).await;
    let outcome = result.unwrap();

    assert_eq!(outcome.tool_calls.len(), 2);
    let paired = outcome.tool_calls.iter().find(|c| c.id == "t1").unwrap();
    assert!(!paired.orphan);
    assert!(paired.duration_ms.unwrap() >= 90);
    let ghost = outcome.tool_calls.iter().find(|c| c.id == "ghost").unwrap();
    assert!(ghost.orphan);
    assert!(!ghost.success);
}

#[tokio::test]
async fn run_times_out_and_kills_agent() {
    let dir = tempdir().unwrap();
    let agent = write_fake_agent(dir.path(), "sleep 30\n");
    let adapter = AmpAdapter::new(amp_config(&agent));

    let mut req = request(dir.path());
    req.timeout = Some(Duration::from_millis(300));
    let started = Instant::now();
    let (result, _) = run_collecting(&adapter, &req).await;

    assert!(matches!(
        result.unwrap_err(),
        amp_orchestrator::AdapterError::Timeout(_)
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cancellation_terminates_run() {
    let dir = tempdir().unwrap();
    let agent = write_fake_agent(dir.path(), "sleep 30\n");
    let adapter = AmpAdapter::new(amp_config(&agent));

    let (tx, _rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = adapter
        .run_iteration(&request(dir.path()), tx, &cancel)
        .await;
    assert!(matches!(
        result.unwrap_err(),
        amp_orchestrator::AdapterError::Cancelled(_)
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_agent_binary_is_typed() {
    let dir = tempdir().unwrap();
    let adapter = AmpAdapter::new(amp_config(std::path::Path::new(
        "/nonexistent/amp-binary-for-test",
    )));
    let (tx, _rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let err = adapter
        .run_iteration(&request(dir.path()), tx, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        amp_orchestrator::AdapterError::AgentNotFound { .. }
    ));
}
