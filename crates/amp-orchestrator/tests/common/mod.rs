//! Shared fixtures: throwaway git repos and scripted fake agents.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use amp_orchestrator::config::AmpConfig;
use amp_orchestrator::{AmpAdapter, SessionManager};
use session_core::{EventBus, GitOps, SharedEventBus, SharedStore, Store, StoreSink};

/// Initialize a git repository with one commit on `main`.
pub fn init_repo(dir: &Path) {
    run_git(dir, &["init", "-b", "main"]);
    run_git(dir, &["config", "user.email", "test@test.com"]);
    run_git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# test repo\n").unwrap();
    run_git(dir, &["add", "."]);
    run_git(dir, &["commit", "-m", "Initial commit"]);
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Write an executable fake-agent script.
pub fn write_fake_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-amp.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

pub fn amp_config(agent_bin: &Path) -> AmpConfig {
    AmpConfig {
        bin: agent_bin.to_path_buf(),
        extra_args: Vec::new(),
        enable_jsonl: true,
        auth_cmd: None,
        token: None,
        agent_id: None,
        routing: None,
        multi_provider: false,
        iteration_timeout: Duration::from_secs(60),
    }
}

/// Store + bus (with store sink) + session manager around a fake agent.
pub fn manager(state_dir: &Path, agent_bin: &Path) -> (SharedStore, SharedEventBus, Arc<SessionManager>) {
    let store = Store::open(state_dir.join("state.db")).unwrap().shared();
    let bus = EventBus::spawn(vec![Box::new(StoreSink::new(store.clone()))]).shared();
    let adapter = AmpAdapter::new(amp_config(agent_bin));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        bus.clone(),
        GitOps::default(),
        adapter,
    ));
    (store, bus, sessions)
}

/// A fake agent that creates `X` containing `hi` and reports one tool call.
pub const HAPPY_AGENT: &str = r#"
printf 'starting up\n'
printf '{\n  "type": "system",\n  "session_id": "T-1"\n}\n'
printf 'hi\n' > X
printf '{"type":"tool_use","id":"t1","name":"create_file","input":{"path":"X"}}{"type":"tool_result","id":"t1"}\n'
printf '{"type":"usage","prompt":10,"completion":5,"total":15}\n'
printf '{"type":"result","exit_code":0}\n'
"#;
