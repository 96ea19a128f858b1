//! Keep-alive interactive agent handles
//!
//! A handle owns one long-lived agent process with stdin open. Every event
//! it emits is tagged with a stable `handle_id`, so consumers can drop
//! events from stale handles after a thread switch; a closed handle also
//! closes its event channel, which prevents ghost events outright.

use std::path::PathBuf;
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::stream::{JsonStreamParser, StreamChunk};
use super::{AdapterError, AdapterResult, AgentEvent, AgentEventKind, AmpAdapter};
use crate::config::AGENT_KILL_GRACE;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of an interactive handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Starting,
    Ready,
    Busy,
    Closed,
}

/// Event emitted by an interactive handle, tagged with its id.
#[derive(Debug, Clone)]
pub enum InteractiveEvent {
    State {
        handle_id: String,
        state: HandleState,
    },
    Streaming {
        handle_id: String,
        event: AgentEvent,
    },
    /// Interleaved non-JSON output, forwarded verbatim.
    Raw {
        handle_id: String,
        text: String,
    },
    Error {
        handle_id: String,
        message: String,
    },
}

/// A live interactive agent process.
pub struct InteractiveHandle {
    handle_id: String,
    state_rx: watch::Receiver<HandleState>,
    thread_rx: watch::Receiver<Option<String>>,
    stdin_tx: mpsc::Sender<String>,
    events_tx: broadcast::Sender<InteractiveEvent>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<Option<i32>>>>,
}

impl InteractiveHandle {
    /// Spawn the agent in keep-alive mode with stdin open.
    pub async fn start(
        adapter: &AmpAdapter,
        worktree: PathBuf,
        thread_id: Option<String>,
    ) -> AdapterResult<Self> {
        let config = adapter.config();
        let mut args = config.extra_args.clone();
        if config.enable_jsonl {
            args.push("--stream-json".to_string());
        }
        if let Some(agent_id) = &config.agent_id {
            args.push("--agent".to_string());
            args.push(agent_id.clone());
        }
        if let Some(routing) = &config.routing {
            args.push("--routing".to_string());
            args.push(routing.clone());
        }
        if config.multi_provider {
            args.push("--multi-provider".to_string());
        }
        args.push("chat".to_string());
        if let Some(thread) = &thread_id {
            args.push("--thread".to_string());
            args.push(thread.clone());
        }

        let mut child = tokio::process::Command::new(&config.bin)
            .args(&args)
            .current_dir(&worktree)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AdapterError::AgentNotFound {
                        path: config.bin.clone(),
                    }
                } else {
                    AdapterError::Io(e)
                }
            })?;

        let handle_id = Uuid::new_v4().to_string();
        let (state_tx, state_rx) = watch::channel(HandleState::Starting);
        let (thread_tx, thread_rx) = watch::channel(thread_id);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(16);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        let driver = tokio::spawn(drive_interactive(
            child,
            stdin,
            stdout,
            stdin_rx,
            state_tx,
            thread_tx,
            events_tx.clone(),
            cancel.clone(),
            handle_id.clone(),
        ));

        debug!(handle_id = %handle_id, "interactive handle started");
        Ok(Self {
            handle_id,
            state_rx,
            thread_rx,
            stdin_tx,
            events_tx,
            cancel,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn handle_id(&self) -> &str {
        &self.handle_id
    }

    pub fn state(&self) -> HandleState {
        *self.state_rx.borrow()
    }

    /// Agent-issued thread id, once `system/init` has been observed.
    pub fn thread_id(&self) -> Option<String> {
        self.thread_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InteractiveEvent> {
        self.events_tx.subscribe()
    }

    /// Write a framed user message to the agent's stdin.
    ///
    /// Fails with [`AdapterError::HandleNotReady`] unless the handle is
    /// `Ready`.
    pub async fn send(&self, text: &str) -> AdapterResult<()> {
        if self.state() != HandleState::Ready {
            return Err(AdapterError::HandleNotReady);
        }
        let frame = serde_json::json!({"type": "user", "message": text}).to_string();
        self.stdin_tx
            .send(frame)
            .await
            .map_err(|_| AdapterError::HandleNotReady)
    }

    /// Close stdin, wait for graceful exit within the grace period, then
    /// force-terminate. Returns the agent's exit code when it exited.
    pub async fn stop(&self) -> AdapterResult<Option<i32>> {
        self.cancel.cancel();
        let driver = self.driver.lock().expect("handle mutex poisoned").take();
        let Some(driver) = driver else {
            return Ok(None);
        };
        match driver.await {
            Ok(exit_code) => Ok(exit_code),
            Err(e) => {
                warn!(handle_id = %self.handle_id, error = %e, "interactive driver panicked");
                Ok(None)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_interactive(
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    mut stdout: tokio::process::ChildStdout,
    mut stdin_rx: mpsc::Receiver<String>,
    state_tx: watch::Sender<HandleState>,
    thread_tx: watch::Sender<Option<String>>,
    events_tx: broadcast::Sender<InteractiveEvent>,
    cancel: CancellationToken,
    handle_id: String,
) -> Option<i32> {
    let mut parser = JsonStreamParser::new();
    let mut decoder = super::Utf8Decoder::default();
    let mut buf = [0u8; 8192];

    let set_state = |state: HandleState| {
        let _ = state_tx.send(state);
        let _ = events_tx.send(InteractiveEvent::State {
            handle_id: handle_id.clone(),
            state,
        });
    };

    let exit_code = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Graceful: close stdin and give the agent the grace period.
                drop(stdin);
                match tokio::time::timeout(AGENT_KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => break status.code(),
                    _ => {
                        session_core::git::terminate_child(&mut child).await;
                        break None;
                    }
                }
            }
            message = stdin_rx.recv() => {
                match message {
                    Some(frame) => {
                        set_state(HandleState::Busy);
                        if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                            let _ = events_tx.send(InteractiveEvent::Error {
                                handle_id: handle_id.clone(),
                                message: format!("stdin write failed: {e}"),
                            });
                        } else {
                            let _ = stdin.write_all(b"\n").await;
                            let _ = stdin.flush().await;
                        }
                    }
                    None => {
                        // All senders gone; treat as stop.
                        cancel.cancel();
                    }
                }
            }
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let status = child.wait().await.ok();
                        break status.and_then(|s| s.code());
                    }
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        for chunk in parser.push(&text) {
                            match chunk {
                                StreamChunk::Raw(raw) => {
                                    let _ = events_tx.send(InteractiveEvent::Raw {
                                        handle_id: handle_id.clone(),
                                        text: raw,
                                    });
                                }
                                StreamChunk::Json(value) => {
                                    let event = AgentEvent::from_value(value);
                                    match &event.kind {
                                        AgentEventKind::SystemInit { thread_id } => {
                                            if thread_id.is_some() {
                                                let _ = thread_tx.send(thread_id.clone());
                                            }
                                            set_state(HandleState::Ready);
                                        }
                                        AgentEventKind::Result { .. } => {
                                            set_state(HandleState::Ready);
                                        }
                                        AgentEventKind::Error { message } => {
                                            let _ = events_tx.send(InteractiveEvent::Error {
                                                handle_id: handle_id.clone(),
                                                message: message.clone(),
                                            });
                                        }
                                        _ => {}
                                    }
                                    let _ = events_tx.send(InteractiveEvent::Streaming {
                                        handle_id: handle_id.clone(),
                                        event,
                                    });
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(handle_id = %handle_id, error = %e, "interactive stdout read failed");
                        session_core::git::terminate_child(&mut child).await;
                        break None;
                    }
                }
            }
        }
    };

    set_state(HandleState::Closed);
    debug!(handle_id = %handle_id, exit_code = ?exit_code, "interactive handle closed");
    exit_code
}
