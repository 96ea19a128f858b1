use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use amp_orchestrator::config::OrchestratorConfig;
use amp_orchestrator::session::{CreateSessionOptions, IterateOptions};
use amp_orchestrator::telemetry;
use amp_orchestrator::Controller;
use session_core::{BatchPlan, RebaseOutcome, SquashMode, SquashOutcome};

#[derive(Parser)]
#[command(name = "amp-orchestrator", about = "Worktree-isolated session orchestrator for the Amp coding agent")]
struct Cli {
    /// Optional TOML config overlay.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Session lifecycle operations.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Batch plan execution.
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Interactive chat against a session worktree.
    Chat {
        session_id: String,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create a session and run the initial iteration.
    New {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "main")]
        base: String,
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        no_auto_commit: bool,
    },
    /// Run one more iteration.
    Iterate {
        session_id: String,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List sessions, optionally for one repository.
    List {
        #[arg(long)]
        repo: Option<String>,
    },
    /// Run the preflight → squash → rebase → fast-forward pipeline.
    Merge {
        session_id: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        exclude_manual: bool,
        #[arg(long)]
        no_ff: bool,
    },
    /// Remove the worktree and branch.
    Cleanup {
        session_id: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        delete_record: bool,
    },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Execute a plan file.
    Run {
        plan: PathBuf,
        /// Block until the run finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Abort a running batch.
    Abort {
        run_id: String,
    },
    /// Export a run's items as NDJSON.
    Export {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    let config = OrchestratorConfig::load(cli.config.as_deref())?;
    let controller = Arc::new(Controller::bootstrap(config)?);

    match cli.command {
        Command::Session(cmd) => run_session_command(&controller, cmd).await?,
        Command::Batch(cmd) => run_batch_command(&controller, cmd).await?,
        Command::Chat { session_id } => run_chat(&controller, &session_id).await?,
    }

    controller.shutdown().await;
    Ok(())
}

async fn run_session_command(controller: &Arc<Controller>, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::New {
            repo,
            name,
            prompt,
            base,
            script,
            model,
            no_auto_commit,
        } => {
            let mut options = CreateSessionOptions::new(repo, name, prompt);
            options.base_branch = base;
            options.script_command = script;
            options.model_override = model;
            options.auto_commit = !no_auto_commit;
            let session = controller.create_session(options).await?;
            let summary = controller.session_summary(&session.id)?;
            println!(
                "session {} on {} ({} iteration(s), {} file(s) changed)",
                session.id, session.branch_name, summary.iterations, summary.files_changed
            );
        }
        SessionCommand::Iterate {
            session_id,
            notes,
            model,
        } => {
            let iteration = controller
                .iterate(
                    &session_id,
                    IterateOptions {
                        notes,
                        model_override: model,
                        timeout: None,
                    },
                )
                .await?;
            println!(
                "iteration {}: {} file(s), +{} -{}, test {}",
                iteration.id,
                iteration.files_changed,
                iteration.lines_added,
                iteration.lines_deleted,
                iteration.test_result.as_str()
            );
        }
        SessionCommand::List { repo } => {
            let sessions = match repo {
                Some(repo) => controller.sessions_by_repo(&repo)?,
                None => controller.list_sessions()?,
            };
            for session in sessions {
                println!(
                    "{}  {:14} {:12} {}",
                    session.id,
                    session.status.as_str(),
                    session.name,
                    session.branch_name
                );
            }
        }
        SessionCommand::Merge {
            session_id,
            message,
            exclude_manual,
            no_ff,
        } => {
            let report = controller.preflight(&session_id).await?;
            if !report.issues.is_empty() {
                for issue in &report.issues {
                    warn!(issue, "preflight");
                }
            }
            let mode = if exclude_manual {
                SquashMode::ExcludeManual
            } else {
                SquashMode::IncludeManual
            };
            match controller.squash(&session_id, &message, mode).await? {
                SquashOutcome::Done(_) => {}
                SquashOutcome::Conflict { files } => {
                    bail!("squash conflicts in: {}", files.join(", "));
                }
            }
            match controller.rebase(&session_id).await? {
                RebaseOutcome::Clean => {}
                RebaseOutcome::Conflict { files } => {
                    bail!(
                        "rebase conflicts in: {} (resolve, then `continue`, or abort)",
                        files.join(", ")
                    );
                }
            }
            controller.fast_forward(&session_id, no_ff).await?;
            println!("merged {session_id}");
        }
        SessionCommand::Cleanup {
            session_id,
            force,
            delete_record,
        } => {
            controller.cleanup(&session_id, force, delete_record).await?;
            println!("cleaned up {session_id}");
        }
    }
    Ok(())
}

async fn run_batch_command(controller: &Arc<Controller>, cmd: BatchCommand) -> Result<()> {
    match cmd {
        BatchCommand::Run { plan, wait } => {
            let plan = BatchPlan::load(&plan)
                .with_context(|| format!("loading plan {}", plan.display()))?;
            let run_id = controller.start_batch(plan)?;
            println!("run {run_id}");
            if wait {
                controller.wait_batch(&run_id).await;
                for item in controller.list_items(&run_id)? {
                    println!(
                        "{}  {:8} {} ({} tokens)",
                        item.id,
                        item.status.as_str(),
                        item.repo,
                        item.tokens_total
                    );
                }
            }
        }
        BatchCommand::Abort { run_id } => {
            if controller.abort_batch(&run_id) {
                println!("abort requested for {run_id}");
            } else {
                bail!("no running batch with id {run_id}");
            }
        }
        BatchCommand::Export { run_id } => {
            print!("{}", controller.export_run(&run_id)?);
        }
    }
    Ok(())
}

async fn run_chat(controller: &Arc<Controller>, session_id: &str) -> Result<()> {
    use amp_orchestrator::adapter::InteractiveEvent;
    use tokio::io::{AsyncBufReadExt, BufReader};

    let handle_id = controller.start_interactive(session_id).await?;
    let mut events = controller.subscribe_interactive(&handle_id)?;
    info!(handle_id = %handle_id, "chat started; /quit to exit");

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                InteractiveEvent::Streaming { event, .. } => {
                    if let amp_orchestrator::AgentEventKind::AssistantMessage { text } = &event.kind
                    {
                        println!("{text}");
                    }
                }
                InteractiveEvent::Raw { text, .. } => print!("{text}"),
                InteractiveEvent::Error { message, .. } => eprintln!("error: {message}"),
                InteractiveEvent::State { state, .. } => {
                    tracing::debug!(?state, "handle state");
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim() == "/quit" {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = controller.send_interactive(&handle_id, &line).await {
            eprintln!("send failed: {e}");
        }
    }

    controller.stop_interactive(&handle_id).await?;
    printer.abort();
    Ok(())
}
