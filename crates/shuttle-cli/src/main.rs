use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use shuttle_core::dispatch::{EventHandler, HandlerError};
use shuttle_core::domain::{
    Event, Message, MessageId, MessagePriority, MessageType, NewTask, Outcome, TaskId, TaskStatus,
    WorkerId,
};
use shuttle_core::observability::init_tracing;
use shuttle_core::{
    BoardRef, ClaimFilter, CoordError, Coordinator, CoordinatorBuilder, EngineConfig, ErrorKind,
    ReaperLoop,
};

#[derive(Parser)]
#[command(name = "shuttle")]
#[command(about = "Coordinate workers over shared task boards")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Board directory (overrides the config file and SHUTTLE_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a task to the backlog
    Submit {
        title: String,
        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Lower is more urgent
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Capability a worker needs to claim it (repeatable)
        #[arg(long = "requires")]
        requires: Vec<String>,
        /// Promote straight to ready when nothing blocks it
        #[arg(long)]
        promote: bool,
    },
    /// Move a backlog task to ready
    Promote {
        #[arg(required_unless_present = "all")]
        id: Option<TaskId>,
        /// Promote every backlog task whose dependencies are complete
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Claim the most urgent ready task
    ClaimNext {
        worker: WorkerId,
        /// Capability this worker offers (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long, allow_negative_numbers = true)]
        max_priority: Option<i32>,
    },
    /// Change a working task's status, or just attach a note
    Progress {
        id: TaskId,
        /// in-progress | blocked (omit to only annotate)
        #[arg(short, long)]
        status: Option<TaskStatus>,
        #[arg(short, long, required_unless_present = "status")]
        note: Option<String>,
    },
    /// Complete or fail a working task
    Finish {
        id: TaskId,
        /// completed | failed
        outcome: Outcome,
        #[arg(short, long, default_value = "")]
        notes: String,
    },
    /// Hand a working task back to ready
    Release {
        id: TaskId,
        #[arg(short, long, default_value = "released by operator")]
        reason: String,
    },
    /// Release claims older than the liveness threshold
    Reap {
        /// Override the configured threshold
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
    /// Send a message to a worker's mailbox
    Send {
        /// Full message as JSON, instead of the flags below
        #[arg(long, conflicts_with_all = ["from", "to", "kind", "subject"])]
        raw: Option<String>,
        #[arg(long, required_unless_present = "raw")]
        from: Option<WorkerId>,
        #[arg(long, required_unless_present = "raw")]
        to: Option<WorkerId>,
        /// directive | status-update | error-report | acknowledgement |
        /// request-for-info | result | coordination-request
        #[arg(long = "type", required_unless_present = "raw")]
        kind: Option<MessageType>,
        #[arg(long, required_unless_present = "raw")]
        subject: Option<String>,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        priority: Option<MessagePriority>,
        #[arg(long)]
        reply_to: Option<MessageId>,
    },
    /// Fetch unacknowledged messages
    Poll { worker: WorkerId },
    /// Acknowledge a message
    Ack {
        worker: WorkerId,
        message_id: MessageId,
    },
    /// Board health and task counts
    Status,
    /// Rebuild a board (or a mailbox.<worker>) from backup and journal
    Repair { board: BoardRef },
    /// Let a quarantined board accept writes again
    ClearQuarantine { board: BoardRef },
    /// Print events produced by this process until Ctrl-C
    Watch {
        /// Also run the reaper
        #[arg(long)]
        reap: bool,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

/// Writes each event to stdout as one JSON line.
struct PrintHandler;

#[async_trait]
impl EventHandler for PrintHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let line = serde_json::to_string(event)?;
        println!("{line}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = err.kind();
            error!(error = %err, kind = ?kind, "command failed");
            print_json(&json!({ "error": err.to_string(), "kind": format!("{kind:?}") }));
            ExitCode::from(exit_code(kind))
        }
    }
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Conflict => 2,
        ErrorKind::Corruption => 3,
        ErrorKind::Protocol => 4,
        ErrorKind::Transient | ErrorKind::Fatal => 1,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => error!(error = %e, "cannot render output"),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, CoordError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), CoordError> {
    let config = load_config(&cli)?;
    let coordinator = Arc::new(CoordinatorBuilder::new().config(config).build().await?);
    let result = execute(&coordinator, cli.command).await;
    coordinator.shutdown().await;
    result
}

async fn execute(coordinator: &Arc<Coordinator>, command: Command) -> Result<(), CoordError> {
    match command {
        Command::Submit {
            title,
            id,
            description,
            priority,
            depends_on,
            requires,
            promote,
        } => {
            let mut new = NewTask::new(title)
                .with_description(description)
                .with_priority(priority);
            new.id = id;
            for dep in depends_on {
                new = new.depends_on(dep);
            }
            for capability in requires {
                new = new.requires(capability);
            }
            let task = coordinator.submit_task(new).await?;
            if promote && task.dependencies.is_empty() {
                print_json(&coordinator.promote(&task.id).await?);
            } else {
                print_json(&task);
            }
        }
        Command::Promote { id, all } => {
            if all {
                print_json(&json!({ "promoted": coordinator.promote_unblocked().await? }));
            } else if let Some(id) = id {
                print_json(&coordinator.promote(&id).await?);
            }
        }
        Command::ClaimNext {
            worker,
            capabilities,
            max_priority,
        } => {
            let filter = ClaimFilter {
                capabilities: capabilities.into_iter().collect(),
                max_priority,
            };
            print_json(&coordinator.claim_next(&worker, &filter).await?);
        }
        Command::Progress { id, status, note } => {
            let task = match status {
                Some(status) => {
                    coordinator
                        .report_progress(&id, status, note.as_deref())
                        .await?
                }
                None => {
                    coordinator
                        .annotate(&id, note.as_deref().unwrap_or_default())
                        .await?
                }
            };
            print_json(&task);
        }
        Command::Finish { id, outcome, notes } => {
            print_json(&coordinator.finish(&id, outcome, &notes).await?);
        }
        Command::Release { id, reason } => {
            print_json(&coordinator.release(&id, &reason).await?);
        }
        Command::Reap { threshold_secs } => {
            let released = coordinator
                .reclaim_stale(threshold_secs.map(Duration::from_secs))
                .await?;
            print_json(&json!({ "released": released }));
        }
        Command::Send {
            raw,
            from,
            to,
            kind,
            subject,
            body,
            priority,
            reply_to,
        } => {
            let message_id = match raw {
                Some(raw) => coordinator.send_raw_message(&raw).await?,
                None => {
                    let missing = |flag: &str| CoordError::MalformedMessage(format!("missing --{flag}"));
                    let mut message = Message::new(
                        from.ok_or_else(|| missing("from"))?,
                        to.ok_or_else(|| missing("to"))?,
                        kind.ok_or_else(|| missing("type"))?,
                        subject.ok_or_else(|| missing("subject"))?,
                        body,
                    );
                    if let Some(priority) = priority {
                        message = message.with_priority(priority);
                    }
                    if let Some(original) = reply_to {
                        message = message.in_reply_to(original);
                    }
                    coordinator.send_message(message).await?
                }
            };
            print_json(&json!({ "message_id": message_id }));
        }
        Command::Poll { worker } => {
            print_json(&coordinator.poll_mailbox(&worker).await?);
        }
        Command::Ack { worker, message_id } => {
            print_json(&coordinator.ack_message(&worker, message_id).await?);
        }
        Command::Status => {
            print_json(&coordinator.status().await?);
        }
        Command::Repair { board } => {
            print_json(&coordinator.repair(&board).await?);
        }
        Command::ClearQuarantine { board } => {
            coordinator.clear_quarantine(&board).await?;
            print_json(&json!({ "board": board.to_string(), "quarantine_cleared": true }));
        }
        Command::Watch { reap, interval_ms } => {
            coordinator.subscribe_all(Arc::new(PrintHandler));
            let reaper = reap.then(|| {
                let interval = interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| coordinator.config().reaper_interval());
                ReaperLoop::spawn_with(
                    Arc::clone(coordinator),
                    interval,
                    coordinator.config().liveness_threshold(),
                )
            });
            info!(reap, "watching events, Ctrl-C to stop");
            tokio::signal::ctrl_c().await.map_err(|source| CoordError::Storage {
                board: "signal".to_string(),
                source,
            })?;
            if let Some(reaper) = reaper {
                reaper.shutdown_and_join().await;
            }
        }
    }
    Ok(())
}
