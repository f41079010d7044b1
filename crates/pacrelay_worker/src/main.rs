//! PAC Relay queue operations CLI.
//!
//! Operator tooling over the recovery queue: per-status counts, task
//! listings, the status summary shown on dashboards, and manual re-enqueue
//! of parked tasks. Read-and-requeue only; it never opens tasks and never
//! talks to the PAC.
//!
//! Usage:
//!     pacrelay-queue stats
//!     pacrelay-queue show 42 --notes
//!     pacrelay-queue requeue 42 --actor alice

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pacrelay_core::{
    DocumentDirectory, DocumentRef, InteractionRecord, RecoveryQueue, RecoveryTask, RelayDb,
    TaskFilter, TaskStatus, TaskType,
};
use pacrelay_logging::LogConfig;

#[derive(Parser, Debug)]
#[command(name = "pacrelay-queue", about = "Operator tooling for the PAC Relay recovery queue")]
struct Args {
    /// Database path (defaults to ~/.pacrelay/pacrelay.sqlite3)
    #[arg(long, env = "PACRELAY_DB")]
    database: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-status queue counts
    Stats,
    /// List recovery tasks
    List {
        /// Filter by status (pending, processing, completed, failed, exceeded_attempts)
        #[arg(long)]
        status: Option<String>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Only escalated tasks
        #[arg(long)]
        escalated: bool,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Operator summary for one task
    Show {
        id: i64,
        /// Also print the full processing notes
        #[arg(long)]
        notes: bool,
    },
    /// Put a failed task back in contention
    Requeue {
        id: i64,
        /// Identity recorded in the task notes
        #[arg(long, env = "USER", default_value = "operator")]
        actor: String,
    },
}

/// The CLI surface never enqueues and never resolves tasks through this
/// process, so it carries a directory that knows nothing and does nothing.
struct OpsDirectory;

#[async_trait]
impl DocumentDirectory for OpsDirectory {
    async fn exists(&self, _reference: &DocumentRef) -> bool {
        false
    }

    async fn on_interaction_complete(&self, _record: &InteractionRecord) {}

    async fn on_task_resolved(&self, _task: &RecoveryTask) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    pacrelay_logging::init_logging(LogConfig {
        app_name: "pacrelay-queue",
        verbose: args.verbose,
    })?;

    let path = args
        .database
        .unwrap_or_else(pacrelay_logging::default_db_path);
    let db = RelayDb::open_existing(&path)
        .await
        .with_context(|| format!("Failed to open relay database at {}", path.display()))?;
    let queue = RecoveryQueue::new(db, Arc::new(OpsDirectory));

    match args.command {
        Command::Stats => {
            let stats = queue.stats().await?;
            println!("pending:            {}", stats.pending);
            println!("processing:         {}", stats.processing);
            println!("completed:          {}", stats.completed);
            println!("failed:             {}", stats.failed);
            println!("exceeded_attempts:  {}", stats.exceeded_attempts);
        }
        Command::List {
            status,
            task_type,
            escalated,
            limit,
        } => {
            let status = match status {
                Some(s) => Some(parse_status(&s)?),
                None => None,
            };
            let task_type = match task_type {
                Some(t) => Some(parse_type(&t)?),
                None => None,
            };
            let tasks = queue
                .list(TaskFilter {
                    status,
                    task_type,
                    escalated_only: escalated,
                    limit: Some(limit),
                })
                .await?;

            for task in tasks {
                println!(
                    "{:>6}  {:<18} {:<24} {:<18} {}/{} {}",
                    task.id,
                    task.task_type.to_string(),
                    task.reference.to_string(),
                    task.status.to_string(),
                    task.attempts,
                    task.max_attempts,
                    if task.escalated { "ESCALATED" } else { "" }
                );
            }
        }
        Command::Show { id, notes } => {
            let summary = queue.status_summary(id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if notes {
                let task = queue.get(id).await?;
                println!("--- processing notes ---");
                print!("{}", task.processing_notes);
            }
        }
        Command::Requeue { id, actor } => {
            let task = queue.requeue(id, &actor).await?;
            println!(
                "task {} re-enqueued, eligible at {}",
                task.id, task.scheduled_time
            );
        }
    }

    Ok(())
}

fn parse_status(s: &str) -> anyhow::Result<TaskStatus> {
    match TaskStatus::parse(s) {
        Some(status) => Ok(status),
        None => bail!("unknown status: {}", s),
    }
}

fn parse_type(s: &str) -> anyhow::Result<TaskType> {
    match TaskType::parse(s) {
        Some(task_type) => Ok(task_type),
        None => bail!("unknown task type: {}", s),
    }
}
