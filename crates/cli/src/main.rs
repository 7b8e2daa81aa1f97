//! Leadflow CLI - capacity-constrained work assignment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadflow_core::{AssignmentResult, CapacityRange, WorkItemId, WorkerId};
use leadflow_engine::{AssignmentEngine, AssignmentPolicy, EngineConfig, ReassignOutcome};
use leadflow_storage::SqliteStorage;
use serde::Serialize;
use tracing::debug;

#[derive(Parser)]
#[command(name = "leadflow")]
#[command(about = "Assign work items to workers by capacity range", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, global = true, env = "LEADFLOW_DB", default_value = "leadflow.db")]
    db: PathBuf,

    /// Engine config file (TOML)
    #[arg(long, global = true, env = "LEADFLOW_CONFIG", default_value = "leadflow.toml")]
    config: PathBuf,

    /// Override the configured assignment policy (greedy | rebalance)
    #[arg(long, global = true)]
    policy: Option<AssignmentPolicy>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workers
    Worker {
        #[command(subcommand)]
        action: WorkerCommand,
    },
    /// Store a work item and assign it
    Submit {
        /// Display label
        label: String,
        /// Sort key
        #[arg(allow_negative_numbers = true)]
        sort_key: f64,
    },
    /// Assign a stored work item
    Assign {
        /// Work item ID
        item: WorkItemId,
    },
    /// Move a work item to another worker
    Reassign {
        /// Work item ID
        item: WorkItemId,
        /// Target worker ID
        worker: WorkerId,
    },
    /// Mark a work item completed
    Complete {
        /// Work item ID
        item: WorkItemId,
        /// Worker holding it
        worker: WorkerId,
    },
    /// Show the assignment history of a work item
    History {
        /// Work item ID
        item: WorkItemId,
    },
    /// List workers eligible for a sort key, least loaded first
    Eligible {
        /// Sort key
        #[arg(allow_negative_numbers = true)]
        sort_key: f64,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Register a worker
    Add {
        /// Worker name
        name: String,
        /// Lowest accepted sort key
        #[arg(long, allow_negative_numbers = true)]
        min: f64,
        /// Highest accepted sort key
        #[arg(long, allow_negative_numbers = true)]
        max: f64,
    },
    /// Change a worker's capacity range
    Range {
        /// Worker ID
        id: WorkerId,
        #[arg(long, allow_negative_numbers = true)]
        min: f64,
        #[arg(long, allow_negative_numbers = true)]
        max: f64,
    },
    /// List workers with their active load
    List,
    /// List a worker's active assignments
    Items {
        /// Worker ID
        id: WorkerId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(policy) = cli.policy {
        config = config.with_policy(policy);
    }
    debug!(?config, db = %cli.db.display(), "starting");

    let storage = SqliteStorage::new_from_path(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let engine = AssignmentEngine::new(storage).with_config(config);
    let json = cli.json;

    match cli.command {
        Commands::Worker { action } => match action {
            WorkerCommand::Add { name, min, max } => {
                let range = CapacityRange::new(min, max)?;
                let worker = engine.register_worker(name, range).await?;
                emit(json, &worker, || {
                    println!("Added worker: {} - {} {}", worker.id, worker.name, worker.capacity_range)
                })?;
            }
            WorkerCommand::Range { id, min, max } => {
                let range = CapacityRange::new(min, max)?;
                let worker = engine.update_worker_range(id, range).await?;
                emit(json, &worker, || {
                    println!("Updated worker: {} - {} {}", worker.id, worker.name, worker.capacity_range)
                })?;
            }
            WorkerCommand::List => {
                let loads = engine.worker_loads().await?;
                emit(json, &loads, || {
                    println!("Workers ({})", loads.len());
                    for load in &loads {
                        println!(
                            "  {} | {} | {} active - {}",
                            load.worker.id, load.worker.capacity_range, load.active_load, load.worker.name
                        );
                    }
                })?;
            }
            WorkerCommand::Items { id } => {
                let assignments = engine.active_assignments(id).await?;
                emit(json, &assignments, || {
                    println!("Active assignments ({})", assignments.len());
                    for a in &assignments {
                        println!("  {} | since {}", a.work_item_id, a.assigned_at);
                    }
                })?;
            }
        },
        Commands::Submit { label, sort_key } => {
            let (item, result) = engine.submit(label, sort_key).await?;
            #[derive(Serialize)]
            struct Submitted<'a> {
                item: &'a leadflow_core::WorkItem,
                result: AssignmentResult,
            }
            emit(json, &Submitted { item: &item, result }, || {
                println!("Stored work item: {} - {}", item.id, item.label);
                println!("  {}", describe(result));
            })?;
        }
        Commands::Assign { item } => {
            let stored = engine.work_item(item).await?;
            let result = engine.assign(stored.id, stored.sort_key).await?;
            emit(json, &result, || println!("{}", describe(result)))?;
        }
        Commands::Reassign { item, worker } => {
            let outcome = engine.reassign(item, worker).await?;
            emit(json, &outcome, || match outcome {
                ReassignOutcome::Moved { from, to } => println!("Moved {item}: {from} -> {to}"),
                ReassignOutcome::Unchanged(w) => println!("Unchanged: {item} already with {w}"),
                ReassignOutcome::Refreshed(w) => println!("Refreshed: {item} with {w}"),
                ReassignOutcome::AutoAssigned(result) => println!("{}", describe(result)),
            })?;
        }
        Commands::Complete { item, worker } => {
            let assignment = engine.complete(item, worker).await?;
            emit(json, &assignment, || {
                println!("Completed {} by {}", assignment.work_item_id, assignment.worker_id)
            })?;
        }
        Commands::History { item } => {
            let entries = engine.history(item).await?;
            emit(json, &entries, || {
                println!("History of {} ({})", item, entries.len());
                for entry in &entries {
                    let from = entry
                        .previous_worker_id
                        .map(|w| format!("{w} -> "))
                        .unwrap_or_default();
                    println!("  {} | {} | {}{}", entry.recorded_at, entry.reason, from, entry.worker_id);
                }
            })?;
        }
        Commands::Eligible { sort_key } => {
            let eligible = engine.find_eligible(sort_key).await?;
            emit(json, &eligible, || {
                println!("Eligible workers ({})", eligible.len());
                for load in &eligible {
                    println!("  {} | {} active - {}", load.worker.id, load.active_load, load.worker.name);
                }
            })?;
        }
    }

    Ok(())
}

/// Print `value` as JSON, or run `text` for human output.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text();
    }
    Ok(())
}

fn describe(result: AssignmentResult) -> String {
    match result {
        AssignmentResult::Assigned(worker) => format!("Assigned to {worker}"),
        AssignmentResult::Unassigned => "Unassigned: no eligible worker".to_string(),
    }
}
