//! # Flowkeeper — maintenance worker for the messaging-flow engine
//!
//! Usage:
//!   flowkeeper worker                          # Run periodic jobs and the batch dispatcher
//!   flowkeeper trigger squash_flowpathcounts   # Run one job now (lock-guarded)
//!   flowkeeper locks                           # Show held locks
//!   flowkeeper queue-stats                     # Show busy queue partitions
//!   flowkeeper interrupt 42                    # Interrupt every active run of flow 42

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowkeeper_core::FlowkeeperConfig;
use flowkeeper_scheduler::backend::{BroadcastBatchArgs, SendBatchTask, StartBatchTask};
use flowkeeper_scheduler::{BatchDispatcher, BatchTask, HttpEngine, JobKind, Jobs, RunOutcome, Worker};
use flowkeeper_store::{LockStore, Store, TaskQueue};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "flowkeeper",
    version,
    about = "⏰ Flowkeeper — scheduling, locking and queuing for flow maintenance"
)]
struct Cli {
    /// Config file (default: ~/.flowkeeper/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path, overrides the config file
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic jobs, plus the batch dispatcher when an engine is configured
    Worker,
    /// Run a single job now
    Trigger {
        /// Job name, e.g. check_flows
        job: JobKind,
    },
    /// List locks currently held
    Locks,
    /// Show pending and active counts per queue partition
    QueueStats,
    /// Recompute expirations for a flow's active runs
    UpdateExpirations { flow: i64 },
    /// Interrupt every active run of a flow
    Interrupt { flow: i64 },
    /// Queue a broadcast batch send
    PushSend {
        #[arg(long)]
        org: i64,
        #[arg(long)]
        broadcast: i64,
        /// URN ids to send to
        #[arg(required = true)]
        urns: Vec<i64>,
    },
    /// Queue a flow batch start
    PushStart {
        #[arg(long)]
        org: i64,
        #[arg(long)]
        flow: i64,
        /// Contact ids to start
        #[arg(required = true)]
        contacts: Vec<i64>,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<FlowkeeperConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = FlowkeeperConfig::load_from(&expand_path(path))?;
            config.apply_env_overrides();
            config
        }
        None => FlowkeeperConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    Ok(config)
}

fn open_store(config: &FlowkeeperConfig) -> Result<Arc<Store>> {
    let path = expand_path(&config.store.path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open_with_timeout(
        &path,
        std::time::Duration::from_millis(config.store.busy_timeout_ms),
    )
    .with_context(|| format!("opening store at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "flowkeeper=debug,flowkeeper_scheduler=debug,flowkeeper_store=debug"
    } else {
        "flowkeeper=info,flowkeeper_scheduler=info,flowkeeper_store=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let store = open_store(&config)?;
    let holder = flowkeeper_scheduler::worker_name(&config);

    match cli.command {
        Command::Worker => {
            let jobs = Arc::new(Jobs::new(store.clone(), &config, &holder));
            let dispatcher = match (config.worker.dispatch, HttpEngine::from_config(&config.engine)?) {
                (true, Some(engine)) => {
                    let engine = Arc::new(engine);
                    Some(BatchDispatcher::new(
                        TaskQueue::new(store.clone()),
                        config.queues.batch.clone(),
                        engine.clone(),
                        engine,
                    ))
                }
                (true, None) => {
                    tracing::warn!("⚠️ No engine.base_url configured, batch dispatch disabled");
                    None
                }
                (false, _) => None,
            };

            println!("⏰ Flowkeeper v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database: {}", config.store.path);
            println!("   👷 Worker:   {holder}");
            println!();
            Worker::new(jobs, dispatcher, config).run().await?;
        }
        Command::Trigger { job } => {
            let jobs = Jobs::new(store, &config, &holder);
            let outcome = tokio::task::spawn_blocking(move || jobs.run(job)).await??;
            match outcome {
                RunOutcome::Completed(report) => println!("✅ {job}: {report}"),
                RunOutcome::Skipped { holder } => println!("⏭️  {job} skipped, lock held by {holder}"),
            }
        }
        Command::Locks => {
            let locks = LockStore::new(store, holder).list_active()?;
            println!("{}", serde_json::to_string_pretty(&locks)?);
        }
        Command::QueueStats => {
            let stats = TaskQueue::new(store).stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::UpdateExpirations { flow } => {
            let jobs = Jobs::new(store, &config, &holder);
            let update = jobs.expirations().update_expirations(flow)?;
            println!("✅ Updated {} run expirations for flow {flow}", update.updated);
            match update.sweep {
                RunOutcome::Completed(sweep) => println!("   🧹 Expired {} runs", sweep.expired),
                RunOutcome::Skipped { holder } => println!("   ⏭️  Sweep skipped, lock held by {holder}"),
            }
        }
        Command::Interrupt { flow } => {
            let jobs = Jobs::new(store, &config, &holder);
            let interrupted = jobs.expirations().interrupt_flow(flow)?;
            println!("✅ Interrupted {interrupted} runs of flow {flow}");
        }
        Command::PushSend { org, broadcast, urns } => {
            let task = BatchTask::Send(SendBatchTask {
                broadcast,
                kwargs: BroadcastBatchArgs {
                    urn_ids: urns,
                    extra: Default::default(),
                },
            });
            push(&store, &config, org, &task)?;
        }
        Command::PushStart { org, flow, contacts } => {
            let task = BatchTask::Start(StartBatchTask {
                flow,
                contacts,
                broadcasts: Vec::new(),
                started_flows: Vec::new(),
                start_msg: None,
                extra: serde_json::Value::Null,
                flow_start: None,
            });
            push(&store, &config, org, &task)?;
        }
    }

    Ok(())
}

fn push(store: &Arc<Store>, config: &FlowkeeperConfig, org: i64, task: &BatchTask) -> Result<()> {
    let queue = TaskQueue::new(store.clone());
    let id = queue.push(&config.queues.batch, org, task.task_type(), &task.to_payload()?)?;
    println!("📥 Queued {} #{id} for org {org} on '{}'", task.task_type(), config.queues.batch);
    Ok(())
}
