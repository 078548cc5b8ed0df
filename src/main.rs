//! Fenceline main entry point
//!
//! Runs the scheduler, validator, and worker loops of the indexing engine, or a
//! one-shot operator command against the same databases.

use anyhow::{Context, Result};
use clap::Parser;
use fenceline::checkpoint::{CheckpointLedger, FileCheckpointStore};
use fenceline::config::{load_config_with_hash, Config};
use fenceline::control::Control;
use fenceline::coordination::{CoordinationCache, SqliteCache};
use fenceline::fence::FenceManager;
use fenceline::output::{load_statistics, print_statistics};
use fenceline::queue::{SqliteTaskQueue, TaskQueue};
use fenceline::scheduler::RunScheduler;
use fenceline::storage::{open_shared, SharedStorage};
use fenceline::validator::RunValidator;
use fenceline::worker::IndexingWorker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// How often an idle worker polls the queue
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fenceline: incremental document indexing with fenced runs
///
/// Keeps configured sources indexed. Schedulers start runs, workers crawl them
/// with resumable checkpoints, and validators reconcile runs whose workers died.
#[derive(Parser, Debug)]
#[command(name = "fenceline")]
#[command(version = "0.1.0")]
#[command(about = "Incremental document indexing with fenced runs", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Run the scheduler loop
    #[arg(long)]
    scheduler: bool,

    /// Run the validator loop
    #[arg(long)]
    validator: bool,

    /// Run the worker loop
    #[arg(long)]
    worker: bool,

    /// Show an attempt's status and exit
    #[arg(long, value_name = "ATTEMPT_ID", conflicts_with_all = ["cancel", "trigger", "stats"])]
    status: Option<i64>,

    /// Request a cooperative stop of an attempt and exit
    #[arg(long, value_name = "ATTEMPT_ID", conflicts_with_all = ["status", "trigger", "stats"])]
    cancel: Option<i64>,

    /// Set the manual indexing trigger on a source and exit
    #[arg(long, value_name = "SOURCE", conflicts_with_all = ["status", "cancel", "stats"])]
    trigger: Option<String>,

    /// With --trigger, reindex the source from the beginning
    #[arg(long, requires = "trigger")]
    reindex: bool,

    /// Show attempt statistics from the database and exit
    #[arg(long, conflicts_with_all = ["status", "cancel", "trigger"])]
    stats: bool,
}

/// Handles shared by every loop of one process
struct Services {
    config: Config,
    storage: SharedStorage,
    queue: Arc<SqliteTaskQueue>,
    fences: FenceManager,
    ledger: Arc<CheckpointLedger>,
}

impl Services {
    fn open(config: Config) -> Result<Self> {
        let storage = open_shared(Path::new(&config.storage.database_path))
            .with_context(|| format!("opening database {}", config.storage.database_path))?;
        let cache: Arc<dyn CoordinationCache> = Arc::new(
            SqliteCache::open(Path::new(&config.coordination.cache_path))
                .with_context(|| format!("opening cache {}", config.coordination.cache_path))?,
        );
        let queue = Arc::new(
            SqliteTaskQueue::open(Path::new(&config.queue.database_path))
                .with_context(|| format!("opening task queue {}", config.queue.database_path))?,
        );
        let store = FileCheckpointStore::new(&config.storage.checkpoint_dir)
            .with_context(|| format!("opening checkpoint dir {}", config.storage.checkpoint_dir))?;

        let fences = FenceManager::new(cache, config.coordination.liveness_ttl());
        let ledger = Arc::new(CheckpointLedger::new(
            Arc::new(store),
            storage.clone(),
            config.storage.checkpoint_size_limit,
        ));

        Ok(Self {
            config,
            storage,
            queue,
            fences,
            ledger,
        })
    }

    fn control(&self) -> Control {
        Control::new(self.storage.clone(), self.fences.clone())
    }

    fn scheduler(&self) -> RunScheduler {
        RunScheduler::new(
            self.storage.clone(),
            self.fences.clone(),
            self.queue.clone() as Arc<dyn TaskQueue>,
        )
        .with_config(self.config.scheduler.clone())
        .with_queue_name(self.config.queue.name.clone())
        .with_lock_timeout(self.config.coordination.lock_timeout())
        .with_checkpoint_retention(
            self.ledger.clone(),
            self.config.storage.checkpoint_retention_days,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let services = Arc::new(Services::open(config)?);

    if cli.stats {
        return handle_stats(&services);
    }
    if let Some(attempt_id) = cli.status {
        return handle_status(&services, attempt_id);
    }
    if let Some(attempt_id) = cli.cancel {
        return handle_cancel(&services, attempt_id);
    }
    if let Some(source) = cli.trigger.as_deref() {
        return handle_trigger(&services, source, cli.reindex);
    }

    // No role selected means all of them
    let all = !(cli.scheduler || cli.validator || cli.worker);
    run_loops(
        services,
        all || cli.scheduler,
        all || cli.validator,
        all || cli.worker,
    )
    .await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else {
        match verbose {
            0 => EnvFilter::new("fenceline=info,warn"),
            1 => EnvFilter::new("fenceline=debug,info"),
            2 => EnvFilter::new("fenceline=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --stats mode: shows attempt statistics from the database
fn handle_stats(services: &Services) -> Result<()> {
    println!("Database: {}\n", services.config.storage.database_path);
    let stats = load_statistics(&*services.storage.lock()).context("loading statistics")?;
    print_statistics(&stats);
    Ok(())
}

/// Handles the --status mode: prints one attempt and its live signals
fn handle_status(services: &Services, attempt_id: i64) -> Result<()> {
    let report = services
        .control()
        .get_status(attempt_id)
        .with_context(|| format!("reading attempt {}", attempt_id))?;
    let attempt = &report.attempt;

    println!("=== Attempt {} ===\n", attempt.id);
    println!("  Source: {}", attempt.source_id);
    println!("  Generation: {}", attempt.generation_id);
    println!("  Status: {}", attempt.status);
    println!("  From beginning: {}", attempt.from_beginning);
    if let Some((start, end)) = attempt.poll_window() {
        println!("  Poll window: {} .. {}", start, end);
    }
    println!("  Documents indexed: {}", attempt.total_docs_indexed);
    println!("  Failures: {}", attempt.failure_count);
    if let Some(message) = &attempt.error_msg {
        println!("  Error: {}", message);
    }
    println!();
    println!("  Fenced: {}", report.fenced);
    println!("  Alive: {}", report.alive);
    if let Some(stage) = &report.stage {
        println!("  Stage: {}", stage);
    }
    if let Some(progress) = report.progress {
        println!("  Progress counter: {}", progress);
    }
    if report.stop_requested {
        println!("  Stop requested");
    }
    Ok(())
}

/// Handles the --cancel mode
fn handle_cancel(services: &Services, attempt_id: i64) -> Result<()> {
    if services
        .control()
        .cancel(attempt_id)
        .with_context(|| format!("canceling attempt {}", attempt_id))?
    {
        println!("✓ Stop requested for attempt {}", attempt_id);
    } else {
        println!("Attempt {} is not running; nothing to cancel", attempt_id);
    }
    Ok(())
}

/// Handles the --trigger mode
fn handle_trigger(services: &Services, source: &str, reindex: bool) -> Result<()> {
    let scheduler = services.scheduler();
    scheduler
        .sync_config(&services.config)
        .context("syncing sources from config")?;
    scheduler
        .trigger(source, reindex)
        .with_context(|| format!("triggering source {}", source))?;
    let kind = if reindex { "Reindex" } else { "Update" };
    println!("✓ {} trigger set on {}; the next scheduler pass picks it up", kind, source);
    Ok(())
}

/// Runs the selected loops until ctrl-c
async fn run_loops(
    services: Arc<Services>,
    scheduler: bool,
    validator: bool,
    worker: bool,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops: Vec<(&str, JoinHandle<Result<()>>)> = Vec::new();

    if scheduler {
        loops.push((
            "scheduler",
            tokio::spawn(scheduler_loop(services.clone(), shutdown_rx.clone())),
        ));
    }
    if validator {
        loops.push((
            "validator",
            tokio::spawn(validator_loop(services.clone(), shutdown_rx.clone())),
        ));
    }
    if worker {
        loops.push((
            "worker",
            tokio::spawn(worker_loop(services.clone(), shutdown_rx.clone())),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("Shutdown requested, waiting for in-flight work");
    let _ = shutdown_tx.send(true);

    for (role, handle) in loops {
        match handle.await {
            Ok(Ok(())) => tracing::info!("{} loop stopped", role),
            Ok(Err(e)) => tracing::error!("{} loop failed: {:#}", role, e),
            Err(e) => tracing::error!("{} loop panicked: {}", role, e),
        }
    }
    Ok(())
}

/// Runs `pass` on a blocking thread every `period` until shutdown
async fn every<F>(
    role: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    pass: Arc<F>,
) -> Result<()>
where
    F: Fn() -> fenceline::Result<()> + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        let pass = Arc::clone(&pass);
        match tokio::task::spawn_blocking(move || pass()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} pass failed: {}", role, e),
            Err(e) => return Err(e).with_context(|| format!("{} pass panicked", role)),
        }
    }
}

async fn scheduler_loop(services: Arc<Services>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let scheduler = services.scheduler();
    {
        let services = services.clone();
        let synced = tokio::task::spawn_blocking(move || {
            services.scheduler().sync_config(&services.config)
        })
        .await??;
        tracing::info!("Scheduler started with {} sources", synced);
    }

    let control = services.control();
    let ttl = services.config.coordination.heartbeat_ttl();
    let period = Duration::from_secs(services.config.scheduler.beat_interval_secs);
    every(
        "scheduler",
        period,
        shutdown,
        Arc::new(move || {
            control.write_heartbeat("scheduler", ttl)?;
            let report = scheduler.check_for_indexing()?;
            if !report.started.is_empty() {
                tracing::info!("Started attempts {:?}", report.started);
            }
            Ok(())
        }),
    )
    .await
}

async fn validator_loop(services: Arc<Services>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let validator = RunValidator::new(
        services.storage.clone(),
        services.fences.clone(),
        services.queue.clone() as Arc<dyn TaskQueue>,
        services.config.queue.name.clone(),
        services.config.coordination.lock_timeout(),
    );
    let control = services.control();
    let ttl = services.config.coordination.heartbeat_ttl();
    let period = Duration::from_secs(services.config.validator.interval_secs);
    tracing::info!("Validator started, sweeping every {:?}", period);

    every(
        "validator",
        period,
        shutdown,
        Arc::new(move || {
            control.write_heartbeat("validator", ttl)?;
            let report = validator.sweep()?;
            if report.orphans_reconciled + report.unfenced_reconciled + report.setup_resets > 0 {
                tracing::info!("Validator sweep: {:?}", report);
            } else {
                tracing::debug!("Validator sweep: {:?}", report);
            }
            Ok(())
        }),
    )
    .await
}

async fn worker_loop(services: Arc<Services>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let worker = IndexingWorker::new(
        services.storage.clone(),
        services.fences.clone(),
        services.ledger.clone(),
        services.config.worker.clone(),
        services.config.scheduler.poll_offset_minutes,
    );
    let worker_id = format!("worker-{}", std::process::id());
    let control = services.control();
    let queue = services.queue.clone();
    let queue_name = services.config.queue.name.clone();
    let ttl = services.config.coordination.heartbeat_ttl();
    let visibility = Duration::from_secs(services.config.queue.visibility_timeout_secs);
    tracing::info!("Worker {} started on queue {}", worker_id, queue_name);

    every(
        "worker",
        WORKER_POLL_INTERVAL,
        shutdown,
        Arc::new(move || {
            control.write_heartbeat("worker", ttl)?;
            let reclaimed = queue.reclaim_stale(visibility)?;
            if reclaimed > 0 {
                tracing::warn!("Returned {} stale reservations to the queue", reclaimed);
            }
            // Drain what is pending before sleeping again
            while let Some(outcome) = worker.poll_once(&queue, &queue_name, &worker_id)? {
                tracing::debug!("Task outcome: {:?}", outcome);
            }
            Ok(())
        }),
    )
    .await
}
