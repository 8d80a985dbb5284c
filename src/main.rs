//! Sentinel Runtime
//!
//! The entry point for the security agent. Handles CLI args,
//! bootstrapping, and orchestrating the scheduler daemon + cycle runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use sentinel::agent::{spawn_cycle_runner, ContextAssembler, CycleEngine, RegenerationLoop};
use sentinel::codegen::HttpGenerator;
use sentinel::config::{
    get_config_path, load_config, resolve_path, save_config, validate_credentials, SentinelConfig,
};
use sentinel::intel::HttpRetriever;
use sentinel::monitor::HttpSignalFeed;
use sentinel::sandbox::ProcessSandbox;
use sentinel::scheduler::{
    create_scheduler_daemon, load_schedule_config, sync_schedule_to_db, SchedulerDaemonOptions,
    TaskContext,
};
use sentinel::state::Database;
use sentinel::types::{CycleTrigger, LogLevel, NotificationSource, Retriever, Sandbox, SignalFeed};

const VERSION: &str = "0.1.0";

/// Sentinel -- Autonomous Blockchain Security Agent
#[derive(Parser, Debug)]
#[command(
    name = "sentinel",
    version = VERSION,
    about = "Sentinel -- Autonomous Blockchain Security Agent",
    long_about = "Monitors on-chain and social signals, generates its own defense code, and runs it in an isolated sandbox."
)]
struct Cli {
    /// Start the sentinel daemon
    #[arg(long)]
    run: bool,

    /// Run a single agent cycle and exit
    #[arg(long)]
    once: bool,

    /// Write a default config and schedule, then exit
    #[arg(long)]
    init: bool,

    /// Show current sentinel status
    #[arg(long)]
    status: bool,
}

fn init_tracing(level: &LogLevel) {
    let filter = match level {
        LogLevel::Debug => "sentinel=debug,info",
        LogLevel::Info => "sentinel=info,warn",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

// ---- Status Command ---------------------------------------------------------

/// Display the current sentinel status.
fn show_status() -> Result<()> {
    let Some(config) = load_config() else {
        println!("Sentinel is not configured. Run: sentinel --init");
        return Ok(());
    };

    let db_path = resolve_path(&config.db_path);
    let db = Database::open(&db_path)?;
    let metric = db.get_metric_state()?;
    let cycle_state = db.get_cycle_state()?;
    let cycle_count = db.get_cycle_count()?;
    let window = db.recent_unconsumed_notifications(config.notification_window)?;
    let targets = db.get_targets()?;
    let recent = db.get_recent_cycle_records(5)?;

    println!(
        r#"
=== SENTINEL STATUS ===
Name:          {}
Network:       {}
DB Path:       {}
Model:         {}
Version:       {}
Cycle state:   {:?}
Cycles run:    {}
Targets:       {}
Pending window:{}
Security score:{:.2} ({} threats, {} quarantined, observed {})
=======================
"#,
        config.name,
        config.network,
        db_path,
        config.inference_model,
        config.version,
        cycle_state,
        cycle_count,
        targets.len(),
        window.len(),
        metric.security_score,
        metric.threats_detected,
        metric.quarantined_items,
        metric.observed_at,
    );

    if recent.is_empty() {
        println!("No cycles recorded yet.");
    } else {
        println!("Recent cycles (oldest first):");
        for record in &recent {
            println!(
                "  {}  {:?}  {} stage(s)  trigger: {}",
                record.finished_at,
                record.status,
                record.stages.len(),
                record.trigger,
            );
        }
    }
    Ok(())
}

// ---- Init Command -----------------------------------------------------------

fn init() -> Result<()> {
    let config_path = get_config_path();
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        let config = SentinelConfig::default();
        save_config(&config)?;
        println!("Wrote default config to {}", config_path.display());
        sentinel::scheduler::write_default_schedule_config(std::path::Path::new(&resolve_path(
            &config.schedule_config_path,
        )))?;
        println!("Set inferenceApiKey and your tool bindings, then run: sentinel --run");
    }
    Ok(())
}

// ---- Wiring -----------------------------------------------------------------

struct Runtime {
    config: SentinelConfig,
    db: Arc<Mutex<Database>>,
    engine: Arc<CycleEngine>,
    task_ctx_parts: (Arc<dyn SignalFeed>, Arc<dyn SignalFeed>, Arc<dyn SignalFeed>, Arc<dyn Retriever>),
}

/// Load config and build every collaborator. Fatal if required tool
/// credentials are missing; the sandbox must never start half-bound.
fn build_runtime() -> Result<Runtime> {
    let config = load_config().context(
        "No config found. Run: sentinel --init",
    )?;
    validate_credentials(&config).context("Credential validation failed")?;

    let db_path = resolve_path(&config.db_path);
    let db = Arc::new(Mutex::new(
        Database::open(&db_path).context("Failed to open state database")?,
    ));

    {
        let db = db.lock().unwrap();
        let seeded = db.seed_targets(&config.targets)?;
        if seeded > 0 {
            info!("Seeded {} monitoring targets from config", seeded);
        }
    }

    let generator = Arc::new(HttpGenerator::new(
        config.inference_api_url.clone(),
        config.inference_api_key.clone(),
        config.inference_model.clone(),
        config.max_tokens_per_request,
        Duration::from_secs(config.generation_timeout_secs),
    )?);

    let retriever: Arc<dyn Retriever> = Arc::new(HttpRetriever::new(
        config.retrieval_api_url.clone(),
        Duration::from_secs(config.retrieval_timeout_secs),
    )?);

    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(
        config.sandbox_interpreter.clone(),
        resolve_path(&config.scratch_dir),
        Duration::from_secs(config.sandbox_timeout_secs),
    ));

    let assembler = ContextAssembler::new(
        db.clone(),
        retriever.clone(),
        config.tools.clone(),
        config.notification_window,
        config.retrieval_top_k,
    );
    let regen = RegenerationLoop::new(generator, sandbox);
    let engine = Arc::new(CycleEngine::new(
        db.clone(),
        assembler,
        regen,
        config.max_attempts,
        config.failure_policy,
    ));

    let feed_timeout = Duration::from_secs(config.feed_timeout_secs);
    let market_feed: Arc<dyn SignalFeed> = Arc::new(HttpSignalFeed::new(
        config.market_feed_url.clone(),
        NotificationSource::Market,
        feed_timeout,
    )?);
    let social_feed: Arc<dyn SignalFeed> = Arc::new(HttpSignalFeed::new(
        config.social_feed_url.clone(),
        NotificationSource::Social,
        feed_timeout,
    )?);
    let wallet_feed: Arc<dyn SignalFeed> = Arc::new(HttpSignalFeed::new(
        config.wallet_feed_url.clone(),
        NotificationSource::Wallet,
        feed_timeout,
    )?);

    Ok(Runtime {
        config,
        db,
        engine,
        task_ctx_parts: (market_feed, social_feed, wallet_feed, retriever),
    })
}

// ---- Main Run ---------------------------------------------------------------

/// The main run loop: wire everything, sync the schedule, start the
/// scheduler daemon and the cycle runner, then wait for shutdown.
async fn run() -> Result<()> {
    let runtime = build_runtime()?;
    let Runtime {
        config,
        db,
        engine,
        task_ctx_parts: (market_feed, social_feed, wallet_feed, retriever),
    } = runtime;

    info!("Sentinel v{} starting on {}", VERSION, config.network);

    let schedule_path = resolve_path(&config.schedule_config_path);
    let schedule = load_schedule_config(std::path::Path::new(&schedule_path))?;
    // The YAML never carries last_run; the merged rows in the database do.
    // The daemon must run off those, or a restart fires every timer at once.
    let entries = {
        let db = db.lock().unwrap();
        sync_schedule_to_db(&schedule, &db)?;
        db.get_schedule_entries()?
    };

    let runner = spawn_cycle_runner(engine);

    let task_ctx = Arc::new(TaskContext {
        db: db.clone(),
        market_feed,
        social_feed,
        wallet_feed,
        retriever,
        cycles: runner.sender(),
        price_drop_threshold_pct: config.price_drop_threshold_pct,
        social_severity_threshold: config.social_severity_threshold,
        notification_retention_days: config.notification_retention_days,
    });

    let mut daemon = create_scheduler_daemon(SchedulerDaemonOptions {
        tick_interval_secs: schedule.tick_interval_secs,
        entries,
    });
    daemon.start(task_ctx);

    info!("Scheduler daemon started; sentinel is watching");

    shutdown_signal().await;
    info!("Shutting down gracefully...");
    daemon.stop();
    runner.shutdown().await;

    Ok(())
}

/// Run a single cycle and exit.
async fn run_once() -> Result<()> {
    let runtime = build_runtime()?;
    let record = runtime
        .engine
        .run(CycleTrigger::new("cli", "manual --once cycle"))
        .await?;
    println!(
        "Cycle {} finished: {:?} ({} stages)",
        record.id,
        record.status,
        record.stages.len()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = load_config().map(|c| c.log_level).unwrap_or(LogLevel::Info);
    init_tracing(&level);

    if cli.status {
        return show_status();
    }

    if cli.init {
        return init();
    }

    if cli.once {
        return run_once().await;
    }

    if cli.run {
        return run().await;
    }

    println!("Usage: sentinel --run | --once | --status | --init");
    Ok(())
}
