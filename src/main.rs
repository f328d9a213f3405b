//! vecmirror - WAL-mediated replication for vector database instances
//!
//! Runs the front door, the replay workers, the retention task and the
//! operator API in one process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vecmirror::api::{AppState, HttpServer};
use vecmirror::capture::CaptureFilter;
use vecmirror::cleanup::RetentionTask;
use vecmirror::config::VecMirrorConfig;
use vecmirror::db::Database;
use vecmirror::error::Result;
use vecmirror::health::HealthTracker;
use vecmirror::instance::Instances;
use vecmirror::mapping::CollectionMapper;
use vecmirror::proxy::{self, FrontDoor};
use vecmirror::replay::ReplayEngine;
use vecmirror::wal::{Instance, WriteLogStore};

/// vecmirror - WAL-mediated replication for vector database instances
#[derive(Parser)]
#[command(name = "vecmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vecmirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the front door, replay workers and operator API
    Start {
        /// Run replay workers only (no front door)
        #[arg(long)]
        replay_only: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "vecmirror.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { replay_only } => {
            let config = match VecMirrorConfig::from_file(&cli.config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load configuration from {:?}: {}", cli.config, e);
                    return Err(e);
                }
            };
            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config, replay_only).await
        }
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start every configured component and wait for ctrl-c
async fn run_start(config: VecMirrorConfig, replay_only: bool) -> Result<()> {
    tracing::info!("Starting vecmirror...");
    tracing::info!(
        "Primary: {}, replica: {}",
        config.instances.url(Instance::Primary),
        config.instances.url(Instance::Replica)
    );

    let db = match Database::open(&config.store) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("Failed to open write log at {:?}: {}", config.store.path, e);
            return Err(e);
        }
    };
    let store = Arc::new(WriteLogStore::new(Arc::clone(&db), config.replay.max_retries));
    let mapper = Arc::new(CollectionMapper::new(Arc::clone(&db)));
    let instances = Arc::new(Instances::new(&config.instances)?);
    let health = Arc::new(HealthTracker::new(config.health.failure_threshold));

    let counts = store.counts_by_status().await?;
    tracing::info!(
        "Write log opened: {} outstanding, {} failed, {} total",
        counts.outstanding(),
        counts.failed,
        counts.total
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(Arc::clone(&health).run(
        Arc::clone(&instances),
        config.health_interval(),
        shutdown_rx.clone(),
    )));

    let engine = if config.replay.enabled {
        let engine = Arc::new(ReplayEngine::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            Arc::clone(&instances),
            config.replay.clone(),
        ));
        tasks.extend(engine.spawn_workers(shutdown_rx.clone()));
        tracing::info!("Started {} replay workers", config.replay.workers);
        Some(engine)
    } else {
        tracing::warn!("Replay disabled; captured writes will accumulate");
        None
    };

    if config.cleanup.enabled {
        let retention = Arc::new(RetentionTask::new(Arc::clone(&store), config.cleanup.clone()));
        tasks.push(tokio::spawn(retention.run(config.cleanup_interval(), shutdown_rx.clone())));
    }

    let capture = if config.proxy.enabled && !replay_only {
        let capture = Arc::new(CaptureFilter::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            config.capture.clone(),
        ));
        let door = Arc::new(FrontDoor::new(Arc::clone(&instances), Arc::clone(&health), Arc::clone(&capture)));
        let bind = config.proxy.bind_address.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = proxy::serve(door, &bind, rx).await {
                tracing::error!("Front door error: {}", e);
            }
        }));
        Some(capture)
    } else {
        None
    };

    let api = HttpServer::new(
        config.api.clone(),
        AppState {
            db,
            store,
            mapper,
            health,
            engine,
            capture,
        },
    );
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = api.start(rx).await {
            tracing::error!("HTTP API error: {}", e);
        }
    }));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Task ended abnormally: {}", e);
        }
    }

    tracing::info!("vecmirror stopped");
    Ok(())
}

/// Write a configuration template
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(vecmirror::Error::Config(format!(
            "{} already exists",
            output.display()
        )));
    }
    std::fs::write(&output, VecMirrorConfig::template())?;
    tracing::info!("Configuration written to {:?}", output);
    println!("Configuration file created: {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match VecMirrorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Primary:     {}", config.instances.url(Instance::Primary));
            println!("  Replica:     {}", config.instances.url(Instance::Replica));
            println!("  Write log:   {}", config.store.path.display());
            println!("  Max retries: {}", config.replay.max_retries);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration summary
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = VecMirrorConfig::from_file(&config_path)?;

    println!("vecmirror Configuration");
    println!("=======================");
    println!();
    println!("Instances:");
    println!("  Primary:        {}", config.instances.url(Instance::Primary));
    println!("  Replica:        {}", config.instances.url(Instance::Replica));
    println!("  Tenant/DB:      {}/{}", config.instances.tenant, config.instances.database);
    println!("  Timeout:        {} ms", config.instances.request_timeout_ms);
    println!();
    println!("Write Log:");
    println!("  Path:           {}", config.store.path.display());
    println!();
    println!("Replay:");
    println!("  Enabled:        {}", config.replay.enabled);
    println!("  Workers:        {}", config.replay.workers);
    println!("  Batch Size:     {}", config.replay.batch_size);
    println!("  Concurrency:    {}", config.replay.concurrency);
    println!("  Max Retries:    {}", config.replay.max_retries);
    println!(
        "  Backoff:        {}..{} ms",
        config.replay.backoff_initial_ms, config.replay.backoff_max_ms
    );
    println!();
    println!("Retention:");
    println!("  Synced:         {} h", config.cleanup.synced_retention_hours);
    println!("  Failed:         {} h", config.cleanup.failed_retention_hours);
    println!();
    println!("Endpoints:");
    println!("  Front door:     {}", config.proxy.bind_address);
    println!("  Operator API:   {}", config.api.bind_address);

    Ok(())
}
