//! silo - ingestion pipeline runtime
//!
//! # Usage
//!
//! ```bash
//! # Run every stage in one process
//! silo -c pipeline.yaml run
//!
//! # Run a single stage (independent deployment)
//! silo -c pipeline.yaml detector
//!
//! # Hand a file to the Connector
//! silo -c pipeline.yaml upload students.csv --source enrollment
//!
//! # Validate configuration
//! silo -c pipeline.yaml validate
//! ```
//!
//! A stage process attaches to its dependencies with bounded retries at
//! startup and exits non-zero when they are exhausted, so an external
//! supervisor can restart it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use silo_pipeline::config::PipelineConfig;
use silo_pipeline::health::{self, HealthState, SharedHealthState};
use silo_pipeline::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "silo")]
#[command(version, about = "Tabular ingestion pipeline for a columnar analytical store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every consuming stage in this process (default)
    Run,
    /// Run only the Detector
    Detector,
    /// Run only the Extractor
    Extractor,
    /// Run only the Transformer
    Transformer,
    /// Run only the Loader
    Loader,
    /// Hand an uploaded file to the Connector
    Upload {
        /// File to ingest
        file: PathBuf,
        /// Source name (shared across uploads of the same lineage)
        #[arg(long)]
        source: String,
    },
    /// Validate the configuration file and print the resolved layout
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_stages(config, StageSelection::All).await,
        Commands::Detector => run_stages(config, StageSelection::One("detector")).await,
        Commands::Extractor => run_stages(config, StageSelection::One("extractor")).await,
        Commands::Transformer => run_stages(config, StageSelection::One("transformer")).await,
        Commands::Loader => run_stages(config, StageSelection::One("loader")).await,
        Commands::Upload { file, source } => upload(config, file, source).await,
        Commands::Validate => validate_config(config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

enum StageSelection {
    All,
    One(&'static str),
}

impl StageSelection {
    fn includes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::One(selected) => *selected == name,
        }
    }
}

/// Attach to dependencies and run the selected consuming stages until
/// shutdown.
async fn run_stages(config: PipelineConfig, selection: StageSelection) -> Result<()> {
    info!("Starting silo pipeline");

    let config = Arc::new(config);
    let health_state: SharedHealthState = Arc::new(tokio::sync::RwLock::new(HealthState {
        started_at: Some(Instant::now()),
        ..Default::default()
    }));

    // Uniform startup contract: attach to the bus with bounded retries;
    // exhaustion propagates and the process exits non-zero.
    let bus: SharedBusClient = Arc::new(BusClient::new());
    bus.connect(&config).await?;

    let registry = Arc::new(build_registry(&config));
    let store: Arc<dyn AnalyticStore> = build_store(&config);

    {
        let mut state = health_state.write().await;
        state.bus_connected = true;
        state.registry_connected = true;
        state.store_connected = true;
    }

    if config.settings.health.enabled {
        let health_config = config.settings.health.clone();
        let health_clone = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = health::start_health_server(health_config, health_clone).await {
                error!("Health server failed: {}", e);
            }
        });
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let mut tasks = Vec::new();

    if selection.includes("detector") {
        let stage = Detector::new(
            bus.clone(),
            registry.clone(),
            config.detector.clone(),
            config.topics.resolved.clone(),
            config.topics.dead_letter.clone(),
        );
        tasks.push(spawn_runner(
            Box::new(stage),
            &config,
            &config.topics.raw,
            &config.groups.detector,
            bus.clone(),
            health_state.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    if selection.includes("extractor") {
        let stage = Extractor::new(
            bus.clone(),
            registry.clone(),
            config.extractor.clone(),
            config.topics.rows.clone(),
        );
        tasks.push(spawn_runner(
            Box::new(stage),
            &config,
            &config.topics.resolved,
            &config.groups.extractor,
            bus.clone(),
            health_state.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    if selection.includes("transformer") {
        let stage = Transformer::new(
            bus.clone(),
            registry.clone(),
            config.transformer.clone(),
            config.topics.transformed.clone(),
        );
        tasks.push(spawn_runner(
            Box::new(stage),
            &config,
            &config.topics.rows,
            &config.groups.transformer,
            bus.clone(),
            health_state.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    if selection.includes("loader") {
        let stage = Loader::new(registry.clone(), store.clone(), config.loader.clone());
        tasks.push(spawn_runner(
            Box::new(stage),
            &config,
            &config.topics.transformed,
            &config.groups.loader,
            bus.clone(),
            health_state.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    info!("Running {} stage(s)", tasks.len());

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal (Ctrl+C)");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = tokio::time::Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, futures::future::join_all(tasks)).await {
        Ok(results) => {
            let failed = results
                .iter()
                .filter(|r| matches!(r, Ok(Err(_)) | Err(_)))
                .count();
            if failed > 0 {
                warn!("{} stage(s) had errors during shutdown", failed);
            }
        }
        Err(_) => {
            warn!("Shutdown timeout reached, some stages may not have stopped cleanly");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn spawn_runner(
    stage: Box<dyn Stage>,
    config: &PipelineConfig,
    topic: &str,
    group: &str,
    bus: SharedBusClient,
    health_state: SharedHealthState,
    shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<silo_pipeline::Result<()>> {
    let name = stage.name();
    let runner = StageRunner::new(
        stage,
        bus,
        topic,
        group,
        config.topics.dead_letter.clone(),
        config.settings.clone(),
    )
    .with_health(health_state);

    info!(stage = name, topic, group, "Starting stage");
    tokio::spawn(async move {
        let result = runner.run(shutdown_rx).await;
        if let Err(e) = &result {
            if !e.is_shutdown() {
                error!(stage = name, "Stage failed: {}", e);
            }
        }
        result
    })
}

fn build_registry(config: &PipelineConfig) -> MetadataRegistry {
    match config.registry.backend {
        silo_pipeline::config::BackendKind::Memory => MetadataRegistry::in_memory(),
    }
}

fn build_store(config: &PipelineConfig) -> Arc<dyn AnalyticStore> {
    match config.store.backend {
        silo_pipeline::config::BackendKind::Memory => Arc::new(MemoryStore::new()),
    }
}

/// Drive the Connector with one file
async fn upload(config: PipelineConfig, file: PathBuf, source: String) -> Result<()> {
    let bus: SharedBusClient = Arc::new(BusClient::new());
    bus.connect(&config).await?;
    let registry = Arc::new(build_registry(&config));

    let connector = Connector::new(
        bus,
        registry,
        config.connector.clone(),
        config.topics.raw.clone(),
    );

    match connector.accept_file(&file, &source).await {
        Ok(receipt) => {
            println!("✓ Upload accepted");
            println!("  Source id: {}", receipt.source_id);
            println!("  Stored at: {}", receipt.upload_path.display());
            println!("  Sequence:  {}", receipt.sequence);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Upload rejected: {}", e);
            std::process::exit(1);
        }
    }
}

fn validate_config(config: PipelineConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Bus:");
    match &config.bus.data_dir {
        Some(dir) => println!("  Data dir: {} (durable)", dir.display()),
        None => println!("  Data dir: (in-memory)"),
    }
    println!("  Default partitions: {}", config.bus.default_partitions);
    println!();

    println!("Topics:");
    println!("  raw:         {}", config.topics.raw);
    println!("  resolved:    {}", config.topics.resolved);
    println!("  rows:        {}", config.topics.rows);
    println!("  transformed: {}", config.topics.transformed);
    println!("  dead-letter: {}", config.topics.dead_letter);
    println!();

    println!("Retry Policy:");
    println!("  Max retries: {}", config.settings.retry.max_retries);
    println!(
        "  Initial backoff: {}ms",
        config.settings.retry.initial_backoff_ms
    );
    println!("  Max backoff: {}ms", config.settings.retry.max_backoff_ms);
    println!(
        "  Startup: {} attempts, {}ms apart",
        config.settings.startup.attempts, config.settings.startup.delay_ms
    );
    println!();

    println!("Stages:");
    println!(
        "  connector   → upload dir {}",
        config.connector.upload_dir.display()
    );
    println!(
        "  detector    ← {} (sample {} rows)",
        config.topics.raw, config.detector.sample_rows
    );
    println!(
        "  extractor   ← {} (batches of {})",
        config.topics.resolved, config.extractor.batch_rows
    );
    println!(
        "  transformer ← {} ({} rule set(s))",
        config.topics.rows,
        config.transformer.rules.len()
    );
    println!(
        "  loader      ← {} (tables '{}*')",
        config.topics.transformed, config.loader.table_prefix
    );
    println!();

    if config.settings.health.enabled {
        println!(
            "Health: http://0.0.0.0:{}{}",
            config.settings.health.port, config.settings.health.path
        );
    } else {
        println!("Health: disabled");
    }

    Ok(())
}
