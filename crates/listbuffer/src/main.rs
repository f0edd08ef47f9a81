//! redis-list-buffer CLI
//!
//! Keeps a Redis in-queue and out-queue near their target depths by spilling
//! surplus input to chunk files on disk and reloading it when consumers run
//! dry.
//!
//! ```bash
//! # Run the buffer until SIGINT/SIGTERM
//! redis-list-buffer run config.yaml
//!
//! # Inspect the on-disk backlog without touching Redis
//! redis-list-buffer status config.yaml --json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use listbuffer_core::broker::RedisBroker;
use listbuffer_core::chunk_store::{self, ChunkStore, ChunkStoreConfig, StoreReport};
use listbuffer_core::config::{BufferConfig, LogFormat};
use listbuffer_core::control::{BufferEngine, EngineSettings};
use listbuffer_core::error::format_error_with_remediation;
use listbuffer_core::logging::{LogLevel, init_logging};
use listbuffer_core::shutdown::{ShutdownSignal, spawn_signal_watcher};
use listbuffer_core::{Error, VERSION};

#[derive(Parser)]
#[command(name = "redis-list-buffer", version = VERSION)]
#[command(about = "Spill Redis list overflow to disk and reload it on demand", long_about = None)]
struct Cli {
    /// Override the configured log level
    #[arg(long, global = true, env = "LISTBUFFER_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Override the configured log format (pretty or json)
    #[arg(long, global = true, env = "LISTBUFFER_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the buffer loop until a termination signal arrives
    Run {
        /// Path to the YAML (or .toml) configuration file
        config: PathBuf,
    },
    /// Report the chunk backlog on disk
    Status {
        /// Path to the YAML (or .toml) configuration file
        config: PathBuf,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { ref config } => run(config, &cli).await,
        Commands::Status { ref config, json } => status(config, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(lib_err) => eprintln!("{}", format_error_with_remediation(lib_err)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path, cli: &Cli) -> Result<BufferConfig> {
    let mut config = BufferConfig::load_from(path).map_err(Error::from)?;
    if let Some(level) = cli.log_level {
        config.log.level = level.to_string();
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    Ok(config)
}

async fn run(path: &Path, cli: &Cli) -> Result<()> {
    let config = load_config(path, cli)?;
    init_logging(&config.log).context("failed to initialize logging")?;
    info!(
        version = VERSION,
        config = %path.display(),
        host = %config.redis.host,
        "Starting redis-list-buffer"
    );

    let broker = RedisBroker::connect(config.redis.clone())
        .await
        .map_err(Error::from)?;
    let store = ChunkStore::open(&ChunkStoreConfig::from_config(&config))?;
    let mut engine = BufferEngine::new(broker, store, EngineSettings::from_config(&config))?;

    let shutdown = ShutdownSignal::new();
    let watcher = spawn_signal_watcher(shutdown.clone());
    // Stats are logged by the engine; a close failure is not a startup error.
    engine.run(&shutdown).await;
    watcher.abort();
    Ok(())
}

/// JSON shape of `status --json`.
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    index_file: &'a Path,
    data_dir: &'a Path,
    chunks: u64,
    items: u64,
    oldest_chunk: Option<String>,
    newest_chunk: Option<String>,
    consistent: bool,
    #[serde(flatten)]
    report: &'a StoreReport,
}

fn status(path: &Path, json: bool) -> Result<()> {
    let config = BufferConfig::load_from(path).map_err(Error::from)?;
    let store_config = ChunkStoreConfig::from_config(&config);
    let report = chunk_store::inspect(&store_config)?;

    let hex = |id: Option<i64>| id.map(chunk_store::ChunkId).map(|id| id.to_string());
    let view = StatusReport {
        index_file: &store_config.index_file,
        data_dir: &store_config.data_dir,
        chunks: report.summary.chunks,
        items: report.summary.items,
        oldest_chunk: hex(report.summary.oldest_id),
        newest_chunk: hex(report.summary.newest_id),
        consistent: report.is_consistent(),
        report: &report,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Index:    {}", view.index_file.display());
    println!("Data dir: {}", view.data_dir.display());
    println!("Chunks:   {}", view.chunks);
    println!("Items:    {}", view.items);
    println!("Oldest:   {}", view.oldest_chunk.as_deref().unwrap_or("-"));
    println!("Newest:   {}", view.newest_chunk.as_deref().unwrap_or("-"));
    if view.consistent {
        println!("Files:    consistent with index");
    } else {
        for file in &report.untracked_files {
            println!("Untracked chunk file: {}", file.display());
        }
        for id in &report.missing_files {
            println!(
                "Missing chunk file:   {}",
                chunk_store::chunk_file_name(*id)
            );
        }
    }
    Ok(())
}
