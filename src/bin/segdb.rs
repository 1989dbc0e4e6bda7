//! segdb admin tool
//!
//! Inspects table directories and edits size cache files offline.
//!
//! # Examples
//!
//! ```bash
//! # Summarize a table directory
//! segdb inspect data/segdb/orders
//!
//! # Print every size cache entry
//! segdb cache dump
//!
//! # Overwrite one entry
//! segdb cache set db.orders 120 6400
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use segdb::storage::table::read_manifest;
use segdb::storage::{CompositeTable, MockBackend, SizeCache, StorageBackend};
use segdb::EngineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Segmented table storage admin tool
#[derive(Parser, Debug)]
#[command(name = "segdb")]
#[command(version = segdb::VERSION)]
#[command(about = "Inspect segdb tables and size caches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "SEGDB_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "SEGDB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize a table directory
    Inspect {
        /// Table directory
        table_dir: PathBuf,
    },

    /// Size cache file operations
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print the effective configuration
    Config,

    /// Show version
    Version,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Print every entry
    Dump {
        /// Cache file (defaults to the configured one)
        file: Option<PathBuf>,
    },

    /// Set one entry and write the file back
    Set {
        /// Table identifier
        ident: String,
        /// Row count
        rows: i64,
        /// Data size in bytes
        size: i64,
        /// Cache file (defaults to the configured one)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Inspect { table_dir } => inspect_command(&config, table_dir),
        Commands::Cache { command } => cache_command(&config, command),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Version => {
            println!("segdb {}", segdb::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "segdb.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn inspect_command(config: &EngineConfig, table_dir: PathBuf) -> anyhow::Result<()> {
    let summary = read_manifest(&table_dir)
        .with_context(|| format!("reading manifest in {}", table_dir.display()))?;
    info!(table = %summary.name, "Inspecting table");

    let backend: Arc<dyn StorageBackend> = Arc::new(MockBackend::from_config(config));
    let table = CompositeTable::open(&table_dir, backend, config)
        .with_context(|| format!("opening table {}", table_dir.display()))?;

    println!("table:          {}", summary.name);
    println!("segments:       {} frozen + 1 live", summary.frozen_bases.len());
    println!("frozen bases:   {:?}", summary.frozen_bases);
    println!("live base:      {}", summary.live_base);
    println!("rows:           {}", table.num_rows());
    println!("data size:      {}", table.data_size());
    println!("total size:     {}", table.total_storage_size());
    println!("indexes:");
    for spec in &summary.schema.indexes {
        println!("  {}", serde_json::to_string(spec)?);
    }
    Ok(())
}

fn cache_command(config: &EngineConfig, command: CacheCommands) -> anyhow::Result<()> {
    match command {
        CacheCommands::Dump { file } => {
            let cache = SizeCache::new(file.unwrap_or_else(|| config.size_cache_path()));
            cache.fill_cache();
            for (ident, rows, size) in cache.entries() {
                println!("{}\t{}\t{}", ident, rows, size);
            }
            Ok(())
        }
        CacheCommands::Set {
            ident,
            rows,
            size,
            file,
        } => {
            let cache = SizeCache::new(file.unwrap_or_else(|| config.size_cache_path()));
            cache.fill_cache();
            cache.store_to_cache(&ident, rows, size);
            cache
                .sync_cache(true)
                .with_context(|| format!("writing {}", cache.path().display()))?;
            info!(ident = %ident, rows, size, "Updated size cache entry");
            Ok(())
        }
    }
}
