//! Hoard CLI
//!
//! Command-line interface for inspecting and maintaining a Hoard store.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hoard_core::{Config, Engine};

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Log filter used when neither HOARD_LOG nor RUST_LOG is set
const DEFAULT_LOG_FILTER: &str = "hoard_core=info,hoard_cli=info";

#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "Hoard - quota-aware local storage engine")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show storage health and contents
    Status,
    /// Print the value stored under a key
    Get {
        /// Key to read
        key: String,
    },
    /// Store a JSON value under a key
    Set {
        /// Key to write
        key: String,
        /// JSON value (quote strings: '"dark"')
        value: String,
    },
    /// Remove a key
    #[command(alias = "remove")]
    Rm {
        /// Key to remove
        key: String,
    },
    /// Bulk-load records from a JSON lines file
    Import {
        /// Target collection (data, chunks)
        collection: String,
        /// File with one JSON record per line
        file: PathBuf,
        /// Records per transaction
        #[arg(short, long)]
        batch_size: Option<usize>,
    },
    /// Write every record of a collection as JSON lines
    Export {
        /// Collection to read (data, chunks)
        collection: String,
        /// Records read per page
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete records older than a number of days
    Evict {
        /// Collection to clean (data, chunks)
        collection: String,
        /// Age threshold in days
        #[arg(long)]
        days: u32,
    },
    /// Reclaim free space and reopen the database
    Compact,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, database_name, quota_bytes, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands don't need the engine
    if let Some(Commands::Config { command }) = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let mut engine = Engine::with_disk_host(config);
    engine.start().await.context("Failed to open storage")?;

    let result = match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => commands::status::show(&engine, &output).await,
        Commands::Get { key } => commands::kv::get(&engine, key, &output).await,
        Commands::Set { key, value } => commands::kv::set(&engine, key, value, &output).await,
        Commands::Rm { key } => commands::kv::remove(&engine, key, &output).await,
        Commands::Import {
            collection,
            file,
            batch_size,
        } => commands::transfer::import(&engine, collection, file, batch_size, &output).await,
        Commands::Export {
            collection,
            batch_size,
            output: path,
        } => commands::transfer::export(&engine, collection, batch_size, path, &output).await,
        Commands::Evict { collection, days } => {
            commands::maintenance::evict(&engine, collection, days, &output).await
        }
        Commands::Compact => commands::maintenance::compact(&engine, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    engine.shutdown().await;
    result
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Filter comes from HOARD_LOG, then RUST_LOG, then the default.
/// Logs go to `config.log_file` when set, otherwise stderr.
fn init_logging(config: &Config) {
    let filter = std::env::var("HOARD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false);

    if let Some(ref log_path) = config.log_file {
        match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(log_file) => {
                let _ = builder
                    .with_ansi(false)
                    .with_writer(Mutex::new(log_file))
                    .try_init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            }
        }
    }

    let _ = builder.with_writer(std::io::stderr).try_init();
}
