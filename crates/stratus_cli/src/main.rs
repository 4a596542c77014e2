//! Stratus CLI
//!
//! Command-line tools for a persisted Stratus sync state directory.
//!
//! # Commands
//!
//! - `inspect` - Display change tokens, identity, pending deletions and cache counts
//! - `dump-cache` - List cached record snapshots
//! - `reset-tokens` - Clear change tokens to force a full resync

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use stratus_protocol::Partition;
use tracing_subscriber::EnvFilter;

/// Stratus sync state tools.
#[derive(Parser)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the persisted sync state
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List cached record snapshots
    DumpCache {
        /// Only show records of this type
        #[arg(short = 't', long)]
        record_type: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Clear change tokens so the next download is a full resync
    ResetTokens {
        /// Partition as scope/zone, e.g. private/Main; all partitions if omitted
        #[arg(long)]
        partition: Option<Partition>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("State path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::DumpCache {
            record_type,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("State path required for dump-cache")?;
            commands::dump_cache::run(&path, record_type.as_deref(), limit, format)?;
        }
        Commands::ResetTokens { partition } => {
            let path = cli.path.ok_or("State path required for reset-tokens")?;
            commands::reset_tokens::run(&path, partition.as_ref())?;
        }
        Commands::Version => {
            println!("Stratus CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
