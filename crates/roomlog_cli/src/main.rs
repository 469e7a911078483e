//! roomlog CLI
//!
//! Command-line tools for inspecting roomlog store snapshots.
//!
//! # Commands
//!
//! - `inspect` - Display rooms, segments and islands
//! - `verify` - Check segment links and relation integrity

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// roomlog snapshot tools.
#[derive(Parser)]
#[command(name = "roomlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the snapshot file
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
    /// Display rooms, segments and islands
    Inspect {
        /// Only show this room
        #[arg(short, long)]
        room: Option<String>,

        /// Show segment details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify segment links and relations
    Verify {
        /// Only check this room
        #[arg(short, long)]
        room: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            room,
            segments,
            format,
        } => {
            let path = cli.path.ok_or("Snapshot path required for inspect")?;
            commands::inspect::run(&path, room.as_deref(), segments, &format)?;
        }
        Commands::Verify { room } => {
            let path = cli.path.ok_or("Snapshot path required for verify")?;
            commands::verify::run(&path, room.as_deref())?;
        }
        Commands::Version => {
            println!("roomlog CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
