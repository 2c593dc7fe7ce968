//! skysync CLI
//!
//! Command-line tools for skysync.
//!
//! # Commands
//!
//! - `tokens` - Dump a persisted change-token blob
//! - `demo` - Run an in-memory push and pull round trip

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// skysync command-line tools.
#[derive(Parser)]
#[command(name = "skysync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a persisted change-token blob
    Tokens {
        /// Path to the token blob
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run an in-memory insert, push and pull between two devices
    Demo {
        /// Number of notes to create
        #[arg(short, long, default_value = "3")]
        notes: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Tokens { file, format } => {
            commands::tokens::run(&file, &format)?;
        }
        Commands::Demo { notes, format } => {
            commands::demo::run(notes, &format)?;
        }
        Commands::Version => {
            println!("skysync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
