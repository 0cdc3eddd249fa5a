// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Forklift CLI
//!
//! Command-line interface and HTTP front door of the Forklift worker.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod metrics;
mod server;

/// Forklift - serverless worker with fork-based Zygote sandboxes
#[derive(Parser)]
#[command(name = "forklift")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Worker root directory (holds config.json and the worker state)
    #[arg(short, long, default_value = "default-ol")]
    pub path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the worker root with a default configuration
    Init {
        /// Overwrite an existing config.json
        #[arg(short, long)]
        force: bool,
    },

    /// Start the worker
    Up {
        /// Run in the background, logging to worker.out
        #[arg(short, long)]
        detach: bool,
    },

    /// Stop a running worker
    Down,

    /// Check whether the worker is serving
    Status {
        /// Also print the worker's statistics
        #[arg(short, long)]
        stats: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file (defaults to <path>/config.json)
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Init { force } => commands::init::execute(&cli.path, force).await,
        Commands::Up { detach } => commands::up::execute(&cli.path, detach, cli.verbose).await,
        Commands::Down => commands::down::execute(&cli.path).await,
        Commands::Status { stats } => commands::status::execute(&cli.path, stats).await,
        Commands::Validate { file } => {
            let file = file.unwrap_or_else(|| commands::config_path(&cli.path));
            commands::validate::execute(&file).await
        }
    }
}
