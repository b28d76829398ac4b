// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stasis daemon
//!
//! Command-line entry point for the stasis checkpoint/restore daemon core.

use clap::{Parser, Subcommand};

mod commands;
mod metrics;

/// stasisd - checkpoint/restore daemon with GPU controller pooling
#[derive(Parser)]
#[command(name = "stasisd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stasis/stasis.yaml")]
    pub config: String,

    /// Log filter, overriding the configured level
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Daemon,

    /// Spawn a throwaway GPU controller and report its health
    GpuCheck,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Configuration is loaded before logging so its level applies
    let config = match cli.command {
        Commands::Validate { .. } => None,
        _ => Some(stasis_core::ConfigLoader::load_file(&cli.config)?),
    };

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.daemon.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match (cli.command, config) {
        (Commands::Daemon, Some(config)) => commands::daemon::execute(config).await,
        (Commands::GpuCheck, Some(config)) => commands::gpu_check::execute(config).await,
        (Commands::Validate { file }, _) => commands::validate::execute(&file).await,
        (_, None) => Err("configuration was not loaded".into()),
    }
}
