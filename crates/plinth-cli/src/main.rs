//! Plinth - plugin host.
//!
//! `plinth run` loads every plugin in the configured directory and supervises
//! the BACKGROUND ones until interrupted. `plinth check` reports whether the
//! libraries in a directory export the plugin entry points. The hidden
//! `plinth worker` subcommand is what the host spawns for each BACKGROUND
//! plugin.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
pub mod config_bridge;

use commands::{check, run, worker};

/// Plinth - shared-library plugin host
#[derive(Parser)]
#[command(name = "plinth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PLINTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load plugins and supervise their workers until interrupted
    Run {
        /// Exit once every worker has finished
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// Report which plugin entry points each library exports
    Check {
        /// Plugin directory (defaults to the configured one)
        dir: Option<PathBuf>,
    },

    /// Run one BACKGROUND plugin (spawned by the host)
    #[command(hide = true)]
    Worker {
        /// Name of the host's configuration store
        #[arg(long)]
        store: String,

        /// Slot holding this worker's plugin record
        #[arg(long)]
        slot: u32,

        /// Log level
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Log format
        #[arg(long, default_value = "compact")]
        log_format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers never read the config file; the host passes what they need.
    if let Commands::Worker {
        store,
        slot,
        log_level,
        log_format,
    } = &cli.command
    {
        std::process::exit(worker::run_worker(store, *slot, log_level, log_format));
    }

    let config = plinth_config::Config::load(cli.config.as_deref());

    // Set up logging from config, with --verbose override.
    let log_config = if let Ok(cfg) = &config {
        let mut lc = config_bridge::to_log_config(cfg);
        if cli.verbose {
            "debug".clone_into(&mut lc.level);
        }
        lc
    } else {
        // Fallback if config loading fails.
        let level = if cli.verbose { "debug" } else { "info" };
        plinth_telemetry::LogConfig::new(level).with_format(plinth_telemetry::LogFormat::Compact)
    };
    let log_handle = match plinth_telemetry::setup_logging(&log_config) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        },
    };

    match cli.command {
        Commands::Run { exit_when_idle } => {
            run::run_host(run::RunOptions {
                config: config?,
                config_path: cli.config,
                exit_when_idle,
                log_handle,
            })?;
        },
        Commands::Check { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => config?
                    .plugins
                    .directory_path()
                    .ok_or_else(|| anyhow::anyhow!("no plugin directory given or configured"))?,
            };
            check::run_check(&dir)?;
        },
        // Handled before logging setup.
        Commands::Worker { .. } => {},
    }

    Ok(())
}
