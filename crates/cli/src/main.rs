//! Homunculus CLI: the main entry point.
//!
//! Commands:
//! - `check`   Validate config, character cards and rulesets, then exit
//! - `run`     Answer mentions on the configured channels until shutdown
//! - `doctor`  Diagnose the local setup
//! - `bootstrap` Create namespace trees and starter cards for new NPCs

use clap::{Parser, Subcommand};
use homunculus_config::{AppConfig, ConfigError};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "homunculus",
    about = "Homunculus: in-character NPC replies for tabletop chat channels",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.homunculus/config.toml)
    #[arg(short, long, global = true, env = "HOMUNCULUS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration, character cards and rulesets
    Check,

    /// Start the pipeline on every allowed channel
    Run {
        /// Wire everything up, then shut down immediately
        #[arg(long)]
        once: bool,
    },

    /// Diagnose system health
    Doctor,

    /// Create memory namespaces and starter character cards (idempotent)
    Bootstrap {
        /// NPC names, e.g. `kovach eliza`
        #[arg(required = true)]
        names: Vec<String>,

        /// Runtime home to create them under (default: the config's data_home)
        #[arg(long)]
        data_home: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_required(path),
        None => AppConfig::load(),
    }
}

fn init_tracing(verbose: bool, config: Option<&AppConfig>) {
    let fallback = match (verbose, config) {
        (true, _) => "debug".to_string(),
        (false, Some(config)) => config.runtime.log_level.clone(),
        (false, None) => "info".to_string(),
    };
    let filter = if verbose {
        EnvFilter::new(fallback)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    };

    if config.is_some_and(|c| c.runtime.log_json) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_deref());
    init_tracing(cli.verbose, loaded.as_ref().ok());

    match cli.command {
        Commands::Check => {
            let code = commands::check::run(loaded).await;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Run { once } => {
            let config = loaded.map_err(|e| format!("Failed to load config: {e}"))?;
            commands::run::run(config, once).await?;
        }
        Commands::Doctor => commands::doctor::run(cli.config.as_deref(), loaded).await?,
        Commands::Bootstrap { names, data_home } => {
            let data_home = match data_home {
                Some(path) => path,
                None => {
                    loaded
                        .map_err(|e| format!("Failed to load config: {e}"))?
                        .runtime
                        .data_home
                }
            };
            let code = commands::bootstrap::run(&data_home, &names).await;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}
