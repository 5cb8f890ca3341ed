//! CLI interface for feedback-coordinator

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::coordinator::Coordinator;
use crate::daemon::Daemon;
use crate::types::TimeRange;

#[derive(Parser)]
#[command(name = "feedback-coordinator")]
#[command(about = "Collect feedback metrics, score dimensions and fire debounced actions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the cycle scheduler
    Serve {
        /// Config file (default: platform config directory)
        #[arg(short, long, env = "FEEDBACK_COORDINATOR_CONFIG")]
        config: Option<PathBuf>,
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Serve the API without running scheduled cycles
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run a single cycle against an observation snapshot and print the report
    Cycle {
        /// Observation snapshot written by the service
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Config file (default: platform config directory)
        #[arg(short, long, env = "FEEDBACK_COORDINATOR_CONFIG")]
        config: Option<PathBuf>,
        /// Window start (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Window end (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Dimension to evaluate; repeat for several, omit for all
        #[arg(short, long = "dimension")]
        dimensions: Vec<String>,
    },
    /// Inspect or create the configuration file
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
        /// Check dimensions, triggers and actions for mistakes
        #[arg(long)]
        validate: bool,
        /// Config file (default: platform config directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            no_scheduler,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if no_scheduler {
                config.scheduler.enabled = false;
            }

            let mut daemon = Daemon::new(config).await?;
            daemon.run().await?;
        }
        Commands::Cycle {
            snapshot,
            config,
            from,
            to,
            dimensions,
        } => {
            let config = load_config(config.as_ref())?;
            let window = TimeRange::new(from, to)?;

            let coordinator = Coordinator::from_config(&config).await?;
            coordinator.store().load(&snapshot).await?;

            let report = if dimensions.is_empty() {
                coordinator.run_cycle_all(window).await?
            } else {
                coordinator.run_cycle(dimensions.as_slice(), window).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config {
            show,
            init,
            validate,
            path,
        } => {
            let path = match path {
                Some(path) => path,
                None => config::config_path()?,
            };

            if init {
                if path.exists() {
                    println!("Config already exists at {}", path.display());
                } else {
                    Config::default().save_to(&path)?;
                    println!("Wrote default config to {}", path.display());
                }
            } else if validate {
                let config = Config::load_from(&path)?;
                config
                    .validate()
                    .with_context(|| format!("{} is not valid", path.display()))?;
                println!(
                    "{} is valid: {} dimensions, {} triggers, {} actions",
                    path.display(),
                    config.dimensions.len(),
                    config.triggers.len(),
                    config.actions.len()
                );
            } else if show {
                let config = Config::load_from(&path)?;
                println!("# {}", path.display());
                println!(
                    "{}",
                    toml::to_string_pretty(&config).context("Failed to serialize config")?
                );
            } else {
                println!("Configuration options:");
                println!("  --init        Write a default config file");
                println!("  --validate    Check the config for mistakes");
                println!("  --show        Display the current configuration");
                println!("  --path <p>    Use a config file other than {}", path.display());
            }
        }
    }

    Ok(())
}
