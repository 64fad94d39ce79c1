//! logship CLI - syslog collection daemon with durable Kafka forwarding.

use anyhow::Result;
use clap::{Parser, Subcommand};
use logship_core::config::LogFormat;
use logship_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Store error (database open, commit, recovery)
    StoreError = 2,
    /// Broker-related error (connection, producer)
    BrokerError = 3,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Convert an error to an exit code by inspecting the error message.
    fn from_error(error: &anyhow::Error) -> Self {
        let error_str = error.to_string().to_lowercase();

        if error_str.contains("config") || error_str.contains("toml") || error_str.contains("parse")
        {
            ExitCode::ConfigError
        } else if error_str.contains("store") || error_str.contains("storage") {
            ExitCode::StoreError
        } else if error_str.contains("broker") || error_str.contains("kafka") {
            ExitCode::BrokerError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;
mod sources;

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Collect syslog messages and forward them to Kafka", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collection daemon
    Serve {
        /// Print messages to stdout instead of sending to the broker
        #[arg(long)]
        test: bool,
    },

    /// Show status and health
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:9090")]
        url: String,
    },

    /// Inspect or clean the durable store (daemon must be stopped)
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceAction,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Subcommand)]
enum MaintenanceAction {
    /// Show per-table message counts
    Stats,
    /// Delete all permanently failed messages
    PurgeFailed,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Try to load config for log settings (optional - falls back to JSON)
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    // Initialize logging
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    let result = execute_command(cli).await;

    match result {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { test } => {
            let path = config_path(&cli.config);
            let config = Config::from_file(&path)?;
            commands::serve::run(config, path, test).await?;
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Maintenance { action } => {
            let config = Config::from_file(&config_path(&cli.config))?;
            match action {
                MaintenanceAction::Stats => {
                    commands::maintenance::stats(&config)?;
                }
                MaintenanceAction::PurgeFailed => {
                    commands::maintenance::purge_failed(&config)?;
                }
            }
        }

        Commands::Validate => {
            let config = Config::from_file(&config_path(&cli.config))?;
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

fn config_path(path: &Option<PathBuf>) -> PathBuf {
    path.clone().unwrap_or_else(|| PathBuf::from("logship.toml"))
}
