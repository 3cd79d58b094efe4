use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

mod config;
mod daemon;
mod routes;
mod telemetry;

use config::MediaSyncConfig;
use daemon::MediaSyncDaemon;

const DEFAULT_CONFIG_PATH: &str = "media-sync.toml";

#[derive(Parser)]
#[command(name = "media-sync-daemon")]
#[command(about = "Media library sync and acquisition daemon for the bedside alarm clock")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start,
    /// Inspect or generate configuration
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Validate configuration file
    Validate,
    /// Show effective configuration
    Show,
    /// Generate default configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let mut config = load_config(cli.config.as_deref()).await?;
            if let Some(level) = cli.log_level {
                config.telemetry.log_level = level;
            }
            run_daemon(config).await
        }
        Commands::Config { action } => match action {
            ConfigActions::Validate => validate_config(cli.config.as_deref()).await,
            ConfigActions::Show => show_config(cli.config.as_deref()).await,
            ConfigActions::Generate { output } => generate_config(output.as_deref()).await,
        },
    }
}

/// Explicit path must exist; the default path falls back to built-in defaults
async fn load_config(config_path: Option<&Path>) -> Result<MediaSyncConfig> {
    match config_path {
        Some(path) => MediaSyncConfig::load(path).await,
        None => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                MediaSyncConfig::load(path).await
            } else {
                Ok(MediaSyncConfig::default())
            }
        }
    }
}

async fn run_daemon(config: MediaSyncConfig) -> Result<()> {
    config.telemetry.validate()?;
    let _log_guard = telemetry::init_logging(&config.telemetry)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting media sync daemon");
    let daemon = MediaSyncDaemon::new(config).await?;
    daemon.run().await
}

async fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    let result = match MediaSyncConfig::load(path).await {
        Ok(config) => config.validate().map(|()| config),
        Err(e) => Err(e),
    };

    match result {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("Library root: {}", config.library.root.display());
            println!("Listening on: {}", config.socket_addr()?);
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path).await?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn generate_config(output_path: Option<&Path>) -> Result<()> {
    let config = MediaSyncConfig::default();

    if let Some(path) = output_path {
        config.save(path).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
