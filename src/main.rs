//! devcontainer-runner - self-hosted runner daemon for forge CI/CD
//!
//! Polls repositories for queued workflow jobs, provisions devcontainer
//! workspaces to run them, and reports results back to the forge.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "runnerd")]
#[command(about = "Self-hosted devcontainer-based runner daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to the registration/tuning configuration document
    #[arg(short, long, default_value = "runner.json", global = true)]
    config: String,

    /// Base URL of the forge's REST API
    #[arg(long, env = "FORGE_BASE_URL", default_value = "https://forge.example.com/api/v3", global = true)]
    forge_url: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("runnerd={}", log_level).into()),
        )
        .init();

    info!("starting devcontainer-runner v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(command) => {
            if let Err(e) = cmd::dispatch(&cli.config, &cli.forge_url, command).await {
                error!("command failed: {e}");
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config, &cli.forge_url).await {
                error!("daemon error: {e}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
