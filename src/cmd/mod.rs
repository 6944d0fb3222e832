//! CLI command handlers

use anyhow::Result;
use clap::Subcommand;

pub mod diagnostics;
pub mod register;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Manage repository registrations
    #[command(subcommand)]
    Register(register::RegisterCommand),
    /// Check that the container engine and workspace tool are reachable
    Diagnostics,
}

pub async fn dispatch(config_path: &str, forge_url: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Register(cmd) => register::run(config_path, forge_url, cmd).await,
        Commands::Diagnostics => diagnostics::run().await,
    }
}
