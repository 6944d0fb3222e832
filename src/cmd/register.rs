//! `register add/remove/list` - manage repository registrations.

use anyhow::Result;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use devcontainer_runner::config::ConfigStore;
use devcontainer_runner::dispatch::{EnvTokenProvider, TokenProvider};
use devcontainer_runner::forge::ForgeClient;

#[derive(Subcommand)]
pub enum RegisterCommand {
    /// Register a repository to poll for queued jobs
    Add {
        /// Repository owner/organization
        #[arg(long)]
        owner: String,
        /// Repository name
        #[arg(long)]
        repo: String,
        /// Comma-separated labels this runner advertises (defaults to "devcontainer-runner")
        #[arg(long)]
        labels: Option<String>,
    },
    /// Remove a registration by id
    Remove {
        /// Registration id, as printed by `register list`
        id: String,
    },
    /// List current registrations
    List,
}

pub async fn run(config_path: &str, forge_url: &str, command: RegisterCommand) -> Result<()> {
    let store = ConfigStore::load(config_path)?;

    match command {
        RegisterCommand::Add { owner, repo, labels } => {
            warn_if_not_admin(forge_url, &owner, &repo).await;

            let registration = store.add_registration(&owner, &repo, labels)?;
            println!("registered {}/{} as {}", registration.owner, registration.repo, registration.id);
        }
        RegisterCommand::Remove { id } => {
            if store.remove_registration(&id)? {
                println!("removed registration {id}");
            } else {
                println!("no registration with id {id}");
            }
        }
        RegisterCommand::List => {
            let registrations = store.list_registrations();
            if registrations.is_empty() {
                println!("no registrations");
            }
            for registration in registrations {
                println!(
                    "{}  {}/{}  labels={}  enabled={}",
                    registration.id, registration.owner, registration.repo, registration.labels, registration.enabled
                );
            }
        }
    }

    Ok(())
}

/// Best-effort preflight: warns if the token currently available to the
/// daemon lacks admin access to the repository being registered. Skipped
/// silently if no token is configured yet, since credential acquisition
/// happens outside this CLI.
async fn warn_if_not_admin(forge_url: &str, owner: &str, repo: &str) {
    let Some(token) = EnvTokenProvider::default().token().await else {
        return;
    };
    let Ok(client) = ForgeClient::new(forge_url, token) else {
        return;
    };

    let cancel = CancellationToken::new();
    if !client.check_admin_permission(owner, repo, &cancel).await {
        eprintln!("warning: token does not appear to have admin access to {owner}/{repo}");
    }
}
