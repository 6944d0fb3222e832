//! Main daemon command - loads configuration, starts the dispatch loop, and
//! waits for a shutdown signal.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devcontainer_runner::config::ConfigStore;
use devcontainer_runner::dispatch::{DispatchDaemon, EnvTokenProvider};

/// Run the dispatch daemon until interrupted.
pub async fn run(config_path: &str, forge_url: &str) -> Result<()> {
    info!(path = config_path, "loading configuration");
    let config = Arc::new(ConfigStore::load(config_path)?);

    info!(count = config.list_registrations().len(), "registrations loaded");

    let daemon = Arc::new(DispatchDaemon::new(
        config,
        Box::new(EnvTokenProvider::default()),
        forge_url,
    ));

    // First Ctrl+C drains: the daemon stops polling and waits for in-flight
    // workers to finish. A second Ctrl+C cancels `cancel` itself, which each
    // worker's in-flight process call observes directly and aborts from.
    let cancel = CancellationToken::new();
    let signal_daemon = daemon.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("received shutdown signal, draining in-flight jobs (press Ctrl+C again to abort)...");
        signal_daemon.request_shutdown();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received second shutdown signal, aborting in-flight jobs...");
            signal_cancel.cancel();
        }
    });

    daemon.run(&cancel).await?;

    info!("daemon stopped");
    Ok(())
}
