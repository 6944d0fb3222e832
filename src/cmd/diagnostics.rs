//! Diagnostics command - checks the container engine and workspace tool are
//! reachable, and reports named containers already discovered on the host.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use devcontainer_runner::executor::ContainerExecutor;

pub async fn run() -> Result<()> {
    println!("devcontainer-runner diagnostics");
    println!("===============================\n");

    let executor = ContainerExecutor::new();
    let cancel = CancellationToken::new();

    let (engine_ok, workspace_ok, message) = executor.check_prerequisites(&cancel).await;
    println!("  container engine: {}", if engine_ok { "ok" } else { "unavailable" });
    println!("  workspace tool:   {}", if workspace_ok { "ok" } else { "unavailable" });
    if let Some(message) = message {
        println!("  {message}");
    }

    let named = executor.discover_named_containers(&cancel).await;
    println!("\nNamed containers discovered: {}", named.len());
    for entry in named {
        println!("  {}  container={}  {}/{}", entry.name, entry.container_id, entry.owner, entry.repo);
    }

    Ok(())
}
