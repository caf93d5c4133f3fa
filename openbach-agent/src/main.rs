use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, instrument};

use openbach_agent::config::ConfigManager;
use openbach_agent::jobs::JobManager;
use openbach_agent::server::AgentServer;

/// Resolve once SIGTERM or Ctrl-C is received.
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Load configuration from CLI and environment
    let config_manager = ConfigManager::from_cli_and_env()?;

    // Validate configuration
    config_manager.validate()?;

    // Initialize logging
    config_manager.init_logging()?;

    let app = &config_manager.app;
    info!(
        "[AGENT] Starting openbach-agent on {} (jobs: {}, instances: {})",
        app.socket_addr(),
        app.jobs_dir.display(),
        app.instances_dir.display()
    );

    let manager = JobManager::new(app.manager_config());
    manager.install_all();
    manager.recover();

    let server = AgentServer::bind(app.socket_addr(), manager.clone()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    shutdown_signal().await?;
    info!("[AGENT] Shutdown requested, stopping job instances");
    let _ = shutdown_tx.send(true);
    manager.shutdown().await;
    server_task.await??;

    info!("[AGENT] Stopped");
    Ok(())
}
