use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, instrument};

use openbach_controller::config::ConfigManager;
use openbach_controller::connector::TcpAgentConnector;
use openbach_controller::director::Director;
use openbach_controller::server::DirectorServer;
use openbach_shared::client::ClientConfig;

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
        "[DIRECTOR] Starting openbach-director on {}",
        app.socket.display()
    );

    let catalog = app.load_catalog()?;
    let connector = Arc::new(TcpAgentConnector::new(ClientConfig::default()));
    let director = Director::new(catalog, connector, app.director.clone());

    let server = DirectorServer::bind(&app.socket, director.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    shutdown_signal().await?;
    info!("[DIRECTOR] Shutdown requested, stopping scenario instances");
    let _ = shutdown_tx.send(true);
    director.shutdown().await;
    server_task.await??;

    info!("[DIRECTOR] Stopped");
    Ok(())
}
