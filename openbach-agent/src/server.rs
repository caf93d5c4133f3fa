//! TCP front end of the agent: one framed request and one framed reply per
//! connection.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use openbach_shared::codec::{read_json, write_json};
use openbach_shared::errors::{OpenbachError, TransportError};
use openbach_shared::protocol::{AgentCommand, Request, Response, parse_command};

use crate::handlers::handle_command;
use crate::jobs::JobManager;

/// Accept loop serving [`AgentCommand`]s.
pub struct AgentServer {
    listener: TcpListener,
    manager: JobManager,
}

impl AgentServer {
    pub async fn bind(address: SocketAddr, manager: JobManager) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Cannot listen on {}", address))?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("[AGENT] Listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = self.manager.clone();
                        tokio::spawn(async move {
                            serve_connection(manager, stream, peer).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[AGENT] Server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[instrument(skip(manager, stream))]
async fn serve_connection(manager: JobManager, mut stream: TcpStream, peer: SocketAddr) {
    let response = match read_json::<_, Request>(&mut stream).await {
        Ok(request) => {
            debug!("Request {} from {}", request.command_name, peer);
            match parse_command::<AgentCommand>(request) {
                Ok(command) => Response::from_result(handle_command(&manager, command).await),
                Err(e) => Response::from_result(Err(e)),
            }
        }
        Err(TransportError::Json(e)) => {
            Response::from_result(Err(OpenbachError::bad_request(format!(
                "Bad request: {}",
                e
            ))))
        }
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer, e);
            return;
        }
    };

    if let Some(message) = &response.error {
        warn!("Request from {} failed: {}", peer, message);
    }
    if let Err(e) = write_json(&mut stream, &response).await {
        warn!("Cannot reply to {}: {}", peer, e);
    }
}
