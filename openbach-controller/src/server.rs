//! Unix socket front end of the director: one framed request and one framed
//! reply per connection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use openbach_shared::codec::{read_json, write_json};
use openbach_shared::errors::{OpenbachError, TransportError};
use openbach_shared::protocol::{DirectorCommand, Request, Response, parse_command};

use crate::director::Director;
use crate::handlers::handle_command;

/// Accept loop serving [`DirectorCommand`]s.
pub struct DirectorServer {
    listener: UnixListener,
    path: PathBuf,
    director: Director,
}

impl DirectorServer {
    /// Bind `path`, replacing a socket left over by a previous run.
    pub fn bind(path: &Path, director: Director) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create socket directory {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Cannot remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Cannot listen on {}", path.display()))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            director,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` flips to `true`, then remove the socket file.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("[DIRECTOR] Listening on {}", self.path.display());
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let director = self.director.clone();
                        tokio::spawn(async move {
                            serve_connection(director, stream).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[DIRECTOR] Server shutting down");
                        if let Err(e) = std::fs::remove_file(&self.path) {
                            debug!("Cannot remove {}: {}", self.path.display(), e);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn serve_connection(director: Director, mut stream: UnixStream) {
    let response = match read_json::<_, Request>(&mut stream).await {
        Ok(request) => {
            debug!("Request {}", request.command_name);
            match parse_command::<DirectorCommand>(request) {
                Ok(command) => Response::from_result(handle_command(&director, command).await),
                Err(e) => Response::from_result(Err(e)),
            }
        }
        Err(TransportError::Json(e)) => Response::from_result(Err(OpenbachError::bad_request(
            format!("Bad request: {}", e),
        ))),
        Err(e) => {
            warn!("Dropping connection: {}", e);
            return;
        }
    };

    if let Some(message) = &response.error {
        warn!("Request failed: {}", message);
    }
    if let Err(e) = write_json(&mut stream, &response).await {
        warn!("Cannot send reply: {}", e);
    }
}
