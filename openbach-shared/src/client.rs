//! Request client for the framed transport.
//!
//! One connection per request. Transport failures are retried with an
//! exponential backoff; a `KO` reply is final.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::codec::{read_json, write_json};
use crate::errors::{OpenbachError, OpenbachResult, TransportError, TransportResult};
use crate::protocol::{Request, Response};

/// Timeouts and retry policy for outgoing requests.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(5),
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry an operation with exponential backoff.
///
/// Only transport errors reach this loop; protocol-level refusals are
/// returned inside `Ok` by the caller's operation.
pub async fn retry_transport<F, Fut, T>(
    operation: F,
    config: &ClientConfig,
    operation_name: &str,
) -> TransportResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let mut delay = config.initial_delay;
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        operation_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}/{}: {}",
                    operation_name, attempt, attempts, err
                );
                if attempt >= attempts {
                    error!(
                        "Operation '{}' failed after {} attempts",
                        operation_name, attempts
                    );
                    return Err(err);
                }
                debug!("Retrying '{}' in {:?}", operation_name, delay);
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f32(delay.as_secs_f32() * config.backoff_multiplier);
                attempt += 1;
            }
        }
    }
}

async fn with_timeout<T, Fut>(operation: &str, limit: Duration, future: Fut) -> TransportResult<T>
where
    Fut: Future<Output = TransportResult<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation: operation.to_string(),
            millis: limit.as_millis() as u64,
        }),
    }
}

async fn exchange<S>(stream: &mut S, request: &Request, io_timeout: Duration) -> TransportResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout("sending request", io_timeout, write_json(stream, request)).await?;
    with_timeout("waiting for response", io_timeout, read_json(stream)).await
}

/// Send a request to a TCP endpoint such as `host:1112`.
pub async fn request_tcp(
    address: &str,
    request: &Request,
    config: &ClientConfig,
) -> OpenbachResult<Value> {
    let operation_name = format!("{} on {}", request.command_name, address);
    let response = retry_transport(
        move || async move {
            let mut stream = with_timeout("connecting", config.connect_timeout, async {
                TcpStream::connect(address).await.map_err(TransportError::from)
            })
            .await?;
            exchange(&mut stream, request, config.io_timeout).await
        },
        config,
        &operation_name,
    )
    .await
    .map_err(|e| OpenbachError::unreachable(format!("Cannot reach {}: {}", address, e)))?;

    response.into_result()
}

/// Send a request to a local Unix domain socket.
pub async fn request_unix(
    path: &Path,
    request: &Request,
    config: &ClientConfig,
) -> OpenbachResult<Value> {
    let operation_name = format!("{} on {}", request.command_name, path.display());
    let response = retry_transport(
        move || async move {
            let mut stream = with_timeout("connecting", config.connect_timeout, async {
                UnixStream::connect(path).await.map_err(TransportError::from)
            })
            .await?;
            exchange(&mut stream, request, config.io_timeout).await
        },
        config,
        &operation_name,
    )
    .await
    .map_err(|e| {
        OpenbachError::unreachable(format!("Cannot reach {}: {}", path.display(), e))
    })?;

    response.into_result()
}
