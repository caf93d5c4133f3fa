//! Outgoing requests to agents.
//!
//! [`AgentConnector`] is the only way the director reaches an agent, so the
//! executors can be driven by an in-process fake in tests.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use openbach_shared::client::{ClientConfig, request_tcp};
use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::protocol::{AgentCommand, JobStatus, Request, StartOrder, StopOrder};

use crate::transfer::{self, PushedFile};

/// Transport to the agents of a testbed.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Send one command to the agent at `address` (`host:port`).
    async fn send(&self, address: &str, command: AgentCommand) -> OpenbachResult<Value>;

    /// Copy a local file to the host of an agent.
    async fn push_file(&self, host: &str, file: &PushedFile) -> OpenbachResult<()>;

    /// Copy a file from the host of an agent.
    async fn pull_file(&self, host: &str, remote_path: &str, local_path: &str)
    -> OpenbachResult<()>;

    async fn check_connection(&self, address: &str) -> OpenbachResult<()> {
        self.send(address, AgentCommand::CheckConnection {})
            .await
            .map(|_| ())
    }

    async fn start_job(&self, address: &str, order: StartOrder) -> OpenbachResult<i64> {
        let reply = self
            .send(address, AgentCommand::StartJobInstanceAgent(order))
            .await?;
        instance_id(&reply)
    }

    async fn stop_job(&self, address: &str, order: StopOrder) -> OpenbachResult<()> {
        self.send(address, AgentCommand::StopJobInstanceAgent(order))
            .await
            .map(|_| ())
    }

    async fn restart_job(&self, address: &str, order: StartOrder) -> OpenbachResult<i64> {
        let reply = self
            .send(address, AgentCommand::RestartJobInstanceAgent(order))
            .await?;
        instance_id(&reply)
    }

    async fn restart_agent(&self, address: &str, reload: bool) -> OpenbachResult<()> {
        self.send(address, AgentCommand::RestartAgent { reload })
            .await
            .map(|_| ())
    }

    async fn job_status(&self, address: &str, name: &str, instance_id: i64) -> OpenbachResult<JobStatus> {
        let reply = self
            .send(
                address,
                AgentCommand::StatusJobInstanceAgent {
                    name: name.to_string(),
                    instance_id,
                },
            )
            .await?;
        serde_json::from_value(reply["status"].clone()).map_err(|e| {
            OpenbachError::unprocessable(format!("Agent {} sent an invalid status: {}", address, e))
        })
    }
}

fn instance_id(reply: &Value) -> OpenbachResult<i64> {
    reply["instance_id"]
        .as_i64()
        .ok_or_else(|| OpenbachError::unprocessable("Agent reply carries no instance_id"))
}

/// Connector speaking the framed JSON protocol over TCP, and scp for files.
#[derive(Debug, Clone, Default)]
pub struct TcpAgentConnector {
    client: ClientConfig,
}

impl TcpAgentConnector {
    pub fn new(client: ClientConfig) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn send(&self, address: &str, command: AgentCommand) -> OpenbachResult<Value> {
        let request = Request::from_command(&command)?;
        debug!("Sending {} to {}", request.command_name, address);
        request_tcp(address, &request, &self.client).await
    }

    async fn push_file(&self, host: &str, file: &PushedFile) -> OpenbachResult<()> {
        transfer::push(host, file).await
    }

    async fn pull_file(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &str,
    ) -> OpenbachResult<()> {
        transfer::pull(host, remote_path, local_path).await
    }
}
