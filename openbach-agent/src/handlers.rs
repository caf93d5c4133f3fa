//! Maps agent commands onto [`JobManager`] operations.

use serde_json::{Value, json};
use tracing::{debug, info};

use openbach_shared::errors::OpenbachResult;
use openbach_shared::protocol::AgentCommand;

use crate::jobs::JobManager;

/// Execute one command and produce the value carried by an `OK` reply.
pub async fn handle_command(manager: &JobManager, command: AgentCommand) -> OpenbachResult<Value> {
    debug!("Handling {:?}", command);
    match command {
        AgentCommand::AddJobAgent { name } => manager.add_job(&name).map(|()| Value::Null),
        AgentCommand::DelJobAgent { name } => manager.remove_job(&name).map(|()| Value::Null),
        AgentCommand::StartJobInstanceAgent(order) => manager
            .start_instance(order, false)
            .map(|instance_id| json!({ "instance_id": instance_id })),
        AgentCommand::StopJobInstanceAgent(order) => {
            manager.stop_instance(order, false).map(|()| Value::Null)
        }
        AgentCommand::RestartJobInstanceAgent(order) => manager
            .restart_instance(order)
            .await
            .map(|instance_id| json!({ "instance_id": instance_id })),
        AgentCommand::StatusJobInstanceAgent { name, instance_id } => manager
            .status_instance(&name, instance_id)
            .map(|status| json!({ "status": status })),
        AgentCommand::StatusJobsAgent {} => Ok(json!({ "jobs": manager.job_names() })),
        AgentCommand::RestartAgent { reload } => {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.restart_agent(reload).await;
                info!("Agent restarted (reload: {})", reload);
            });
            Ok(Value::Null)
        }
        AgentCommand::CheckConnection {} => Ok(Value::Null),
    }
}
