//! Maps director commands onto [`Director`] operations.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::protocol::DirectorCommand;

use crate::director::Director;

/// Execute one command and produce the value carried by an `OK` reply.
pub async fn handle_command(director: &Director, command: DirectorCommand) -> OpenbachResult<Value> {
    debug!("Handling {:?}", command);
    match command {
        DirectorCommand::StartScenarioInstance {
            scenario_name,
            arguments,
            owner,
        } => director
            .start_scenario(&scenario_name, arguments, owner)
            .map(|id| json!({ "scenario_instance_id": id })),
        DirectorCommand::StopScenarioInstance {
            scenario_instance_id,
        } => director
            .stop_scenario(scenario_instance_id)
            .map(|()| Value::Null),
        DirectorCommand::RemoveScenarioInstance {
            scenario_instance_id,
        } => director
            .remove_scenario(scenario_instance_id)
            .map(|()| Value::Null),
        DirectorCommand::InfosScenarioInstance {
            scenario_instance_id,
        } => to_value(&director.infos(scenario_instance_id)?),
        DirectorCommand::ListScenarioInstances {} => {
            Ok(json!({ "scenario_instances": to_value(&director.list())? }))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> OpenbachResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| OpenbachError::internal(format!("Cannot encode reply: {}", e)))
}
