//! Request and response payloads exchanged over the framed transport.
//!
//! A request is `{"command_name": ..., "command_arguments": {...}}`. Each
//! daemon owns a closed command enum; [`parse_command`] maps the raw request
//! onto it so unknown names and malformed arguments are reported separately.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::{OpenbachError, OpenbachResult};

/// Raw request as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command_name: String,
    #[serde(default)]
    pub command_arguments: Value,
}

impl Request {
    /// Build a raw request from a typed command.
    pub fn from_command<C: Serialize>(command: &C) -> OpenbachResult<Self> {
        serde_json::to_value(command)
            .and_then(serde_json::from_value)
            .map_err(|e| OpenbachError::internal(format!("Cannot encode command: {}", e)))
    }
}

/// A closed set of commands understood by one daemon.
pub trait Command: DeserializeOwned + Serialize {
    /// Every accepted `command_name`.
    const NAMES: &'static [&'static str];
}

/// Turn a raw request into a typed command.
///
/// Unknown names yield `Unknown action: <name>`; known names with bad
/// arguments yield `Bad parameters: <reason>`.
pub fn parse_command<C: Command>(request: Request) -> OpenbachResult<C> {
    if !C::NAMES.contains(&request.command_name.as_str()) {
        return Err(OpenbachError::bad_request(format!(
            "Unknown action: {}",
            request.command_name
        )));
    }

    let arguments = match request.command_arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let tagged = serde_json::json!({
        "command_name": request.command_name,
        "command_arguments": arguments,
    });
    serde_json::from_value(tagged)
        .map_err(|e| OpenbachError::bad_request(format!("Bad parameters: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Ko,
}

/// Reply to any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            result: Some(result),
            warning: None,
            error: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            result: None,
            warning: Some(message.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ko,
            result: None,
            warning: None,
            error: Some(message.into()),
        }
    }

    /// Encode a handler outcome. Warnings stay `OK`.
    pub fn from_result(result: OpenbachResult<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(OpenbachError::Warning { message }) => Self::warning(message),
            Err(other) => Self::error(other.message()),
        }
    }

    /// Decode a reply on the client side.
    ///
    /// `KO` replies become `Unprocessable`; `OK` replies carrying a warning
    /// become `Warning`.
    pub fn into_result(self) -> OpenbachResult<Value> {
        match self.status {
            ResponseStatus::Ko => Err(OpenbachError::unprocessable(
                self.error.unwrap_or_else(|| "Unspecified error".to_string()),
            )),
            ResponseStatus::Ok => match self.warning {
                Some(message) => Err(OpenbachError::warning(message)),
                None => Ok(self.result.unwrap_or(Value::Null)),
            },
        }
    }
}

/// When an agent-side order should take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDate {
    #[default]
    Now,
    /// Unix timestamp in milliseconds.
    At(u64),
}

impl Serialize for OrderDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OrderDate::Now => serializer.serialize_str("now"),
            OrderDate::At(millis) => serializer.serialize_u64(*millis),
        }
    }
}

impl<'de> Deserialize<'de> for OrderDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(OrderDate::Now),
            Some(Value::String(text)) if text == "now" => Ok(OrderDate::Now),
            Some(Value::Number(number)) => number
                .as_u64()
                .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
                .map(OrderDate::At)
                .ok_or_else(|| {
                    de::Error::custom("the date should be given as a timestamp in milliseconds")
                }),
            Some(_) => Err(de::Error::custom(
                "the date should be given as a timestamp in milliseconds",
            )),
        }
    }
}

/// Accept any JSON scalar as a command-line argument.
fn deserialize_arguments<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    values
        .into_iter()
        .map(|value| match value {
            Value::String(text) => Ok(text),
            Value::Number(number) => Ok(number.to_string()),
            Value::Bool(flag) => Ok(flag.to_string()),
            other => Err(de::Error::custom(format!(
                "job arguments must be scalars, got {}",
                other
            ))),
        })
        .collect()
}

/// Start (or restart) a job instance on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOrder {
    pub name: String,
    /// Negative ids ask the agent to pick one.
    pub instance_id: i64,
    #[serde(default)]
    pub scenario_id: u64,
    #[serde(default)]
    pub owner_id: u64,
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub date: OrderDate,
    /// Repeat period in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOrder {
    pub name: String,
    pub instance_id: i64,
    #[serde(default)]
    pub date: OrderDate,
}

fn default_reload() -> bool {
    true
}

/// Commands served by the agent job scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "command_name",
    content = "command_arguments",
    rename_all = "snake_case"
)]
pub enum AgentCommand {
    AddJobAgent {
        name: String,
    },
    DelJobAgent {
        name: String,
    },
    StartJobInstanceAgent(StartOrder),
    StopJobInstanceAgent(StopOrder),
    RestartJobInstanceAgent(StartOrder),
    StatusJobInstanceAgent {
        name: String,
        instance_id: i64,
    },
    StatusJobsAgent {},
    RestartAgent {
        #[serde(default = "default_reload")]
        reload: bool,
    },
    CheckConnection {},
}

impl Command for AgentCommand {
    const NAMES: &'static [&'static str] = &[
        "add_job_agent",
        "del_job_agent",
        "start_job_instance_agent",
        "stop_job_instance_agent",
        "restart_job_instance_agent",
        "status_job_instance_agent",
        "status_jobs_agent",
        "restart_agent",
        "check_connection",
    ];
}

/// Commands served by the director on its local socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command_name",
    content = "command_arguments",
    rename_all = "snake_case"
)]
pub enum DirectorCommand {
    StartScenarioInstance {
        scenario_name: String,
        #[serde(default)]
        arguments: HashMap<String, Value>,
        #[serde(default)]
        owner: Option<String>,
    },
    StopScenarioInstance {
        scenario_instance_id: u64,
    },
    RemoveScenarioInstance {
        scenario_instance_id: u64,
    },
    InfosScenarioInstance {
        scenario_instance_id: u64,
    },
    ListScenarioInstances {},
}

impl Command for DirectorCommand {
    const NAMES: &'static [&'static str] = &[
        "start_scenario_instance",
        "stop_scenario_instance",
        "remove_scenario_instance",
        "infos_scenario_instance",
        "list_scenario_instances",
    ];
}

/// Status of a job instance as computed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "Not Scheduled")]
    NotScheduled,
    Scheduled,
    Running,
    Error,
    #[serde(rename = "Not Running")]
    NotRunning,
    Stopped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::NotScheduled => "Not Scheduled",
            JobStatus::Scheduled => "Scheduled",
            JobStatus::Running => "Running",
            JobStatus::Error => "Error",
            JobStatus::NotRunning => "Not Running",
            JobStatus::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}
