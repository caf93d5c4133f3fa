//! Scenario definitions and the status vocabulary of their instances.
//!
//! A scenario is a set of OpenBACH functions, each gated by wait conditions
//! on other functions of the same scenario and carrying a failure policy.
//! Function actions are kept as raw JSON in the definition so placeholders
//! (`$name`) can be resolved against instance parameters before they are
//! decoded into a typed [`FunctionAction`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Function identifier, unique within a scenario.
pub type FunctionId = u32;

/// Default wait between two attempts of a retried function, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 5.0;

/// Reusable, parameterized scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Values available to every placeholder, overridden by instance arguments.
    #[serde(default)]
    pub constants: HashMap<String, Value>,
    /// Accepted instance arguments, with their description.
    #[serde(default)]
    pub arguments: HashMap<String, String>,
    #[serde(default)]
    pub openbach_functions: Vec<FunctionDefinition>,
}

impl ScenarioDefinition {
    pub fn function(&self, id: FunctionId) -> Option<&FunctionDefinition> {
        self.openbach_functions.iter().find(|f| f.id == id)
    }
}

/// One step of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: FunctionId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub wait: WaitSpec,
    #[serde(default)]
    pub on_fail: FailurePolicySpec,
    /// Exactly one entry: the action name and its (unresolved) arguments.
    #[serde(flatten)]
    pub action: Map<String, Value>,
}

impl FunctionDefinition {
    /// Name of the action this function performs.
    pub fn action_name(&self) -> Option<&str> {
        self.action.keys().next().map(String::as_str)
    }

    /// Human readable name for logs.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.id),
            None => format!("{} ({})", self.action_name().unwrap_or("?"), self.id),
        }
    }
}

/// Kinds of dependency edge between two functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Running,
    Ended,
    Launched,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    /// Delay in seconds before the action runs, once dependencies cleared.
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub running_ids: Vec<FunctionId>,
    #[serde(default)]
    pub ended_ids: Vec<FunctionId>,
    #[serde(default)]
    pub launched_ids: Vec<FunctionId>,
    #[serde(default)]
    pub finished_ids: Vec<FunctionId>,
}

impl WaitSpec {
    /// Every dependency edge, tagged with its kind.
    pub fn conditions(&self) -> impl Iterator<Item = (WaitKind, FunctionId)> + '_ {
        tagged(WaitKind::Running, &self.running_ids)
            .chain(tagged(WaitKind::Ended, &self.ended_ids))
            .chain(tagged(WaitKind::Launched, &self.launched_ids))
            .chain(tagged(WaitKind::Finished, &self.finished_ids))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.time.max(0.0))
    }
}

fn tagged(kind: WaitKind, ids: &[FunctionId]) -> impl Iterator<Item = (WaitKind, FunctionId)> + '_ {
    ids.iter().map(move |id| (kind, *id))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    #[serde(alias = "ignore")]
    Ignore,
    #[default]
    #[serde(alias = "fail")]
    Fail,
    #[serde(alias = "retry")]
    Retry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicySpec {
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Seconds to wait before a retry.
    #[serde(default)]
    pub delay: Option<f64>,
    /// Maximum number of retries; absent means unbounded.
    #[serde(default)]
    pub retry: Option<u32>,
}

impl FailurePolicySpec {
    /// Retry budget of a first attempt. `None` means unbounded.
    pub fn initial_retries(&self) -> Option<u32> {
        match self.policy {
            FailurePolicy::Ignore | FailurePolicy::Fail => Some(0),
            FailurePolicy::Retry => self.retry,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay.unwrap_or(DEFAULT_RETRY_DELAY_SECS).max(0.0))
    }

    /// How long a job may stay unreachable before it is given up.
    /// `None` means it is polled until it answers.
    pub fn unreachable_budget(&self) -> Option<Duration> {
        match self.policy {
            FailurePolicy::Retry => self
                .retry
                .map(|retries| self.retry_delay().saturating_mul(retries)),
            FailurePolicy::Ignore | FailurePolicy::Fail => Some(Duration::ZERO),
        }
    }
}

/// Names of the actions a function may carry.
pub const FUNCTION_ACTIONS: &[&str] = &[
    "start_job_instance",
    "stop_job_instances",
    "restart_job_instance",
    "start_scenario_instance",
    "stop_scenario_instance",
    "status_job_instance",
    "restart_agent",
    "push_file",
    "pull_file",
];

/// A function action with every placeholder resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionAction {
    StartJobInstance {
        entity_name: String,
        job_name: String,
        #[serde(default)]
        arguments: Vec<Value>,
        /// Seconds between dispatch and the actual start on the agent.
        #[serde(default)]
        offset: Option<f64>,
        /// Repeat period in seconds.
        #[serde(default)]
        interval: Option<u64>,
    },
    StopJobInstances {
        openbach_function_ids: Vec<FunctionId>,
    },
    RestartJobInstance {
        openbach_function_id: FunctionId,
        #[serde(default)]
        arguments: Vec<Value>,
        #[serde(default)]
        interval: Option<u64>,
    },
    StartScenarioInstance {
        scenario_name: String,
        #[serde(default)]
        arguments: HashMap<String, Value>,
    },
    StopScenarioInstance {
        openbach_function_id: FunctionId,
    },
    /// Refresh the status of the job started by another function.
    StatusJobInstance {
        openbach_function_id: FunctionId,
    },
    /// Stop every instance on an agent, optionally replaying its recovery records.
    RestartAgent {
        entity_name: String,
        #[serde(default = "default_reload")]
        reload: bool,
    },
    PushFile {
        entity_name: String,
        local_path: Vec<String>,
        remote_path: Vec<String>,
        #[serde(default)]
        users: Vec<String>,
        #[serde(default)]
        groups: Vec<String>,
        #[serde(default)]
        removes: Vec<bool>,
    },
    PullFile {
        entity_name: String,
        remote_path: String,
        local_path: String,
    },
}

fn default_reload() -> bool {
    true
}

/// Status of a scenario instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioStatus {
    Scheduling,
    Running,
    #[serde(rename = "Agents Unreachable")]
    AgentsUnreachable,
    #[serde(rename = "Finished OK")]
    FinishedOk,
    #[serde(rename = "Finished KO")]
    FinishedKo,
    Stopped,
}

impl ScenarioStatus {
    pub fn is_ended(self) -> bool {
        !matches!(self, ScenarioStatus::Scheduling | ScenarioStatus::Running)
    }
}

/// Status of one attempt of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionStatus {
    Scheduled,
    Running,
    Stopped,
    Finished,
    Error,
    Retried,
}

impl FunctionStatus {
    /// `Scheduled` or `Running`.
    pub fn is_unfinished(self) -> bool {
        matches!(self, FunctionStatus::Scheduled | FunctionStatus::Running)
    }
}

/// Status of a job instance as tracked by the director.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobInstanceStatus {
    Scheduled,
    Running,
    #[serde(rename = "Not Running")]
    NotRunning,
    Stopped,
    Error,
    #[serde(rename = "Agent Unreachable")]
    AgentUnreachable,
    #[serde(rename = "Not Scheduled")]
    NotScheduled,
    Unknown,
}

impl JobInstanceStatus {
    /// Statuses after which the agent no longer runs anything for the instance.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobInstanceStatus::NotRunning
                | JobInstanceStatus::Stopped
                | JobInstanceStatus::Error
                | JobInstanceStatus::NotScheduled
                | JobInstanceStatus::Unknown
        )
    }

    /// Terminal statuses that count as a failure of the owning function.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            JobInstanceStatus::Error
                | JobInstanceStatus::AgentUnreachable
                | JobInstanceStatus::NotScheduled
                | JobInstanceStatus::Unknown
        )
    }
}

impl From<crate::protocol::JobStatus> for JobInstanceStatus {
    fn from(status: crate::protocol::JobStatus) -> Self {
        use crate::protocol::JobStatus;
        match status {
            JobStatus::NotScheduled => JobInstanceStatus::NotScheduled,
            JobStatus::Scheduled => JobInstanceStatus::Scheduled,
            JobStatus::Running => JobInstanceStatus::Running,
            JobStatus::Error => JobInstanceStatus::Error,
            JobStatus::NotRunning => JobInstanceStatus::NotRunning,
            JobStatus::Stopped => JobInstanceStatus::Stopped,
        }
    }
}

macro_rules! display_as_serde {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match serde_json::to_value(self) {
                        Ok(Value::String(label)) => f.write_str(&label),
                        _ => write!(f, "{:?}", self),
                    }
                }
            }
        )*
    };
}

display_as_serde!(ScenarioStatus, FunctionStatus, JobInstanceStatus);
