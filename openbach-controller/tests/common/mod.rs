//! In-process stand-in for a fleet of agents.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use openbach_controller::catalog::{AgentEndpoint, Catalog};
use openbach_controller::connector::AgentConnector;
use openbach_controller::director::{Director, DirectorConfig};
use openbach_controller::store::ScenarioInstanceId;
use openbach_controller::transfer::PushedFile;
use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::protocol::{AgentCommand, JobStatus, StartOrder};
use openbach_shared::scenario::ScenarioStatus;
use openbach_shared::scenario_json::parse_scenario;

/// How a job behaves once started.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Runs, then exits cleanly.
    RunFor(Duration),
    /// Runs, then exits with an error.
    FailAfter(Duration),
    /// The agent refuses the start order.
    RejectStart,
    /// Runs until stopped.
    Forever,
    /// Takes a while to acknowledge the start, then runs until stopped.
    SlowStart(Duration),
}

#[derive(Debug, Clone)]
pub struct Started {
    pub address: String,
    pub order: StartOrder,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct Stopped {
    pub name: String,
    pub instance_id: i64,
}

struct Instance {
    behavior: Behavior,
    started: Instant,
    stopped: bool,
}

#[derive(Default)]
struct State {
    unreachable: HashSet<String>,
    instances: HashMap<i64, Instance>,
    starts: Vec<Started>,
    stops: Vec<Stopped>,
    connection_checks: Vec<String>,
    pushed: Vec<(String, PushedFile)>,
    restarts: Vec<(String, bool)>,
}

#[derive(Default)]
pub struct MockAgents {
    behaviors: HashMap<String, Behavior>,
    state: Mutex<State>,
}

impl MockAgents {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(name, behavior)| (name.to_string(), *behavior))
                .collect(),
            state: Mutex::new(State::default()),
        })
    }

    pub fn set_unreachable(&self, address: &str) {
        self.state.lock().unwrap().unreachable.insert(address.to_string());
    }

    pub fn starts(&self) -> Vec<Started> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn started(&self, name: &str) -> Vec<Started> {
        self.starts()
            .into_iter()
            .filter(|s| s.order.name == name)
            .collect()
    }

    pub fn stops(&self) -> Vec<Stopped> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn connection_checks(&self) -> Vec<String> {
        self.state.lock().unwrap().connection_checks.clone()
    }

    pub fn pushed(&self) -> Vec<(String, PushedFile)> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn restarts(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().restarts.clone()
    }

    fn status(&self, instance: &Instance) -> JobStatus {
        if instance.stopped {
            return JobStatus::Stopped;
        }
        let elapsed = instance.started.elapsed();
        match instance.behavior {
            Behavior::RunFor(length) if elapsed >= length => JobStatus::NotRunning,
            Behavior::FailAfter(length) if elapsed >= length => JobStatus::Error,
            _ => JobStatus::Running,
        }
    }
}

#[async_trait]
impl AgentConnector for MockAgents {
    async fn send(&self, address: &str, command: AgentCommand) -> OpenbachResult<Value> {
        if let AgentCommand::StartJobInstanceAgent(order) = &command {
            if let Some(Behavior::SlowStart(delay)) = self.behaviors.get(&order.name) {
                tokio::time::sleep(*delay).await;
            }
        }

        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(address) {
            return Err(OpenbachError::unreachable(format!(
                "Cannot connect to {}",
                address
            )));
        }

        match command {
            AgentCommand::CheckConnection {} => {
                state.connection_checks.push(address.to_string());
                Ok(Value::Null)
            }
            AgentCommand::StartJobInstanceAgent(order)
            | AgentCommand::RestartJobInstanceAgent(order) => {
                let behavior = self
                    .behaviors
                    .get(&order.name)
                    .copied()
                    .unwrap_or(Behavior::RunFor(Duration::ZERO));
                state.starts.push(Started {
                    address: address.to_string(),
                    order: order.clone(),
                    at: Instant::now(),
                });
                if let Behavior::RejectStart = behavior {
                    return Err(OpenbachError::unprocessable(format!(
                        "Cannot start {}",
                        order.name
                    )));
                }
                state.instances.insert(
                    order.instance_id,
                    Instance {
                        behavior,
                        started: Instant::now(),
                        stopped: false,
                    },
                );
                Ok(json!({ "instance_id": order.instance_id }))
            }
            AgentCommand::StopJobInstanceAgent(order) => {
                state.stops.push(Stopped {
                    name: order.name.clone(),
                    instance_id: order.instance_id,
                });
                match state.instances.get_mut(&order.instance_id) {
                    Some(instance) if instance.stopped => Err(OpenbachError::warning(format!(
                        "{} {} is already stopped",
                        order.name, order.instance_id
                    ))),
                    Some(instance) => {
                        instance.stopped = true;
                        Ok(Value::Null)
                    }
                    None => Err(OpenbachError::unprocessable(format!(
                        "No instance {} of {}",
                        order.instance_id, order.name
                    ))),
                }
            }
            AgentCommand::StatusJobInstanceAgent { instance_id, .. } => {
                let status = match state.instances.get(&instance_id) {
                    Some(instance) => self.status(instance),
                    None => JobStatus::NotScheduled,
                };
                Ok(json!({ "status": status }))
            }
            AgentCommand::RestartAgent { reload } => {
                state.restarts.push((address.to_string(), reload));
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        }
    }

    async fn push_file(&self, host: &str, file: &PushedFile) -> OpenbachResult<()> {
        self.state
            .lock()
            .unwrap()
            .pushed
            .push((host.to_string(), file.clone()));
        Ok(())
    }

    async fn pull_file(&self, _host: &str, _remote: &str, _local: &str) -> OpenbachResult<()> {
        Ok(())
    }
}

pub const CLIENT: &str = "10.0.0.2:1112";
pub const SERVER: &str = "10.0.0.3:1112";

pub fn fast_config() -> DirectorConfig {
    DirectorConfig {
        poll_interval: Duration::from_millis(25),
        busy_tick: Duration::from_millis(10),
        idle_tick: Duration::from_millis(25),
    }
}

/// Director over `agents` knowing the `client` and `server` entities.
pub fn director(agents: Arc<MockAgents>, scenarios: &[&str]) -> Director {
    director_with(agents, scenarios, fast_config())
}

pub fn director_with(
    agents: Arc<MockAgents>,
    scenarios: &[&str],
    config: DirectorConfig,
) -> Director {
    let definitions = scenarios.iter().map(|s| parse_scenario(s).unwrap());
    let entities = HashMap::from([
        ("client".to_string(), AgentEndpoint::parse(CLIENT).unwrap()),
        ("server".to_string(), AgentEndpoint::parse(SERVER).unwrap()),
    ]);
    Director::new(
        Catalog::from_parts(definitions, entities),
        agents,
        config,
    )
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_ended(director: &Director, id: ScenarioInstanceId) -> ScenarioStatus {
    wait_until("scenario end", || {
        director.status(id).is_some_and(|status| status.is_ended())
    })
    .await;
    director.status(id).unwrap()
}
