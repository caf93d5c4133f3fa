//! Director - owns the catalog, the instance store and the running scenario loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::scenario::ScenarioStatus;

use crate::catalog::Catalog;
use crate::connector::AgentConnector;
use crate::executor::scenario::run_scenario;
use crate::params::build_parameters;
use crate::poller::StatusPoller;
use crate::store::{AttemptRef, InstanceStore, ScenarioInstance, ScenarioInstanceId, ScenarioSnapshot};

/// Cadence of the executors and of the status poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorConfig {
    pub poll_interval: Duration,
    /// Scenario loop period while some function is scheduled or running.
    pub busy_tick: Duration,
    /// Scenario loop period while only dispatched work is running.
    pub idle_tick: Duration,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            busy_tick: Duration::from_millis(200),
            idle_tick: Duration::from_secs(1),
        }
    }
}

struct RunningScenario {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct DirectorInner {
    catalog: Catalog,
    store: InstanceStore,
    connector: Arc<dyn AgentConnector>,
    poller: StatusPoller,
    config: DirectorConfig,
    running: Mutex<HashMap<ScenarioInstanceId, RunningScenario>>,
}

/// Cheap to clone handle shared by the server and every executor.
#[derive(Clone)]
pub struct Director {
    inner: Arc<DirectorInner>,
}

impl Director {
    pub fn new(catalog: Catalog, connector: Arc<dyn AgentConnector>, config: DirectorConfig) -> Self {
        let store = InstanceStore::new();
        let poller = StatusPoller::new(store.clone(), connector.clone(), config.poll_interval);
        Self {
            inner: Arc::new(DirectorInner {
                catalog,
                store,
                connector,
                poller,
                config,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn store(&self) -> &InstanceStore {
        &self.inner.store
    }

    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.inner.connector
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.inner.poller
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.inner.config
    }

    fn running(&self) -> MutexGuard<'_, HashMap<ScenarioInstanceId, RunningScenario>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the loop of instance `id` is still alive.
    pub(crate) fn has_loop(&self, id: ScenarioInstanceId) -> bool {
        self.running().contains_key(&id)
    }

    /// Create a scenario instance and start its loop.
    #[instrument(skip(self, arguments))]
    pub fn start_scenario(
        &self,
        scenario_name: &str,
        arguments: HashMap<String, Value>,
        owner: Option<String>,
    ) -> OpenbachResult<ScenarioInstanceId> {
        self.launch(scenario_name, arguments, owner, None)
    }

    /// Start a scenario instance, as a sub-scenario when `parent` is given.
    pub(crate) fn launch(
        &self,
        scenario_name: &str,
        arguments: HashMap<String, Value>,
        owner: Option<String>,
        parent: Option<AttemptRef>,
    ) -> OpenbachResult<ScenarioInstanceId> {
        let definition = Arc::new(self.catalog().scenario(scenario_name)?.clone());
        let parameters = build_parameters(&definition, &arguments)?;
        let id = self
            .store()
            .create_scenario(scenario_name, arguments, parameters, owner, parent);

        let (stop, stop_rx) = watch::channel(false);
        let mut running = self.running();
        let director = self.clone();
        let handle = tokio::spawn(async move {
            run_scenario(director.clone(), id, definition, stop_rx).await;
            director.running().remove(&id);
        });
        running.insert(id, RunningScenario { stop, handle });

        info!("Scenario instance {} of {} started", id, scenario_name);
        Ok(id)
    }

    /// Ask a running instance to stop. Its loop winds down asynchronously.
    pub fn stop_scenario(&self, id: ScenarioInstanceId) -> OpenbachResult<()> {
        let scenario = self
            .store()
            .scenario(id)
            .ok_or_else(|| OpenbachError::not_found(format!("No scenario instance {}", id)))?;
        if scenario.status.is_ended() {
            return Err(OpenbachError::warning(format!(
                "Scenario instance {} already ended: {}",
                id, scenario.status
            )));
        }

        match self.running().get(&id) {
            Some(running) => {
                running.stop.send_replace(true);
                info!("Stop requested for scenario instance {}", id);
                Ok(())
            }
            None => Err(OpenbachError::internal(format!(
                "Scenario instance {} is {} but has no running loop",
                id, scenario.status
            ))),
        }
    }

    pub fn remove_scenario(&self, id: ScenarioInstanceId) -> OpenbachResult<()> {
        self.store().remove_scenario(id)?;
        info!("Scenario instance {} removed", id);
        Ok(())
    }

    pub fn infos(&self, id: ScenarioInstanceId) -> OpenbachResult<ScenarioSnapshot> {
        self.store()
            .snapshot(id)
            .ok_or_else(|| OpenbachError::not_found(format!("No scenario instance {}", id)))
    }

    pub fn list(&self) -> Vec<ScenarioInstance> {
        self.store().scenarios()
    }

    /// Current status of an instance, if it exists.
    pub fn status(&self, id: ScenarioInstanceId) -> Option<ScenarioStatus> {
        self.store().scenario(id).map(|scenario| scenario.status)
    }

    /// Stop every running instance and wait for their loops to end.
    pub async fn shutdown(&self) {
        let running: Vec<RunningScenario> = self.running().drain().map(|(_, r)| r).collect();
        if !running.is_empty() {
            info!("Stopping {} scenario instance(s)", running.len());
        }
        for scenario in &running {
            scenario.stop.send_replace(true);
        }
        for scenario in running {
            if let Err(e) = scenario.handle.await {
                warn!("Scenario loop ended abnormally: {}", e);
            }
        }
        self.poller().shutdown().await;
    }
}
