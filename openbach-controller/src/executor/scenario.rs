//! Scenario DAG Executor - drives one scenario instance to an ended status.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::scenario::{
    FailurePolicy, FunctionDefinition, FunctionId, FunctionStatus, ScenarioDefinition,
    ScenarioStatus, WaitKind,
};

use super::function::{run_function, stop_job};
use super::pause;
use crate::catalog::Catalog;
use crate::director::Director;
use crate::params::Resolver;
use crate::store::{AttemptRef, FunctionAttempt, ScenarioInstanceId};

/// Run a scenario instance until it ends, then record its final status.
#[instrument(skip(director, definition, stop), fields(scenario = %definition.name))]
pub async fn run_scenario(
    director: Director,
    scenario_id: ScenarioInstanceId,
    definition: Arc<ScenarioDefinition>,
    mut stop: watch::Receiver<bool>,
) {
    let store = director.store().clone();

    let parameters = store
        .scenario(scenario_id)
        .map(|scenario| scenario.parameters)
        .unwrap_or_default();
    if let Err(e) = preflight(&director, &definition, &parameters).await {
        warn!("Scenario instance {} not started: {}", scenario_id, e);
        store.set_scenario_status(scenario_id, ScenarioStatus::AgentsUnreachable);
        return;
    }

    let mut executor = ScenarioExecutor::new(director.clone(), scenario_id, definition);
    let status = match executor.run(&mut stop).await {
        Ok(status) => status,
        Err(e) => {
            error!("Scenario instance {} failed unexpectedly: {}", scenario_id, e);
            ScenarioStatus::FinishedKo
        }
    };

    executor.wind_down(status).await;
    director.poller().unwatch_scenario(scenario_id).await;
    store.set_scenario_status(scenario_id, status);
    info!("Scenario instance {} ended: {}", scenario_id, status);
}

/// Check the connection to every agent the scenario may start a job on.
async fn preflight(
    director: &Director,
    definition: &ScenarioDefinition,
    parameters: &HashMap<String, Value>,
) -> OpenbachResult<()> {
    let mut addresses = BTreeSet::new();
    collect_agents(
        director.catalog(),
        definition,
        parameters,
        &mut HashSet::new(),
        &mut addresses,
    );

    let mut checks = JoinSet::new();
    for address in addresses {
        let connector = director.connector().clone();
        checks.spawn(async move {
            let check = connector.check_connection(&address).await;
            (address, check)
        });
    }

    let mut unreachable = Vec::new();
    while let Some(joined) = checks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((address, Err(e))) => unreachable.push(format!("{} ({})", address, e.message())),
            Err(e) => unreachable.push(format!("connection check aborted: {}", e)),
        }
    }
    if unreachable.is_empty() {
        Ok(())
    } else {
        unreachable.sort();
        Err(OpenbachError::unreachable(format!(
            "Agents unreachable: {}",
            unreachable.join(", ")
        )))
    }
}

/// Agent addresses of start-job functions, following sub-scenarios.
///
/// Entity or scenario names that only resolve at run time are skipped; the
/// function itself reports the problem when it runs.
fn collect_agents(
    catalog: &Catalog,
    definition: &ScenarioDefinition,
    parameters: &HashMap<String, Value>,
    visited: &mut HashSet<String>,
    addresses: &mut BTreeSet<String>,
) {
    if !visited.insert(definition.name.clone()) {
        return;
    }
    let Ok(resolver) = Resolver::new(parameters) else {
        return;
    };
    let resolved_name = |function: &FunctionDefinition, action: &str, field: &str| {
        let raw = function.action.get(action)?.get(field)?;
        match resolver.resolve(raw) {
            Ok(Value::String(name)) => Some(name),
            _ => None,
        }
    };

    for function in &definition.openbach_functions {
        match function.action_name() {
            Some("start_job_instance") => {
                if let Some(endpoint) = resolved_name(function, "start_job_instance", "entity_name")
                    .and_then(|entity| catalog.agent(&entity).ok())
                {
                    addresses.insert(endpoint.address());
                }
            }
            Some("start_scenario_instance") => {
                if let Some(child) =
                    resolved_name(function, "start_scenario_instance", "scenario_name")
                        .and_then(|name| catalog.scenario(&name).ok())
                {
                    collect_agents(catalog, child, &child.constants, visited, addresses);
                }
            }
            _ => {}
        }
    }
}

struct ScenarioExecutor {
    director: Director,
    scenario_id: ScenarioInstanceId,
    definition: Arc<ScenarioDefinition>,
    launched: HashSet<AttemptRef>,
    functions: JoinSet<()>,
    halt: watch::Sender<bool>,
}

impl ScenarioExecutor {
    fn new(director: Director, scenario_id: ScenarioInstanceId, definition: Arc<ScenarioDefinition>) -> Self {
        let (halt, _) = watch::channel(false);
        Self {
            director,
            scenario_id,
            definition,
            launched: HashSet::new(),
            functions: JoinSet::new(),
            halt,
        }
    }

    fn function(&self, id: FunctionId) -> OpenbachResult<&FunctionDefinition> {
        self.definition.function(id).ok_or_else(|| {
            OpenbachError::internal(format!(
                "Scenario {} has no openbach function {}",
                self.definition.name, id
            ))
        })
    }

    fn policy(&self, id: FunctionId) -> OpenbachResult<FailurePolicy> {
        Ok(self.function(id)?.on_fail.policy)
    }

    /// The main loop. Returns the status the instance ends with.
    async fn run(&mut self, stop: &mut watch::Receiver<bool>) -> OpenbachResult<ScenarioStatus> {
        let store = self.director.store().clone();
        let config = self.director.config().clone();

        for function in &self.definition.openbach_functions {
            store.add_attempt(
                self.scenario_id,
                function.id,
                function.on_fail.initial_retries(),
                function.wait.delay(),
            )?;
        }
        store.set_scenario_status(self.scenario_id, ScenarioStatus::Running);

        loop {
            if *stop.borrow() {
                info!("Scenario instance {} stopped on request", self.scenario_id);
                return Ok(ScenarioStatus::Stopped);
            }
            while let Some(joined) = self.functions.try_join_next() {
                if let Err(e) = joined {
                    return Err(OpenbachError::internal(format!(
                        "Function executor crashed: {}",
                        e
                    )));
                }
            }

            let jobs = store.jobs_of(self.scenario_id);
            for job in jobs.iter().filter(|job| job.has_failed()) {
                if self.policy(job.function_id)? != FailurePolicy::Ignore {
                    warn!(
                        "Job instance {} ({}) of function {} ended with {}",
                        job.id, job.job_name, job.function_id, job.status
                    );
                    return Ok(ScenarioStatus::FinishedKo);
                }
            }

            if !self.retry_failed()? {
                return Ok(ScenarioStatus::FinishedKo);
            }

            let attempts = store.latest_attempts(self.scenario_id);
            self.launch_ready(&attempts)?;

            let attempts = store.latest_attempts(self.scenario_id);
            let unfinished = attempts.values().any(|a| a.status.is_unfinished());
            let jobs_running = store
                .jobs_of(self.scenario_id)
                .iter()
                .any(|job| job.is_live());
            let scenarios_running = attempts
                .values()
                .filter_map(|a| a.started_scenario)
                .any(|child| {
                    store
                        .scenario(child)
                        .is_some_and(|child| !child.status.is_ended())
                });

            if unfinished {
                pause(stop, config.busy_tick).await;
            } else if jobs_running || scenarios_running {
                pause(stop, config.idle_tick).await;
            } else {
                return Ok(ScenarioStatus::FinishedOk);
            }
        }
    }

    /// Replace errored attempts that have retries left. Returns `false` when
    /// one has none and its policy is fatal.
    fn retry_failed(&mut self) -> OpenbachResult<bool> {
        let store = self.director.store();
        let mut errored: Vec<FunctionAttempt> = store
            .latest_attempts(self.scenario_id)
            .into_values()
            .filter(|a| a.status == FunctionStatus::Error)
            .collect();
        errored.sort_by_key(|a| a.function_id);

        for attempt in errored {
            let on_fail = &self.function(attempt.function_id)?.on_fail;
            if on_fail.policy == FailurePolicy::Ignore {
                continue;
            }
            match attempt.retries {
                Some(0) => {
                    warn!(
                        "Openbach function {} failed with no retry left",
                        attempt.function_id
                    );
                    return Ok(false);
                }
                retries => {
                    store.set_function_status(attempt.reference(), FunctionStatus::Retried);
                    let next = store.add_attempt(
                        self.scenario_id,
                        attempt.function_id,
                        retries.map(|left| left - 1),
                        on_fail.retry_delay(),
                    )?;
                    info!(
                        "Retrying openbach function {} (attempt {}, {} retries left)",
                        attempt.function_id,
                        next.attempt,
                        retries.map_or("unbounded".to_string(), |left| (left - 1).to_string())
                    );
                }
            }
        }
        Ok(true)
    }

    fn launch_ready(&mut self, attempts: &HashMap<FunctionId, FunctionAttempt>) -> OpenbachResult<()> {
        let mut ready: Vec<&FunctionAttempt> = Vec::new();
        for attempt in attempts.values() {
            if attempt.status != FunctionStatus::Scheduled
                || self.launched.contains(&attempt.reference())
            {
                continue;
            }
            let mut clear = true;
            for (kind, waited) in self.function(attempt.function_id)?.wait.conditions() {
                if !self.wait_satisfied(kind, attempts.get(&waited))? {
                    clear = false;
                    break;
                }
            }
            if clear {
                ready.push(attempt);
            }
        }
        ready.sort_by_key(|a| a.function_id);

        for attempt in ready {
            let reference = attempt.reference();
            debug!("Launching openbach function {}", reference.function_id);
            self.launched.insert(reference);
            self.functions.spawn(run_function(
                self.director.clone(),
                reference,
                self.definition.clone(),
                self.halt.subscribe(),
            ));
        }
        Ok(())
    }

    /// Whether the waited attempt will not change any more on its own.
    fn settled(&self, attempt: &FunctionAttempt) -> OpenbachResult<bool> {
        Ok(match attempt.status {
            FunctionStatus::Finished | FunctionStatus::Stopped => true,
            FunctionStatus::Error => self.policy(attempt.function_id)? == FailurePolicy::Ignore,
            _ => false,
        })
    }

    fn wait_satisfied(&self, kind: WaitKind, waited: Option<&FunctionAttempt>) -> OpenbachResult<bool> {
        let Some(waited) = waited else {
            return Err(OpenbachError::internal(
                "Wait condition on an unknown openbach function",
            ));
        };
        Ok(match kind {
            WaitKind::Running => waited.status != FunctionStatus::Scheduled,
            WaitKind::Ended => !waited.status.is_unfinished(),
            WaitKind::Launched => self.settled(waited)?,
            WaitKind::Finished => self.settled(waited)? && !self.work_running(waited),
        })
    }

    /// Whether the job or sub-scenario started by `attempt` is still going.
    fn work_running(&self, attempt: &FunctionAttempt) -> bool {
        let store = self.director.store();
        let job_running = attempt
            .started_job
            .and_then(|id| store.job(id))
            .is_some_and(|job| job.stop_date.is_none());
        let scenario_running = attempt
            .started_scenario
            .and_then(|id| store.scenario(id))
            .is_some_and(|scenario| !scenario.status.is_ended());
        job_running || scenario_running
    }

    /// Stop everything still running. A finished instance has nothing left.
    async fn wind_down(&mut self, status: ScenarioStatus) {
        self.halt.send_replace(true);
        while let Some(joined) = self.functions.join_next().await {
            if let Err(e) = joined {
                warn!("Function executor ended abnormally: {}", e);
            }
        }
        if status == ScenarioStatus::FinishedOk {
            return;
        }

        let store = self.director.store();
        let mut stops = JoinSet::new();
        for job in store.jobs_of(self.scenario_id) {
            if !job.is_live() {
                continue;
            }
            let director = self.director.clone();
            stops.spawn(async move {
                if let Err(e) = stop_job(&director, &job).await {
                    if !e.is_warning() {
                        warn!("Cannot stop job instance {} ({}): {}", job.id, job.job_name, e);
                    }
                }
            });
        }
        while stops.join_next().await.is_some() {}

        let children = store.sub_scenarios(self.scenario_id);
        for child in &children {
            match self.director.stop_scenario(*child) {
                Ok(()) => debug!("Stopping sub-scenario instance {}", child),
                Err(e) if e.is_warning() => {}
                Err(e) => warn!("Cannot stop sub-scenario instance {}: {}", child, e),
            }
        }
        // A child still winding down owns live jobs: end after it does.
        for child in children {
            while !self.child_done(child) {
                tokio::time::sleep(self.director.config().busy_tick).await;
            }
        }

        for attempt in store.latest_attempts(self.scenario_id).into_values() {
            if attempt.status == FunctionStatus::Running {
                store.set_function_status(attempt.reference(), FunctionStatus::Stopped);
            }
        }
    }

    fn child_done(&self, child: ScenarioInstanceId) -> bool {
        let ended = self
            .director
            .store()
            .scenario(child)
            .is_none_or(|scenario| scenario.status.is_ended());
        ended || !self.director.has_loop(child)
    }
}
