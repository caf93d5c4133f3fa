//! In-memory record of scenario instances, function attempts and job instances.
//!
//! Function attempts are append-only: a retry adds a new attempt instead of
//! rewriting the failed one, and readers look at the latest attempt of each
//! function. All access goes through one mutex that is never held across an
//! `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::now_millis;
use openbach_shared::scenario::{FunctionId, FunctionStatus, JobInstanceStatus, ScenarioStatus};

pub type ScenarioInstanceId = u64;
pub type JobInstanceId = i64;

/// One attempt of one function of one scenario instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttemptRef {
    pub scenario_id: ScenarioInstanceId,
    pub function_id: FunctionId,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioInstance {
    pub id: ScenarioInstanceId,
    pub scenario_name: String,
    pub status: ScenarioStatus,
    pub owner: Option<String>,
    /// Root of the sub-scenario tree this instance belongs to.
    pub owner_scenario_id: ScenarioInstanceId,
    pub parent: Option<AttemptRef>,
    pub arguments: HashMap<String, Value>,
    pub parameters: HashMap<String, Value>,
    pub start_date: u64,
    pub stop_date: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionAttempt {
    pub scenario_id: ScenarioInstanceId,
    pub function_id: FunctionId,
    pub attempt: u32,
    pub status: FunctionStatus,
    /// Retries left after this attempt; `None` is unbounded.
    pub retries: Option<u32>,
    /// Seconds slept before the action runs.
    pub wait_time: f64,
    pub launch_date: Option<u64>,
    pub started_job: Option<JobInstanceId>,
    pub started_scenario: Option<ScenarioInstanceId>,
}

impl FunctionAttempt {
    pub fn reference(&self) -> AttemptRef {
        AttemptRef {
            scenario_id: self.scenario_id,
            function_id: self.function_id,
            attempt: self.attempt,
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs_f64(self.wait_time.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub entity_name: String,
    pub agent_address: String,
    pub scenario_id: ScenarioInstanceId,
    pub function_id: FunctionId,
    pub attempt: u32,
    pub status: JobInstanceStatus,
    /// The agent acknowledged the start order.
    pub dispatched: bool,
    pub start_date: u64,
    pub stop_date: Option<u64>,
    pub last_reached: Option<u64>,
}

impl JobInstance {
    /// Dispatched and not yet terminal.
    pub fn is_live(&self) -> bool {
        self.dispatched && self.stop_date.is_none()
    }

    /// Dispatched and ended in a failing status.
    pub fn has_failed(&self) -> bool {
        self.dispatched && self.stop_date.is_some() && self.status.is_failure()
    }

    /// Record a status, stamping the stop date on the first terminal one.
    pub fn set_status(&mut self, status: JobInstanceStatus, now: u64) {
        self.status = status;
        if status.is_terminal() && self.stop_date.is_none() {
            self.stop_date = Some(now);
        }
    }
}

/// What is needed to create a job instance record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_name: String,
    pub entity_name: String,
    pub agent_address: String,
    pub attempt: AttemptRef,
}

/// Everything recorded about one scenario instance.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSnapshot {
    #[serde(flatten)]
    pub instance: ScenarioInstance,
    pub openbach_functions: Vec<FunctionAttempt>,
    pub jobs: Vec<JobInstance>,
    pub sub_scenario_ids: Vec<ScenarioInstanceId>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_scenario_id: ScenarioInstanceId,
    next_job_id: JobInstanceId,
    scenarios: BTreeMap<ScenarioInstanceId, ScenarioInstance>,
    attempts: BTreeMap<ScenarioInstanceId, BTreeMap<(FunctionId, u32), FunctionAttempt>>,
    jobs: BTreeMap<JobInstanceId, JobInstance>,
}

impl StoreInner {
    fn attempt_mut(&mut self, reference: AttemptRef) -> Option<&mut FunctionAttempt> {
        self.attempts
            .get_mut(&reference.scenario_id)?
            .get_mut(&(reference.function_id, reference.attempt))
    }

    fn children(&self, scenario_id: ScenarioInstanceId) -> Vec<ScenarioInstanceId> {
        self.scenarios
            .values()
            .filter(|s| s.parent.map(|p| p.scenario_id) == Some(scenario_id))
            .map(|s| s.id)
            .collect()
    }
}

/// Shared handle on the instance records.
#[derive(Debug, Clone, Default)]
pub struct InstanceStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_scenario(
        &self,
        scenario_name: &str,
        arguments: HashMap<String, Value>,
        parameters: HashMap<String, Value>,
        owner: Option<String>,
        parent: Option<AttemptRef>,
    ) -> ScenarioInstanceId {
        let mut inner = self.lock();
        inner.next_scenario_id += 1;
        let id = inner.next_scenario_id;
        let owner_scenario_id = parent
            .and_then(|p| inner.scenarios.get(&p.scenario_id))
            .map(|p| p.owner_scenario_id)
            .unwrap_or(id);
        inner.scenarios.insert(
            id,
            ScenarioInstance {
                id,
                scenario_name: scenario_name.to_string(),
                status: ScenarioStatus::Scheduling,
                owner,
                owner_scenario_id,
                parent,
                arguments,
                parameters,
                start_date: now_millis(),
                stop_date: None,
            },
        );
        inner.attempts.insert(id, BTreeMap::new());
        id
    }

    pub fn scenario(&self, id: ScenarioInstanceId) -> Option<ScenarioInstance> {
        self.lock().scenarios.get(&id).cloned()
    }

    pub fn scenarios(&self) -> Vec<ScenarioInstance> {
        self.lock().scenarios.values().cloned().collect()
    }

    /// Set the status, stamping the stop date once it is an ended one.
    pub fn set_scenario_status(&self, id: ScenarioInstanceId, status: ScenarioStatus) {
        if let Some(scenario) = self.lock().scenarios.get_mut(&id) {
            scenario.status = status;
            if status.is_ended() && scenario.stop_date.is_none() {
                scenario.stop_date = Some(now_millis());
            }
        }
    }

    /// Drop an ended instance together with its sub-scenarios, which must
    /// all have ended too.
    pub fn remove_scenario(&self, id: ScenarioInstanceId) -> OpenbachResult<()> {
        let mut inner = self.lock();
        if !inner.scenarios.contains_key(&id) {
            return Err(OpenbachError::not_found(format!("No scenario instance {}", id)));
        }

        let mut tree = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            pending.extend(inner.children(current));
            tree.push(current);
        }
        for member in &tree {
            if let Some(scenario) = inner.scenarios.get(member) {
                if !scenario.status.is_ended() {
                    return Err(OpenbachError::bad_request(format!(
                        "Scenario instance {} is still {}",
                        member, scenario.status
                    )));
                }
            }
        }

        for member in tree {
            inner.scenarios.remove(&member);
            inner.attempts.remove(&member);
            inner.jobs.retain(|_, job| job.scenario_id != member);
        }
        Ok(())
    }

    /// Instances started by functions of `id`.
    pub fn sub_scenarios(&self, id: ScenarioInstanceId) -> Vec<ScenarioInstanceId> {
        self.lock().children(id)
    }

    /// Append a `Scheduled` attempt for `function_id`, returning its reference.
    pub fn add_attempt(
        &self,
        scenario_id: ScenarioInstanceId,
        function_id: FunctionId,
        retries: Option<u32>,
        wait: Duration,
    ) -> OpenbachResult<AttemptRef> {
        let mut inner = self.lock();
        let attempts = inner.attempts.get_mut(&scenario_id).ok_or_else(|| {
            OpenbachError::internal(format!("No scenario instance {}", scenario_id))
        })?;
        let attempt = attempts
            .range((function_id, 0)..=(function_id, u32::MAX))
            .next_back()
            .map(|((_, n), _)| n + 1)
            .unwrap_or(0);
        attempts.insert(
            (function_id, attempt),
            FunctionAttempt {
                scenario_id,
                function_id,
                attempt,
                status: FunctionStatus::Scheduled,
                retries,
                wait_time: wait.as_secs_f64(),
                launch_date: None,
                started_job: None,
                started_scenario: None,
            },
        );
        Ok(AttemptRef {
            scenario_id,
            function_id,
            attempt,
        })
    }

    pub fn attempt(&self, reference: AttemptRef) -> Option<FunctionAttempt> {
        self.lock().attempt_mut(reference).cloned()
    }

    /// Latest attempt of every function of the instance.
    pub fn latest_attempts(
        &self,
        scenario_id: ScenarioInstanceId,
    ) -> HashMap<FunctionId, FunctionAttempt> {
        let inner = self.lock();
        let mut latest = HashMap::new();
        if let Some(attempts) = inner.attempts.get(&scenario_id) {
            // Keys are ordered, so later attempts overwrite earlier ones.
            for ((function_id, _), attempt) in attempts {
                latest.insert(*function_id, attempt.clone());
            }
        }
        latest
    }

    pub fn latest_attempt(
        &self,
        scenario_id: ScenarioInstanceId,
        function_id: FunctionId,
    ) -> Option<FunctionAttempt> {
        let inner = self.lock();
        inner
            .attempts
            .get(&scenario_id)?
            .range((function_id, 0)..=(function_id, u32::MAX))
            .next_back()
            .map(|(_, attempt)| attempt.clone())
    }

    pub fn set_function_status(&self, reference: AttemptRef, status: FunctionStatus) {
        if let Some(attempt) = self.lock().attempt_mut(reference) {
            attempt.status = status;
            if status == FunctionStatus::Running && attempt.launch_date.is_none() {
                attempt.launch_date = Some(now_millis());
            }
        }
    }

    pub fn record_started_scenario(&self, reference: AttemptRef, child: ScenarioInstanceId) {
        if let Some(attempt) = self.lock().attempt_mut(reference) {
            attempt.started_scenario = Some(child);
        }
    }

    /// Create a `Scheduled` job record and attach it to its attempt.
    pub fn create_job(&self, job: NewJob) -> JobInstanceId {
        let mut inner = self.lock();
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        inner.jobs.insert(
            id,
            JobInstance {
                id,
                job_name: job.job_name,
                entity_name: job.entity_name,
                agent_address: job.agent_address,
                scenario_id: job.attempt.scenario_id,
                function_id: job.attempt.function_id,
                attempt: job.attempt.attempt,
                status: JobInstanceStatus::Scheduled,
                dispatched: false,
                start_date: now_millis(),
                stop_date: None,
                last_reached: None,
            },
        );
        if let Some(attempt) = inner.attempt_mut(job.attempt) {
            attempt.started_job = Some(id);
        }
        id
    }

    pub fn job(&self, id: JobInstanceId) -> Option<JobInstance> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Apply `update` to a job record, if it still exists.
    pub fn update_job<R>(
        &self,
        id: JobInstanceId,
        update: impl FnOnce(&mut JobInstance) -> R,
    ) -> Option<R> {
        self.lock().jobs.get_mut(&id).map(update)
    }

    pub fn jobs_of(&self, scenario_id: ScenarioInstanceId) -> Vec<JobInstance> {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.scenario_id == scenario_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, id: ScenarioInstanceId) -> Option<ScenarioSnapshot> {
        let inner = self.lock();
        let instance = inner.scenarios.get(&id)?.clone();
        Some(ScenarioSnapshot {
            instance,
            openbach_functions: inner
                .attempts
                .get(&id)
                .map(|attempts| attempts.values().cloned().collect())
                .unwrap_or_default(),
            jobs: inner
                .jobs
                .values()
                .filter(|job| job.scenario_id == id)
                .cloned()
                .collect(),
            sub_scenario_ids: inner.children(id),
        })
    }
}
