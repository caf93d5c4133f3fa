//! Status Poller - periodic job status refresh.
//!
//! Each dispatched job instance gets its own ticking task that asks the
//! owning agent for the instance status and writes it into the store. The
//! task ends once the status is terminal, or once the agent has stayed
//! unreachable for longer than the job's budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use openbach_shared::now_millis;
use openbach_shared::scenario::JobInstanceStatus;

use crate::connector::AgentConnector;
use crate::store::{InstanceStore, JobInstanceId, ScenarioInstanceId};

struct Watch {
    scenario_id: ScenarioInstanceId,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct WatchSet {
    next_generation: u64,
    watches: HashMap<JobInstanceId, Watch>,
}

/// Keeps job instance records current.
#[derive(Clone)]
pub struct StatusPoller {
    watches: Arc<Mutex<WatchSet>>,
    store: InstanceStore,
    connector: Arc<dyn AgentConnector>,
    period: Duration,
}

impl StatusPoller {
    pub fn new(store: InstanceStore, connector: Arc<dyn AgentConnector>, period: Duration) -> Self {
        Self {
            watches: Arc::new(Mutex::new(WatchSet::default())),
            store,
            connector,
            period,
        }
    }

    /// Start polling `job_id`, replacing any previous watch on it.
    ///
    /// `budget` bounds how long the agent may stay unreachable; `None` keeps
    /// polling until it answers.
    pub async fn watch(&self, job_id: JobInstanceId, budget: Option<Duration>) {
        let Some(job) = self.store.job(job_id) else {
            warn!("Cannot watch unknown job instance {}", job_id);
            return;
        };

        let mut set = self.watches.lock().await;
        set.next_generation += 1;
        let generation = set.next_generation;
        let handle = tokio::spawn(self.clone().poll(job_id, generation, budget));
        if let Some(previous) = set.watches.insert(
            job_id,
            Watch {
                scenario_id: job.scenario_id,
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        debug!("Watching job instance {} ({})", job_id, job.job_name);
    }

    pub async fn unwatch(&self, job_id: JobInstanceId) {
        if let Some(watch) = self.watches.lock().await.watches.remove(&job_id) {
            watch.handle.abort();
        }
    }

    /// Drop every watch of a scenario instance.
    pub async fn unwatch_scenario(&self, scenario_id: ScenarioInstanceId) {
        let mut set = self.watches.lock().await;
        set.watches.retain(|_, watch| {
            let keep = watch.scenario_id != scenario_id;
            if !keep {
                watch.handle.abort();
            }
            keep
        });
    }

    pub async fn is_watched(&self, job_id: JobInstanceId) -> bool {
        self.watches.lock().await.watches.contains_key(&job_id)
    }

    pub async fn watch_count(&self) -> usize {
        self.watches.lock().await.watches.len()
    }

    /// Abort every watch.
    pub async fn shutdown(&self) {
        let mut set = self.watches.lock().await;
        for (_, watch) in set.watches.drain() {
            watch.handle.abort();
        }
    }

    async fn poll(self, job_id: JobInstanceId, generation: u64, budget: Option<Duration>) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.tick(job_id, budget).await {
                break;
            }
        }

        let mut set = self.watches.lock().await;
        if set.watches.get(&job_id).map(|w| w.generation) == Some(generation) {
            set.watches.remove(&job_id);
        }
    }

    /// One status refresh. Returns whether the job should stay watched.
    async fn tick(&self, job_id: JobInstanceId, budget: Option<Duration>) -> bool {
        let Some(job) = self.store.job(job_id) else {
            return false;
        };
        if job.stop_date.is_some() {
            return false;
        }
        if !job.dispatched {
            return true;
        }

        let reply = self
            .connector
            .job_status(&job.agent_address, &job.job_name, job_id)
            .await;
        let now = now_millis();

        self.store
            .update_job(job_id, |job| {
                match reply {
                    Ok(status) => {
                        job.last_reached = Some(now);
                        job.set_status(status.into(), now);
                    }
                    Err(e) if e.is_unreachable() => {
                        job.status = JobInstanceStatus::AgentUnreachable;
                        let since = job.last_reached.unwrap_or(job.start_date);
                        let gone = now.saturating_sub(since);
                        if budget.is_some_and(|budget| u128::from(gone) > budget.as_millis()) {
                            warn!(
                                "Agent {} unreachable for {} ms, giving up on job instance {}",
                                job.agent_address, gone, job_id
                            );
                            job.stop_date = Some(now);
                        }
                    }
                    Err(e) => {
                        warn!("Status of job instance {} failed: {}", job_id, e);
                        job.last_reached = Some(now);
                        job.set_status(JobInstanceStatus::Error, now);
                    }
                }
                if job.stop_date.is_some() {
                    info!("Job instance {} ({}) ended: {}", job_id, job.job_name, job.status);
                    false
                } else {
                    true
                }
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewJob;
    use crate::transfer::PushedFile;
    use async_trait::async_trait;
    use openbach_shared::errors::{OpenbachError, OpenbachResult};
    use openbach_shared::protocol::{AgentCommand, JobStatus};
    use serde_json::{Value, json};

    /// Reports a fixed status, or fails every request.
    struct FixedAgent(OpenbachResult<JobStatus>);

    #[async_trait]
    impl AgentConnector for FixedAgent {
        async fn send(&self, _address: &str, _command: AgentCommand) -> OpenbachResult<Value> {
            self.0
                .clone()
                .map(|status| json!({ "status": status }))
        }

        async fn push_file(&self, _host: &str, _file: &PushedFile) -> OpenbachResult<()> {
            Ok(())
        }

        async fn pull_file(&self, _host: &str, _remote: &str, _local: &str) -> OpenbachResult<()> {
            Ok(())
        }
    }

    fn setup(agent: FixedAgent) -> (InstanceStore, StatusPoller, JobInstanceId) {
        let store = InstanceStore::new();
        let scenario = store.create_scenario("s", HashMap::new(), HashMap::new(), None, None);
        let attempt = store
            .add_attempt(scenario, 1, Some(0), Duration::ZERO)
            .unwrap();
        let job_id = store.create_job(NewJob {
            job_name: "iperf3".into(),
            entity_name: "server".into(),
            agent_address: "10.0.0.3:1112".into(),
            attempt,
        });
        let poller = StatusPoller::new(store.clone(), Arc::new(agent), Duration::from_millis(20));
        (store, poller, job_id)
    }

    async fn wait_unwatched(poller: &StatusPoller, job_id: JobInstanceId) {
        for _ in 0..100 {
            if !poller.is_watched(job_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job instance {} still watched", job_id);
    }

    #[tokio::test]
    async fn test_undispatched_job_is_left_alone() {
        let (store, poller, job_id) = setup(FixedAgent(Ok(JobStatus::NotRunning)));
        poller.watch(job_id, Some(Duration::ZERO)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(poller.is_watched(job_id).await);
        assert_eq!(store.job(job_id).unwrap().status, JobInstanceStatus::Scheduled);
        poller.shutdown().await;
        assert_eq!(poller.watch_count().await, 0);
    }

    #[tokio::test]
    async fn test_terminal_status_ends_watch() {
        let (store, poller, job_id) = setup(FixedAgent(Ok(JobStatus::NotRunning)));
        store.update_job(job_id, |job| job.dispatched = true);
        poller.watch(job_id, Some(Duration::ZERO)).await;
        wait_unwatched(&poller, job_id).await;

        let job = store.job(job_id).unwrap();
        assert_eq!(job.status, JobInstanceStatus::NotRunning);
        assert!(job.stop_date.is_some());
        assert!(job.last_reached.is_some());
    }

    #[tokio::test]
    async fn test_error_reply_sets_error() {
        let (store, poller, job_id) = setup(FixedAgent(Err(OpenbachError::unprocessable(
            "No job iperf3 is installed",
        ))));
        store.update_job(job_id, |job| job.dispatched = true);
        poller.watch(job_id, None).await;
        wait_unwatched(&poller, job_id).await;

        let job = store.job(job_id).unwrap();
        assert_eq!(job.status, JobInstanceStatus::Error);
        assert!(job.has_failed());
    }

    #[tokio::test]
    async fn test_unreachable_budget() {
        let (store, poller, job_id) =
            setup(FixedAgent(Err(OpenbachError::unreachable("connection refused"))));
        store.update_job(job_id, |job| job.dispatched = true);

        poller.watch(job_id, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(poller.is_watched(job_id).await);
        let job = store.job(job_id).unwrap();
        assert_eq!(job.status, JobInstanceStatus::AgentUnreachable);
        assert!(job.stop_date.is_none());

        poller.watch(job_id, Some(Duration::ZERO)).await;
        wait_unwatched(&poller, job_id).await;
        assert!(store.job(job_id).unwrap().has_failed());
    }

    #[tokio::test]
    async fn test_unwatch_scenario() {
        let (store, poller, job_id) = setup(FixedAgent(Ok(JobStatus::Running)));
        store.update_job(job_id, |job| job.dispatched = true);
        poller.watch(job_id, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.job(job_id).unwrap().status, JobInstanceStatus::Running);

        let scenario_id = store.job(job_id).unwrap().scenario_id;
        poller.unwatch_scenario(scenario_id).await;
        assert_eq!(poller.watch_count().await, 0);
    }
}
