//! Job instance table and scheduler.
//!
//! The [`JobManager`] owns every installed job and every instance launched
//! from it. All state lives behind a single mutex that is never held across
//! an `await`; timers are tokio tasks tracked by key so they can be
//! cancelled, and each instance carries a generation number so a late timer
//! never acts on a record that was replaced in the meantime.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, error, info, instrument, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::now_millis;
use openbach_shared::protocol::{JobStatus, OrderDate, StartOrder, StopOrder};

use super::descriptor::{JobDescriptor, list_descriptors, read_descriptor};
use super::process::{self, JobEnvironment};
use super::recovery::{RecordKind, Recovered, RecoveryStore, StartRecord, StopRecord};

/// Default size of the launch/stop worker pool.
pub const DEFAULT_WORKERS: usize = 50;

/// Range the first agent-assigned instance id is drawn from.
const INSTANCE_ID_SEED: Range<i64> = 500_000..1_000_000;

/// What to record when a job exits without a return code (killed by a signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCodePolicy {
    #[default]
    AssumeSuccess,
    TreatAsError,
}

impl ExitCodePolicy {
    pub fn code(&self, status: ExitStatus) -> i32 {
        status.code().unwrap_or_else(|| self.missing_code())
    }

    pub fn missing_code(&self) -> i32 {
        match self {
            ExitCodePolicy::AssumeSuccess => 0,
            ExitCodePolicy::TreatAsError => -1,
        }
    }
}

/// Settings for a [`JobManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub jobs_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub workers: usize,
    pub exit_policy: ExitCodePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    /// Waiting for its launch timer.
    Pending,
    Running { pid: Option<u32> },
    Exited { code: i32 },
    /// The process could not be spawned.
    Failed,
    Stopped,
}

#[derive(Debug)]
struct Instance {
    scenario_id: u64,
    owner_id: u64,
    arguments: Vec<String>,
    generation: u64,
    state: InstanceState,
}

#[derive(Debug)]
struct InstalledJob {
    descriptor: JobDescriptor,
    instances: HashMap<i64, Instance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    Launch,
    Stop,
}

type TimerKey = (String, i64, TimerKind);

#[derive(Debug)]
struct Timer {
    handle: JoinHandle<()>,
    generation: u64,
    repeating: bool,
}

/// Process-level work left once an instance has been marked stopped.
#[derive(Debug)]
struct StopWork {
    name: String,
    instance_id: i64,
    pid: Option<u32>,
    stop_line: Option<Vec<String>>,
}

#[derive(Debug)]
struct JobTable {
    jobs: HashMap<String, InstalledJob>,
    timers: HashMap<TimerKey, Timer>,
    next_instance_id: i64,
    last_instance_id: Option<i64>,
    generation: u64,
}

impl JobTable {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            timers: HashMap::new(),
            next_instance_id: fastrand::i64(INSTANCE_ID_SEED),
            last_instance_id: None,
            generation: 0,
        }
    }

    fn job(&self, name: &str) -> OpenbachResult<&InstalledJob> {
        self.jobs
            .get(name)
            .ok_or_else(|| OpenbachError::bad_request(format!("No job {} is installed", name)))
    }

    fn fresh_instance_id(&mut self) -> i64 {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        self.last_instance_id = Some(id);
        id
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn cancel_timer(&mut self, key: &TimerKey) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    /// Remove a timer entry if it still belongs to `generation`.
    ///
    /// A timer task calls this once its delay elapsed; after that it can no
    /// longer be aborted by a reschedule.
    fn claim_timer(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancel the launch timer and mark the instance stopped.
    fn begin_stop(&mut self, name: &str, instance_id: i64) -> StopWork {
        self.cancel_timer(&(name.to_string(), instance_id, TimerKind::Launch));

        let mut work = StopWork {
            name: name.to_string(),
            instance_id,
            pid: None,
            stop_line: None,
        };
        let Some(job) = self.jobs.get_mut(name) else {
            return work;
        };
        let Some(instance) = job.instances.get_mut(&instance_id) else {
            return work;
        };

        if let InstanceState::Running { pid } = instance.state {
            work.pid = pid;
        }
        if instance.state != InstanceState::Stopped && !job.descriptor.command_stop.is_empty() {
            work.stop_line = Some(process::command_line(
                &job.descriptor.command_stop,
                &instance.arguments,
                job.descriptor.need_privileges,
            ));
        }
        instance.state = InstanceState::Stopped;
        work
    }

    fn status(&self, name: &str, instance_id: i64) -> JobStatus {
        let Some(instance) = self
            .jobs
            .get(name)
            .and_then(|job| job.instances.get(&instance_id))
        else {
            return JobStatus::NotScheduled;
        };
        let launch_timer = self
            .timers
            .get(&(name.to_string(), instance_id, TimerKind::Launch));

        match instance.state {
            InstanceState::Pending => JobStatus::Scheduled,
            InstanceState::Running { .. } => JobStatus::Running,
            InstanceState::Exited { code } if code != 0 => JobStatus::Error,
            InstanceState::Exited { .. } => match launch_timer {
                Some(timer) if timer.repeating => JobStatus::Running,
                _ => JobStatus::NotRunning,
            },
            InstanceState::Failed => JobStatus::Error,
            InstanceState::Stopped => JobStatus::Stopped,
        }
    }
}

enum Launch {
    Skipped,
    Failed,
    Started(tokio::process::Child, Option<u32>),
}

#[derive(Debug)]
struct Inner {
    table: Mutex<JobTable>,
    workers: Semaphore,
    recovery: RecoveryStore,
    jobs_dir: PathBuf,
    exit_policy: ExitCodePolicy,
}

/// Installed jobs, their instances and the timers driving them.
#[derive(Debug, Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(JobTable::new()),
                workers: Semaphore::new(config.workers.max(1)),
                recovery: RecoveryStore::new(config.instances_dir),
                jobs_dir: config.jobs_dir,
                exit_policy: config.exit_policy,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn recovery(&self) -> &RecoveryStore {
        &self.inner.recovery
    }

    /// Install every descriptor found in the jobs directory.
    pub fn install_all(&self) -> usize {
        let names = match list_descriptors(&self.inner.jobs_dir) {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    "Cannot list jobs in {}: {}",
                    self.inner.jobs_dir.display(),
                    e
                );
                return 0;
            }
        };

        let mut installed = 0;
        for name in names {
            match self.add_job(&name) {
                Ok(()) => installed += 1,
                Err(e) if e.is_warning() => installed += 1,
                Err(e) => error!("Cannot install job {}: {}", name, e),
            }
        }
        info!("Installed {} jobs from {}", installed, self.inner.jobs_dir.display());
        installed
    }

    /// Install (or refresh) a job from its descriptor.
    #[instrument(skip(self))]
    pub fn add_job(&self, name: &str) -> OpenbachResult<()> {
        let descriptor = read_descriptor(&self.inner.jobs_dir, name)?;
        let mut table = self.table();

        match table.jobs.get_mut(name) {
            Some(job) => {
                let installed = std::mem::replace(&mut job.descriptor, descriptor);
                if installed.version >= job.descriptor.version {
                    return Err(OpenbachError::warning(format!(
                        "Job {} is already installed with a newer version ({} >= {}). Configuration updated",
                        name, installed.version, job.descriptor.version
                    )));
                }
                info!("Job {} upgraded to version {}", name, job.descriptor.version);
            }
            None => {
                info!("Job {} installed (version {})", name, descriptor.version);
                table.jobs.insert(
                    name.to_string(),
                    InstalledJob {
                        descriptor,
                        instances: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Uninstall a job, stopping its instances in the background.
    #[instrument(skip(self))]
    pub fn remove_job(&self, name: &str) -> OpenbachResult<()> {
        let works: Vec<StopWork> = {
            let mut table = self.table();
            let Some(job) = table.jobs.get(name) else {
                return Err(OpenbachError::warning(format!(
                    "No job {} is installed",
                    name
                )));
            };
            let ids: Vec<i64> = job.instances.keys().copied().collect();
            let works = ids
                .into_iter()
                .map(|id| {
                    table.cancel_timer(&(name.to_string(), id, TimerKind::Stop));
                    table.begin_stop(name, id)
                })
                .collect();
            table.jobs.remove(name);
            works
        };

        info!("Job {} uninstalled, stopping {} instances", name, works.len());
        for work in works {
            let manager = self.clone();
            tokio::spawn(async move { manager.finish_stop(work, true).await });
        }
        Ok(())
    }

    /// Sorted names of installed jobs.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table().jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Accept a start order and arm its launch timer.
    ///
    /// `reschedule` is set when replaying a recovery record; a one-shot order
    /// whose date already passed is then refused.
    #[instrument(skip(self, order), fields(job = %order.name, instance_id = order.instance_id))]
    pub fn start_instance(&self, order: StartOrder, reschedule: bool) -> OpenbachResult<i64> {
        let now = now_millis();
        let mut table = self.table();
        let descriptor = table.job(&order.name)?.descriptor.clone();

        let instance_id = if order.instance_id < 0 {
            table.fresh_instance_id()
        } else {
            order.instance_id
        };

        let started = table
            .jobs
            .get(&order.name)
            .and_then(|job| job.instances.get(&instance_id))
            .is_some_and(|instance| instance.state != InstanceState::Stopped);
        if started {
            return Err(OpenbachError::bad_request(format!(
                "Job {} instance {} is already started",
                order.name, instance_id
            )));
        }

        let target = match order.date {
            OrderDate::At(millis) if millis > now => Some(millis),
            _ => None,
        };
        if order.interval == Some(0) {
            return Err(OpenbachError::bad_request(
                "The interval must be a positive number of seconds",
            ));
        }
        if reschedule && order.interval.is_none() && target.is_none() {
            return Err(OpenbachError::bad_request("Cannot reschedule a past job"));
        }
        descriptor.check_arity(&order.arguments)?;

        if target.is_some() || order.interval.is_some() {
            let record = StartRecord {
                name: order.name.clone(),
                instance_id,
                scenario_id: order.scenario_id,
                owner_id: order.owner_id,
                date: target,
                interval: order.interval,
                arguments: order.arguments.clone(),
            };
            if let Err(e) = self.inner.recovery.write_start(&record) {
                warn!(
                    "Cannot persist start order of {} {}: {}",
                    order.name, instance_id, e
                );
            }
        }

        let generation = table.next_generation();
        if let Some(job) = table.jobs.get_mut(&order.name) {
            job.instances.insert(
                instance_id,
                Instance {
                    scenario_id: order.scenario_id,
                    owner_id: order.owner_id,
                    arguments: order.arguments,
                    generation,
                    state: InstanceState::Pending,
                },
            );
        }

        let delay = Duration::from_millis(target.map_or(0, |millis| millis - now));
        self.arm_launch(&mut table, &order.name, instance_id, generation, delay, order.interval);
        info!(
            "Job {} instance {} scheduled in {:?}{}",
            order.name,
            instance_id,
            delay,
            order
                .interval
                .map(|secs| format!(", every {}s", secs))
                .unwrap_or_default()
        );
        Ok(instance_id)
    }

    fn arm_launch(
        &self,
        table: &mut JobTable,
        name: &str,
        instance_id: i64,
        generation: u64,
        delay: Duration,
        interval: Option<u64>,
    ) {
        let key: TimerKey = (name.to_string(), instance_id, TimerKind::Launch);
        table.cancel_timer(&key);

        let manager = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let (name, instance_id, _) = task_key.clone();
            match interval {
                None => {
                    if !manager.table().claim_timer(&task_key, generation) {
                        return;
                    }
                    manager.launch(name, instance_id, generation, true).await;
                }
                Some(secs) => {
                    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        tokio::spawn(manager.clone().launch(
                            name.clone(),
                            instance_id,
                            generation,
                            false,
                        ));
                    }
                }
            }
        });

        table.timers.insert(
            key,
            Timer {
                handle,
                generation,
                repeating: interval.is_some(),
            },
        );
    }

    /// Spawn the process of an instance and wait for it to exit.
    async fn launch(self, name: String, instance_id: i64, generation: u64, one_shot: bool) {
        let launch = {
            let _permit = self.inner.workers.acquire().await.ok();
            let mut table = self.table();
            self.spawn_instance(&mut table, &name, instance_id, generation)
        };

        if one_shot && !matches!(launch, Launch::Skipped) {
            self.inner
                .recovery
                .remove(&name, instance_id, RecordKind::Start);
        }
        let Launch::Started(mut child, pid) = launch else {
            return;
        };

        let code = match child.wait().await {
            Ok(status) => self.inner.exit_policy.code(status),
            Err(e) => {
                warn!("Cannot wait for job {} instance {}: {}", name, instance_id, e);
                self.inner.exit_policy.missing_code()
            }
        };

        let mut table = self.table();
        let instance = table
            .jobs
            .get_mut(&name)
            .and_then(|job| job.instances.get_mut(&instance_id));
        if let Some(instance) = instance {
            if instance.generation == generation && instance.state == (InstanceState::Running { pid }) {
                instance.state = InstanceState::Exited { code };
                info!("Job {} instance {} exited with code {}", name, instance_id, code);
            }
        }
    }

    fn spawn_instance(
        &self,
        table: &mut JobTable,
        name: &str,
        instance_id: i64,
        generation: u64,
    ) -> Launch {
        let Some(job) = table.jobs.get_mut(name) else {
            return Launch::Skipped;
        };
        let Some(instance) = job.instances.get_mut(&instance_id) else {
            return Launch::Skipped;
        };
        if instance.generation != generation {
            return Launch::Skipped;
        }
        match instance.state {
            InstanceState::Stopped => return Launch::Skipped,
            InstanceState::Running { pid } => {
                warn!(
                    "Job {} instance {} is still running (pid {:?}), skipping this launch",
                    name, instance_id, pid
                );
                return Launch::Skipped;
            }
            _ => {}
        }

        let line = process::command_line(
            &job.descriptor.command,
            &instance.arguments,
            job.descriptor.need_privileges,
        );
        let environment = JobEnvironment {
            job_name: name.to_string(),
            instance_id,
            scenario_id: instance.scenario_id,
            owner_id: instance.owner_id,
        };

        match process::spawn(&line, Some(&environment)) {
            Ok(child) => {
                let pid = child.id();
                instance.state = InstanceState::Running { pid };
                info!("Job {} instance {} launched (pid {:?})", name, instance_id, pid);
                Launch::Started(child, pid)
            }
            Err(e) => {
                error!("Job {} instance {}: {}", name, instance_id, e);
                instance.state = InstanceState::Failed;
                Launch::Failed
            }
        }
    }

    /// Accept a stop order, immediate or dated.
    ///
    /// Stopping an instance that is already stopped still arms the stop
    /// and answers with a warning.
    #[instrument(skip(self, order), fields(job = %order.name, instance_id = order.instance_id))]
    pub fn stop_instance(&self, order: StopOrder, reschedule: bool) -> OpenbachResult<()> {
        let now = now_millis();
        let mut table = self.table();
        table.job(&order.name)?;

        let target = match order.date {
            OrderDate::At(millis) if millis > now => Some(millis),
            _ => None,
        };
        if reschedule && target.is_none() {
            return Err(OpenbachError::bad_request("Cannot reschedule a past job"));
        }

        let key: TimerKey = (order.name.clone(), order.instance_id, TimerKind::Stop);
        let launch_key: TimerKey = (order.name.clone(), order.instance_id, TimerKind::Launch);
        let already_stopped = !table.timers.contains_key(&launch_key)
            && table
                .jobs
                .get(&order.name)
                .and_then(|job| job.instances.get(&order.instance_id))
                .is_none_or(|instance| instance.state == InstanceState::Stopped);

        if let Some(millis) = target {
            let record = StopRecord {
                name: order.name.clone(),
                instance_id: order.instance_id,
                date: Some(millis),
            };
            if let Err(e) = self.inner.recovery.write_stop(&record) {
                warn!(
                    "Cannot persist stop order of {} {}: {}",
                    order.name, order.instance_id, e
                );
            }
        }

        table.cancel_timer(&key);
        let generation = table.next_generation();
        let delay = Duration::from_millis(target.map_or(0, |millis| millis - now));
        let manager = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let work = {
                let mut table = manager.table();
                if !table.claim_timer(&task_key, generation) {
                    return;
                }
                table.begin_stop(&task_key.0, task_key.1)
            };
            manager.finish_stop(work, true).await;
        });
        table.timers.insert(
            key,
            Timer {
                handle,
                generation,
                repeating: false,
            },
        );
        debug!("Stop of {} {} armed in {:?}", order.name, order.instance_id, delay);

        if already_stopped {
            return Err(OpenbachError::warning(format!(
                "Job {} instance {} is already stopped",
                order.name, order.instance_id
            )));
        }
        Ok(())
    }

    /// Kill the processes of a stopped instance and run its stop command.
    async fn finish_stop(&self, work: StopWork, remove_records: bool) {
        {
            let _permit = self.inner.workers.acquire().await.ok();
            if let Some(pid) = work.pid {
                process::terminate_tree(pid).await;
            }
            if let Some(line) = &work.stop_line {
                match process::run_to_completion(line).await {
                    Ok(code) => debug!(
                        "Stop command of {} {} exited with {:?}",
                        work.name, work.instance_id, code
                    ),
                    Err(e) => warn!(
                        "Stop command of {} {} failed: {}",
                        work.name, work.instance_id, e
                    ),
                }
            }
        }

        if remove_records {
            let recovery = &self.inner.recovery;
            recovery.remove(&work.name, work.instance_id, RecordKind::Stop);
            recovery.remove(&work.name, work.instance_id, RecordKind::Start);
        }
        info!("Job {} instance {} stopped", work.name, work.instance_id);
    }

    /// Stop an instance then start it again with a new order.
    #[instrument(skip(self, order), fields(job = %order.name, instance_id = order.instance_id))]
    pub async fn restart_instance(&self, mut order: StartOrder) -> OpenbachResult<i64> {
        let work = {
            let mut table = self.table();
            table.job(&order.name)?.descriptor.check_arity(&order.arguments)?;
            if order.instance_id < 0 {
                order.instance_id = table.fresh_instance_id();
            }
            table.cancel_timer(&(order.name.clone(), order.instance_id, TimerKind::Stop));
            table.begin_stop(&order.name, order.instance_id)
        };
        self.finish_stop(work, true).await;
        self.start_instance(order, false)
    }

    /// Status of an instance; a negative id means the last assigned one.
    pub fn status_instance(&self, name: &str, instance_id: i64) -> OpenbachResult<JobStatus> {
        let table = self.table();
        table.job(name)?;
        let instance_id = if instance_id < 0 {
            match table.last_instance_id {
                Some(id) => id,
                None => return Ok(JobStatus::NotScheduled),
            }
        } else {
            instance_id
        };
        Ok(table.status(name, instance_id))
    }

    /// Stop every instance, keeping recovery records, then optionally
    /// replay them.
    #[instrument(skip(self))]
    pub async fn restart_agent(&self, reload: bool) {
        let works: Vec<StopWork> = {
            let mut table = self.table();
            for (_, timer) in table.timers.drain() {
                timer.handle.abort();
            }
            let ids: Vec<(String, i64)> = table
                .jobs
                .iter()
                .flat_map(|(name, job)| {
                    job.instances
                        .iter()
                        .filter(|(_, instance)| instance.state != InstanceState::Stopped)
                        .map(move |(id, _)| (name.clone(), *id))
                })
                .collect();
            ids.into_iter()
                .map(|(name, id)| table.begin_stop(&name, id))
                .collect()
        };

        info!("Stopping {} job instances", works.len());
        let mut stops = JoinSet::new();
        for work in works {
            let manager = self.clone();
            stops.spawn(async move { manager.finish_stop(work, false).await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                error!("Stop task failed: {}", e);
            }
        }

        if reload {
            self.recover();
        }
    }

    /// Replay start and stop orders left by a previous run.
    ///
    /// Records that cannot be replayed are deleted.
    pub fn recover(&self) {
        for found in self.inner.recovery.scan_starts() {
            match found {
                Recovered::Record { path, record } => {
                    let label = format!("{} {}", record.name, record.instance_id);
                    match self.start_instance(record.into_order(), true) {
                        Ok(_) => info!("Recovered start order of {}", label),
                        Err(e) if e.is_warning() => info!("Recovered start order of {}: {}", label, e),
                        Err(e) => {
                            warn!("Dropping start order of {}: {}", label, e);
                            RecoveryStore::remove_path(&path);
                        }
                    }
                }
                Recovered::Corrupted { path, reason } => {
                    warn!("Dropping unreadable record {}: {}", path.display(), reason);
                    RecoveryStore::remove_path(&path);
                }
            }
        }

        for found in self.inner.recovery.scan_stops() {
            match found {
                Recovered::Record { path, record } => {
                    let label = format!("{} {}", record.name, record.instance_id);
                    match self.stop_instance(record.into_order(), true) {
                        Ok(()) => info!("Recovered stop order of {}", label),
                        Err(e) if e.is_warning() => info!("Recovered stop order of {}", label),
                        Err(e) => {
                            warn!("Dropping stop order of {}: {}", label, e);
                            RecoveryStore::remove_path(&path);
                        }
                    }
                }
                Recovered::Corrupted { path, reason } => {
                    warn!("Dropping unreadable record {}: {}", path.display(), reason);
                    RecoveryStore::remove_path(&path);
                }
            }
        }
    }

    /// Stop everything before the daemon exits; recovery records survive.
    pub async fn shutdown(&self) {
        self.restart_agent(false).await;
    }
}
