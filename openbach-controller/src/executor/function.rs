//! Function Executor - runs one function attempt to completion.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::now_millis;
use openbach_shared::protocol::{OrderDate, StartOrder, StopOrder};
use openbach_shared::scenario::{
    FunctionAction, FunctionDefinition, FunctionId, FunctionStatus, JobInstanceStatus,
    ScenarioDefinition,
};

use super::pause;
use crate::director::Director;
use crate::params::Resolver;
use crate::store::{AttemptRef, JobInstance, NewJob, ScenarioInstance};
use crate::transfer::pushed_files;

/// Run `attempt`: mark it running, sleep its wait time, dispatch its action
/// and record the outcome. A raised `halt` wins over any other outcome.
#[instrument(skip(director, definition, halt), fields(scenario = attempt.scenario_id, function = attempt.function_id))]
pub async fn run_function(
    director: Director,
    attempt: AttemptRef,
    definition: Arc<ScenarioDefinition>,
    mut halt: watch::Receiver<bool>,
) {
    let store = director.store();
    store.set_function_status(attempt, FunctionStatus::Running);

    let wait = store.attempt(attempt).map(|a| a.wait()).unwrap_or_default();
    if !wait.is_zero() {
        debug!("Waiting {:?} before acting", wait);
        pause(&mut halt, wait).await;
    }
    if *halt.borrow() {
        store.set_function_status(attempt, FunctionStatus::Stopped);
        return;
    }

    let outcome = execute(&director, attempt, &definition).await;
    let status = if *halt.borrow() {
        FunctionStatus::Stopped
    } else {
        match outcome {
            Ok(()) => FunctionStatus::Finished,
            Err(e) if e.is_warning() => {
                warn!("{}", e);
                FunctionStatus::Finished
            }
            Err(e) => {
                error!("Function {} failed: {}", attempt.function_id, e);
                FunctionStatus::Error
            }
        }
    };
    store.set_function_status(attempt, status);
}

async fn execute(
    director: &Director,
    attempt: AttemptRef,
    definition: &ScenarioDefinition,
) -> OpenbachResult<()> {
    let function = definition.function(attempt.function_id).ok_or_else(|| {
        OpenbachError::internal(format!("No openbach function {}", attempt.function_id))
    })?;
    let scenario = director
        .store()
        .scenario(attempt.scenario_id)
        .ok_or_else(|| OpenbachError::internal(format!("No scenario instance {}", attempt.scenario_id)))?;

    let action = resolve_action(function, &scenario.parameters)?;
    info!("Running {}", function.display_name());

    match action {
        FunctionAction::StartJobInstance {
            entity_name,
            job_name,
            arguments,
            offset,
            interval,
        } => {
            let date = match offset {
                Some(seconds) if seconds > 0.0 => {
                    OrderDate::At(now_millis() + (seconds * 1000.0) as u64)
                }
                _ => OrderDate::Now,
            };
            let job = JobLaunch {
                entity_name,
                job_name,
                arguments: stringify(&arguments),
                date,
                interval,
            };
            start_job(director, attempt, function, &scenario, job).await
        }
        FunctionAction::StopJobInstances {
            openbach_function_ids,
        } => stop_jobs(director, attempt, &openbach_function_ids).await,
        FunctionAction::RestartJobInstance {
            openbach_function_id,
            arguments,
            interval,
        } => {
            let target = definition.function(openbach_function_id).ok_or_else(|| {
                OpenbachError::bad_request(format!("No openbach function {}", openbach_function_id))
            })?;
            restart_job(director, attempt, target, &scenario, stringify(&arguments), interval).await
        }
        FunctionAction::StartScenarioInstance {
            scenario_name,
            arguments,
        } => {
            let child = director.launch(&scenario_name, arguments, scenario.owner.clone(), Some(attempt))?;
            director.store().record_started_scenario(attempt, child);
            Ok(())
        }
        FunctionAction::StopScenarioInstance {
            openbach_function_id,
        } => {
            let child = director
                .store()
                .latest_attempt(attempt.scenario_id, openbach_function_id)
                .and_then(|a| a.started_scenario)
                .ok_or_else(|| {
                    OpenbachError::not_found(format!(
                        "Openbach function {} started no scenario instance",
                        openbach_function_id
                    ))
                })?;
            director.stop_scenario(child)
        }
        FunctionAction::StatusJobInstance {
            openbach_function_id,
        } => refresh_job_status(director, attempt, openbach_function_id).await,
        FunctionAction::RestartAgent {
            entity_name,
            reload,
        } => {
            let address = director.catalog().agent(&entity_name)?.address();
            director.connector().restart_agent(&address, reload).await?;
            info!("Agent {} restarted (reload: {})", address, reload);
            Ok(())
        }
        FunctionAction::PushFile {
            entity_name,
            local_path,
            remote_path,
            users,
            groups,
            removes,
        } => {
            let files = pushed_files(&local_path, &remote_path, &users, &groups, &removes)?;
            let host = director.catalog().agent(&entity_name)?.host.clone();
            for file in &files {
                director.connector().push_file(&host, file).await?;
            }
            Ok(())
        }
        FunctionAction::PullFile {
            entity_name,
            remote_path,
            local_path,
        } => {
            let host = director.catalog().agent(&entity_name)?.host.clone();
            director
                .connector()
                .pull_file(&host, &remote_path, &local_path)
                .await
        }
    }
}

/// Substitute placeholders in the raw action, then decode it.
pub(crate) fn resolve_action(
    function: &FunctionDefinition,
    parameters: &HashMap<String, Value>,
) -> OpenbachResult<FunctionAction> {
    let resolver = Resolver::new(parameters)?;
    let resolved = resolver.resolve(&Value::Object(function.action.clone()))?;
    serde_json::from_value(resolved).map_err(|e| {
        OpenbachError::bad_request(format!("Invalid action for {}: {}", function.display_name(), e))
    })
}

/// Job arguments travel as strings; JSON strings lose their quotes.
fn stringify(arguments: &[Value]) -> Vec<String> {
    arguments
        .iter()
        .map(|argument| match argument {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect()
}

struct JobLaunch {
    entity_name: String,
    job_name: String,
    arguments: Vec<String>,
    date: OrderDate,
    interval: Option<u64>,
}

async fn start_job(
    director: &Director,
    attempt: AttemptRef,
    function: &FunctionDefinition,
    scenario: &ScenarioInstance,
    job: JobLaunch,
) -> OpenbachResult<()> {
    let address = director.catalog().agent(&job.entity_name)?.address();
    let store = director.store();
    let job_id = store.create_job(NewJob {
        job_name: job.job_name.clone(),
        entity_name: job.entity_name.clone(),
        agent_address: address.clone(),
        attempt,
    });
    director
        .poller()
        .watch(job_id, function.on_fail.unreachable_budget())
        .await;

    let order = StartOrder {
        name: job.job_name.clone(),
        instance_id: job_id,
        scenario_id: scenario.id,
        owner_id: scenario.owner_scenario_id,
        arguments: job.arguments,
        date: job.date,
        interval: job.interval,
    };
    match director.connector().start_job(&address, order).await {
        Ok(_) => {
            store.update_job(job_id, |job| job.dispatched = true);
            info!("Job {} started on {} as instance {}", job.job_name, address, job_id);
            Ok(())
        }
        Err(e) if e.is_warning() => {
            store.update_job(job_id, |job| job.dispatched = true);
            Err(e)
        }
        Err(e) => {
            director.poller().unwatch(job_id).await;
            store.update_job(job_id, |job| {
                job.set_status(JobInstanceStatus::NotScheduled, now_millis())
            });
            Err(e)
        }
    }
}

/// Job started by the latest attempt of `function_id`.
fn started_job(
    director: &Director,
    attempt: AttemptRef,
    function_id: FunctionId,
) -> OpenbachResult<JobInstance> {
    director
        .store()
        .latest_attempt(attempt.scenario_id, function_id)
        .and_then(|a| a.started_job)
        .and_then(|job_id| director.store().job(job_id))
        .ok_or_else(|| {
            OpenbachError::not_found(format!("Openbach function {} started no job", function_id))
        })
}

/// Ask the agent for the current status of a job and record it.
async fn refresh_job_status(
    director: &Director,
    attempt: AttemptRef,
    function_id: FunctionId,
) -> OpenbachResult<()> {
    let job = started_job(director, attempt, function_id)?;
    let status = director
        .connector()
        .job_status(&job.agent_address, &job.job_name, job.id)
        .await?;
    let now = now_millis();
    director.store().update_job(job.id, |job| {
        job.last_reached = Some(now);
        job.set_status(status.into(), now);
    });
    info!("Job instance {} ({}) is {}", job.id, job.job_name, status);
    Ok(())
}

async fn stop_jobs(
    director: &Director,
    attempt: AttemptRef,
    function_ids: &[FunctionId],
) -> OpenbachResult<()> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for function_id in function_ids {
        let outcome = match started_job(director, attempt, *function_id) {
            Ok(job) => stop_job(director, &job).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_warning() => warnings.push(e.message().to_string()),
            Err(e) => errors.push(e),
        }
    }

    match errors.len() {
        0 if warnings.is_empty() => Ok(()),
        0 => Err(OpenbachError::warning(warnings.join("; "))),
        1 => Err(errors.remove(0)),
        _ => Err(OpenbachError::unprocessable(
            errors
                .iter()
                .map(|e| e.message())
                .collect::<Vec<_>>()
                .join("; "),
        )),
    }
}

/// Send a stop order and record the job as stopped.
pub(crate) async fn stop_job(director: &Director, job: &JobInstance) -> OpenbachResult<()> {
    let already_stopped = job.status == JobInstanceStatus::Stopped;
    let order = StopOrder {
        name: job.job_name.clone(),
        instance_id: job.id,
        date: OrderDate::Now,
    };
    let result = director.connector().stop_job(&job.agent_address, order).await;
    if result.as_ref().is_err_and(|e| !e.is_warning()) {
        return result;
    }
    director.poller().unwatch(job.id).await;
    director.store().update_job(job.id, |job| {
        job.set_status(JobInstanceStatus::Stopped, now_millis())
    });

    if already_stopped {
        return Err(OpenbachError::warning(format!(
            "Job instance {} ({}) was already stopped",
            job.id, job.job_name
        )));
    }
    result
}

async fn restart_job(
    director: &Director,
    attempt: AttemptRef,
    target: &FunctionDefinition,
    scenario: &ScenarioInstance,
    arguments: Vec<String>,
    interval: Option<u64>,
) -> OpenbachResult<()> {
    let job = started_job(director, attempt, target.id)?;
    let order = StartOrder {
        name: job.job_name.clone(),
        instance_id: job.id,
        scenario_id: scenario.id,
        owner_id: scenario.owner_scenario_id,
        arguments,
        date: OrderDate::Now,
        interval,
    };

    director.poller().unwatch(job.id).await;
    let result = director.connector().restart_job(&job.agent_address, order).await;
    if result.as_ref().is_ok() || result.as_ref().is_err_and(|e| e.is_warning()) {
        director.store().update_job(job.id, |job| {
            job.status = JobInstanceStatus::Scheduled;
            job.stop_date = None;
            job.dispatched = true;
        });
        info!("Job instance {} ({}) restarted", job.id, job.job_name);
    }
    director
        .poller()
        .watch(job.id, target.on_fail.unreachable_budget())
        .await;
    result.map(|_| ())
}
