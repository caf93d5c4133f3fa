//! Integration tests for the job scheduler
//!
//! These tests install small shell jobs in a temporary directory and drive
//! real processes through the [`JobManager`].

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use openbach_agent::jobs::{ExitCodePolicy, JobManager, ManagerConfig, RecordKind};
use openbach_shared::errors::OpenbachError;
use openbach_shared::now_millis;
use openbach_shared::protocol::{JobStatus, OrderDate, StartOrder, StopOrder};

/// Runs its single argument as a shell script.
const SHELL_JOB: &str = r#"{
    general: { job_version: "1.0", command: "/bin/sh -c", persistent: false },
    arguments: { required: [ { name: "script", count: 1 } ] },
}"#;

struct Agent {
    temp: TempDir,
    manager: JobManager,
}

impl Agent {
    fn new(policy: ExitCodePolicy) -> Self {
        let temp = TempDir::new().unwrap();
        Self::in_dir(temp, policy)
    }

    fn in_dir(temp: TempDir, policy: ExitCodePolicy) -> Self {
        let jobs_dir = temp.path().join("jobs");
        fs::create_dir_all(&jobs_dir).unwrap();
        fs::write(jobs_dir.join("shell.json5"), SHELL_JOB).unwrap();
        let stop_marker = temp.path().join("stopped");
        fs::write(
            jobs_dir.join("daemon.json5"),
            format!(
                r#"{{
                    general: {{
                        job_version: "2",
                        command: ["/bin/sleep"],
                        command_stop: ["/bin/sh", "-c", "touch {}"],
                        persistent: true,
                    }},
                    arguments: {{ required: [ {{ name: "duration", count: 1 }} ] }},
                }}"#,
                stop_marker.display()
            ),
        )
        .unwrap();

        let manager = JobManager::new(ManagerConfig {
            jobs_dir,
            instances_dir: temp.path().join("instances"),
            workers: 8,
            exit_policy: policy,
        });
        assert_eq!(manager.install_all(), 2);
        Self { temp, manager }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    fn start(&self, name: &str, instance_id: i64, argument: &str) -> Result<i64, OpenbachError> {
        self.manager.start_instance(order(name, instance_id, argument), false)
    }

    async fn wait_for(&self, name: &str, instance_id: i64, expected: JobStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
        loop {
            let status = self.manager.status_instance(name, instance_id).unwrap();
            if status == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} {} stuck in {} instead of {}",
                name,
                instance_id,
                status,
                expected
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn order(name: &str, instance_id: i64, argument: &str) -> StartOrder {
    StartOrder {
        name: name.to_string(),
        instance_id,
        scenario_id: 21,
        owner_id: 20,
        arguments: vec![argument.to_string()],
        date: OrderDate::Now,
        interval: None,
    }
}

fn stop(name: &str, instance_id: i64) -> StopOrder {
    StopOrder {
        name: name.to_string(),
        instance_id,
        date: OrderDate::Now,
    }
}

fn record_exists(agent: &Agent, name: &str, instance_id: i64, kind: RecordKind) -> bool {
    agent.manager.recovery().path(name, instance_id, kind).exists()
}

#[tokio::test]
async fn test_job_runs_with_environment() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    let output = agent.path("env.txt");
    let script = format!(
        "echo \"$JOB_NAME $JOB_INSTANCE_ID $SCENARIO_INSTANCE_ID $OWNER_SCENARIO_INSTANCE_ID\" > {}",
        output.display()
    );

    agent.start("shell", 7, &script).unwrap();
    agent.wait_for("shell", 7, JobStatus::NotRunning).await;

    assert_eq!(fs::read_to_string(output).unwrap().trim(), "shell 7 21 20");
    assert!(!record_exists(&agent, "shell", 7, RecordKind::Start));
}

#[tokio::test]
async fn test_failing_job_reports_error() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    agent.start("shell", 1, "exit 4").unwrap();
    agent.wait_for("shell", 1, JobStatus::Error).await;
}

#[tokio::test]
async fn test_signal_exit_policy() {
    let lenient = Agent::new(ExitCodePolicy::AssumeSuccess);
    lenient.start("shell", 1, "kill -9 $$").unwrap();
    lenient.wait_for("shell", 1, JobStatus::NotRunning).await;

    let strict = Agent::new(ExitCodePolicy::TreatAsError);
    strict.start("shell", 1, "kill -9 $$").unwrap();
    strict.wait_for("shell", 1, JobStatus::Error).await;
}

#[tokio::test]
async fn test_validation_errors() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);

    let missing = agent.manager.start_instance(
        StartOrder {
            arguments: vec![],
            ..order("shell", 1, "")
        },
        false,
    );
    assert!(matches!(missing, Err(OpenbachError::BadRequest { .. })));

    let extra = agent.manager.start_instance(
        StartOrder {
            arguments: vec!["true".to_string(), "extra".to_string()],
            ..order("shell", 1, "")
        },
        false,
    );
    assert!(matches!(extra, Err(OpenbachError::BadRequest { .. })));

    let zero_interval = agent.manager.start_instance(
        StartOrder {
            interval: Some(0),
            ..order("shell", 1, "true")
        },
        false,
    );
    assert!(matches!(zero_interval, Err(OpenbachError::BadRequest { .. })));

    let unknown = agent.start("fping", 1, "localhost");
    assert_eq!(
        unknown.unwrap_err(),
        OpenbachError::bad_request("No job fping is installed")
    );
}

#[tokio::test]
async fn test_stop_kills_and_runs_stop_command() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    agent.start("daemon", 3, "30").unwrap();
    agent.wait_for("daemon", 3, JobStatus::Running).await;

    let conflict = agent.start("daemon", 3, "30");
    assert!(conflict.unwrap_err().message().contains("already started"));

    agent.manager.stop_instance(stop("daemon", 3), false).unwrap();
    agent.wait_for("daemon", 3, JobStatus::Stopped).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !agent.path("stopped").exists() {
        assert!(tokio::time::Instant::now() < deadline, "stop command never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let again = agent.manager.stop_instance(stop("daemon", 3), false);
    assert!(again.unwrap_err().is_warning());
    agent.wait_for("daemon", 3, JobStatus::Stopped).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A stopped id can be reused by a fresh order.
    agent.start("daemon", 3, "30").unwrap();
    agent.wait_for("daemon", 3, JobStatus::Running).await;
    agent.manager.shutdown().await;
}

#[tokio::test]
async fn test_dated_orders_leave_records() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    let later = now_millis() + 60_000;

    agent
        .manager
        .start_instance(
            StartOrder {
                date: OrderDate::At(later),
                ..order("daemon", 9, "30")
            },
            false,
        )
        .unwrap();
    assert_eq!(
        agent.manager.status_instance("daemon", 9).unwrap(),
        JobStatus::Scheduled
    );
    assert!(record_exists(&agent, "daemon", 9, RecordKind::Start));

    agent
        .manager
        .stop_instance(
            StopOrder {
                date: OrderDate::At(later + 10_000),
                ..stop("daemon", 9)
            },
            false,
        )
        .unwrap();
    assert!(record_exists(&agent, "daemon", 9, RecordKind::Stop));

    agent.manager.stop_instance(stop("daemon", 9), false).unwrap();
    agent.wait_for("daemon", 9, JobStatus::Stopped).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!record_exists(&agent, "daemon", 9, RecordKind::Start));
    assert!(!record_exists(&agent, "daemon", 9, RecordKind::Stop));
}

#[tokio::test]
async fn test_interval_job_repeats() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    let ticks = agent.path("ticks");
    let script = format!("echo tick >> {}", ticks.display());

    agent
        .manager
        .start_instance(
            StartOrder {
                interval: Some(1),
                ..order("shell", 5, &script)
            },
            false,
        )
        .unwrap();
    assert!(record_exists(&agent, "shell", 5, RecordKind::Start));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let count = fs::read_to_string(&ticks).unwrap().lines().count();
    assert!(count >= 2, "only {} ticks", count);
    assert_eq!(
        agent.manager.status_instance("shell", 5).unwrap(),
        JobStatus::Running
    );

    agent.manager.stop_instance(stop("shell", 5), false).unwrap();
    agent.wait_for("shell", 5, JobStatus::Stopped).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!record_exists(&agent, "shell", 5, RecordKind::Start));
}

#[tokio::test]
async fn test_restart_instance_replaces_arguments() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    agent.start("shell", 2, "sleep 30").unwrap();
    agent.wait_for("shell", 2, JobStatus::Running).await;

    let id = agent
        .manager
        .restart_instance(order("shell", 2, "exit 0"))
        .await
        .unwrap();
    assert_eq!(id, 2);
    agent.wait_for("shell", 2, JobStatus::NotRunning).await;
}

#[tokio::test]
async fn test_recovery_replays_pending_orders() {
    let temp = TempDir::new().unwrap();
    let later = now_millis() + 60_000;

    let first = Agent::in_dir(temp, ExitCodePolicy::AssumeSuccess);
    first
        .manager
        .start_instance(
            StartOrder {
                date: OrderDate::At(later),
                ..order("daemon", 11, "30")
            },
            false,
        )
        .unwrap();
    first.manager.shutdown().await;
    assert!(record_exists(&first, "daemon", 11, RecordKind::Start));

    // A past one-shot order cannot be rescheduled and is dropped.
    let stale = first.manager.recovery().path("daemon", 12, RecordKind::Start);
    fs::write(
        &stale,
        r#"{"name":"daemon","instance_id":12,"scenario_id":0,"owner_id":0,"date":1000,"interval":null,"arguments":["1"]}"#,
    )
    .unwrap();

    let Agent { temp, .. } = first;
    let second = Agent::in_dir(temp, ExitCodePolicy::AssumeSuccess);
    second.manager.recover();

    assert_eq!(
        second.manager.status_instance("daemon", 11).unwrap(),
        JobStatus::Scheduled
    );
    assert_eq!(
        second.manager.status_instance("daemon", 12).unwrap(),
        JobStatus::NotScheduled
    );
    assert!(!stale.exists());
    second.manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_job_stops_instances() {
    let agent = Agent::new(ExitCodePolicy::AssumeSuccess);
    agent.start("daemon", 4, "30").unwrap();
    agent.wait_for("daemon", 4, JobStatus::Running).await;

    agent.manager.remove_job("daemon").unwrap();
    assert_eq!(agent.manager.job_names(), vec!["shell".to_string()]);
    assert!(agent.manager.status_instance("daemon", 4).is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !agent.path("stopped").exists() {
        assert!(tokio::time::Instant::now() < deadline, "stop command never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
