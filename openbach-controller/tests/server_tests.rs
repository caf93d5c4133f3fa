//! End-to-end tests of the director socket using the shared client.

mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::{Behavior, MockAgents, director};
use openbach_controller::server::DirectorServer;
use openbach_shared::client::{ClientConfig, request_unix};
use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::protocol::{DirectorCommand, Request};

struct RunningDirector {
    _temp: TempDir,
    socket: PathBuf,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<anyhow::Result<()>>,
}

fn spawn_director() -> RunningDirector {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("run").join("director.sock");
    let agents = MockAgents::new(&[("sleep", Behavior::RunFor(Duration::from_millis(50)))]);
    let director = director(
        agents,
        &[r#"{
            name: "nap",
            arguments: { length: "How long to sleep" },
            openbach_functions: [
                {
                    id: 1,
                    start_job_instance: { entity_name: "client", job_name: "sleep", arguments: ["$length"] },
                },
            ],
        }"#],
    );

    let server = DirectorServer::bind(&socket, director).unwrap();
    assert_eq!(server.path(), socket.as_path());
    let (shutdown, receiver) = watch::channel(false);
    let server = tokio::spawn(server.run(receiver));

    RunningDirector {
        _temp: temp,
        socket,
        shutdown,
        server,
    }
}

fn client() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_secs(5),
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
    }
}

async fn send(socket: &Path, command: &DirectorCommand) -> OpenbachResult<Value> {
    let request = Request::from_command(command).unwrap();
    request_unix(socket, &request, &client()).await
}

#[tokio::test]
async fn test_start_and_follow_a_scenario() {
    let running = spawn_director();

    let reply = send(
        &running.socket,
        &DirectorCommand::StartScenarioInstance {
            scenario_name: "nap".into(),
            arguments: HashMap::from([("length".to_string(), json!(1))]),
            owner: Some("carol".into()),
        },
    )
    .await
    .unwrap();
    let id = reply["scenario_instance_id"].as_u64().unwrap();

    let mut infos = Value::Null;
    for _ in 0..300 {
        infos = send(
            &running.socket,
            &DirectorCommand::InfosScenarioInstance {
                scenario_instance_id: id,
            },
        )
        .await
        .unwrap();
        if infos["status"] == "Finished OK" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(infos["status"], "Finished OK");
    assert_eq!(infos["scenario_name"], "nap");
    assert_eq!(infos["arguments"], json!({ "length": 1 }));
    assert_eq!(infos["openbach_functions"][0]["status"], "Finished");
    assert_eq!(infos["jobs"][0]["status"], "Not Running");

    let listed = send(&running.socket, &DirectorCommand::ListScenarioInstances {})
        .await
        .unwrap();
    assert_eq!(listed["scenario_instances"].as_array().unwrap().len(), 1);

    running.shutdown.send(true).unwrap();
    running.server.await.unwrap().unwrap();
    assert!(!running.socket.exists());
}

#[tokio::test]
async fn test_errors_come_back_as_ko() {
    let running = spawn_director();

    let unknown = Request {
        command_name: "launch_rockets".to_string(),
        command_arguments: json!({}),
    };
    assert_eq!(
        request_unix(&running.socket, &unknown, &client())
            .await
            .unwrap_err(),
        OpenbachError::unprocessable("Unknown action: launch_rockets")
    );

    let missing_argument = send(
        &running.socket,
        &DirectorCommand::StartScenarioInstance {
            scenario_name: "nap".into(),
            arguments: HashMap::new(),
            owner: None,
        },
    )
    .await
    .unwrap_err();
    assert!(missing_argument.message().contains("length"));

    let absent = send(
        &running.socket,
        &DirectorCommand::InfosScenarioInstance {
            scenario_instance_id: 99,
        },
    )
    .await;
    assert!(matches!(absent, Err(OpenbachError::Unprocessable { .. })));

    running.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("director.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let director = director(MockAgents::new(&[]), &[]);
    let server = DirectorServer::bind(&socket, director).unwrap();
    let (shutdown, receiver) = watch::channel(false);
    let server = tokio::spawn(server.run(receiver));

    let listed = send(&socket, &DirectorCommand::ListScenarioInstances {})
        .await
        .unwrap();
    assert_eq!(listed, json!({ "scenario_instances": [] }));

    shutdown.send(true).unwrap();
    server.await.unwrap().unwrap();
}
