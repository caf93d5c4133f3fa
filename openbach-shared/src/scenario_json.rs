//! JSON5 scenario file parsing and structural validation.
//!
//! Scenario files look like:
//!
//! ```json5
//! {
//!     name: "rate_test",
//!     constants: { server_ip: "192.168.1.2" },
//!     arguments: { duration: "Test duration in seconds" },
//!     openbach_functions: [
//!         { id: 1, start_job_instance: { entity_name: "server", job_name: "iperf3", arguments: ["-s"] } },
//!         {
//!             id: 2,
//!             wait: { running_ids: [1], time: 2 },
//!             on_fail: { policy: "Retry", retry: 2, delay: 5 },
//!             start_job_instance: { entity_name: "client", job_name: "iperf3", arguments: ["-c", "$server_ip", "-t", "$duration"] },
//!         },
//!         { id: 3, wait: { finished_ids: [2] }, stop_job_instances: { openbach_function_ids: [1] } },
//!     ],
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use thiserror::Error;

use crate::scenario::{FUNCTION_ACTIONS, FunctionId, ScenarioDefinition};

/// Errors produced while loading a scenario file.
#[derive(Error, Debug)]
pub enum ScenarioParseError {
    #[error("JSON5 parse error: {0}")]
    Json5Error(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parse a scenario from a JSON5 string, without validation.
pub fn parse_scenario_json5(json5_content: &str) -> Result<ScenarioDefinition, ScenarioParseError> {
    json5::from_str(json5_content).map_err(|e| ScenarioParseError::Json5Error(e.to_string()))
}

/// Parse and validate a scenario from a JSON5 string.
pub fn parse_scenario(json5_content: &str) -> Result<ScenarioDefinition, ScenarioParseError> {
    let scenario = parse_scenario_json5(json5_content)?;
    validate_scenario(&scenario)?;
    Ok(scenario)
}

/// Parse a scenario from a file path.
pub fn parse_scenario_file(path: &Path) -> Result<ScenarioDefinition, ScenarioParseError> {
    let content = std::fs::read_to_string(path)?;
    parse_scenario(&content)
}

/// Check function ids, action keys and that wait conditions form a DAG.
pub fn validate_scenario(scenario: &ScenarioDefinition) -> Result<(), ScenarioParseError> {
    let invalid = |message: String| {
        Err(ScenarioParseError::ValidationError(format!(
            "scenario '{}': {}",
            scenario.name, message
        )))
    };

    if scenario.name.trim().is_empty() {
        return invalid("name cannot be empty".to_string());
    }

    let mut ids = HashSet::new();
    for function in &scenario.openbach_functions {
        if !ids.insert(function.id) {
            return invalid(format!("duplicate openbach function id {}", function.id));
        }
        match function.action.len() {
            1 => {}
            0 => return invalid(format!("openbach function {} has no action", function.id)),
            _ => {
                let keys: Vec<_> = function.action.keys().cloned().collect();
                return invalid(format!(
                    "openbach function {} has several actions or unknown keys: {}",
                    function.id,
                    keys.join(", ")
                ));
            }
        }
        if let Some(name) = function.action_name() {
            if !FUNCTION_ACTIONS.contains(&name) {
                return invalid(format!(
                    "openbach function {} uses the unsupported action '{}'",
                    function.id, name
                ));
            }
        }
        if function.wait.time < 0.0 {
            return invalid(format!(
                "openbach function {} has a negative wait time",
                function.id
            ));
        }
    }

    for function in &scenario.openbach_functions {
        for (kind, waited) in function.wait.conditions() {
            if waited == function.id {
                return invalid(format!("openbach function {} waits on itself", function.id));
            }
            if !ids.contains(&waited) {
                return invalid(format!(
                    "openbach function {} has a {:?} wait on unknown function {}",
                    function.id, kind, waited
                ));
            }
        }
    }

    if let Some(id) = find_cycle(scenario) {
        return invalid(format!(
            "wait conditions form a cycle through openbach function {}",
            id
        ));
    }

    Ok(())
}

/// Kahn's algorithm over the wait graph; returns a function left on a cycle.
fn find_cycle(scenario: &ScenarioDefinition) -> Option<FunctionId> {
    let mut pending: HashMap<FunctionId, usize> = HashMap::new();
    let mut dependents: HashMap<FunctionId, Vec<FunctionId>> = HashMap::new();

    for function in &scenario.openbach_functions {
        let waited: HashSet<_> = function.wait.conditions().map(|(_, id)| id).collect();
        pending.insert(function.id, waited.len());
        for id in waited {
            dependents.entry(id).or_default().push(function.id);
        }
    }

    let mut ready: VecDeque<_> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if visited == pending.len() {
        None
    } else {
        pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{FailurePolicy, WaitKind};

    const RATE_TEST: &str = r#"{
        name: "rate_test",
        constants: { server_ip: "192.168.1.2" },
        arguments: { duration: "Test duration" },
        openbach_functions: [
            { id: 1, start_job_instance: { entity_name: "server", job_name: "iperf3", arguments: ["-s"] } },
            {
                id: 2,
                label: "client",
                wait: { running_ids: [1], time: 2 },
                on_fail: { policy: "Retry", retry: 2, delay: 5 },
                start_job_instance: { entity_name: "client", job_name: "iperf3", arguments: ["-c", "$server_ip"] },
            },
            { id: 3, wait: { finished_ids: [2] }, stop_job_instances: { openbach_function_ids: [1] } },
        ],
    }"#;

    #[test]
    fn test_parse_valid_scenario() {
        let scenario = parse_scenario(RATE_TEST).unwrap();
        assert_eq!(scenario.name, "rate_test");
        assert_eq!(scenario.openbach_functions.len(), 3);

        let client = scenario.function(2).unwrap();
        assert_eq!(client.on_fail.policy, FailurePolicy::Retry);
        assert_eq!(client.on_fail.retry, Some(2));
        assert_eq!(
            client.wait.conditions().collect::<Vec<_>>(),
            vec![(WaitKind::Running, 1)]
        );
        assert_eq!(
            scenario.function(3).unwrap().action_name(),
            Some("stop_job_instances")
        );
    }

    #[test]
    fn test_reject_unknown_wait_target() {
        let content = r#"{
            name: "broken",
            openbach_functions: [
                { id: 1, wait: { ended_ids: [7] }, stop_scenario_instance: { openbach_function_id: 2 } },
            ],
        }"#;
        let error = parse_scenario(content).unwrap_err();
        assert!(error.to_string().contains("unknown function 7"));
    }

    #[test]
    fn test_reject_cycle() {
        let content = r#"{
            name: "loop",
            openbach_functions: [
                { id: 1, wait: { finished_ids: [2] }, stop_job_instances: { openbach_function_ids: [] } },
                { id: 2, wait: { ended_ids: [1] }, stop_job_instances: { openbach_function_ids: [] } },
            ],
        }"#;
        let error = parse_scenario(content).unwrap_err();
        assert!(error.to_string().contains("cycle"));
    }

    #[test]
    fn test_reject_duplicate_ids_and_unknown_action() {
        let duplicated = r#"{
            name: "dup",
            openbach_functions: [
                { id: 1, stop_job_instances: { openbach_function_ids: [] } },
                { id: 1, stop_job_instances: { openbach_function_ids: [] } },
            ],
        }"#;
        assert!(
            parse_scenario(duplicated)
                .unwrap_err()
                .to_string()
                .contains("duplicate")
        );

        let unknown = r#"{
            name: "if",
            openbach_functions: [ { id: 1, if: { condition: {} } } ],
        }"#;
        assert!(
            parse_scenario(unknown)
                .unwrap_err()
                .to_string()
                .contains("unsupported action 'if'")
        );
    }

    #[test]
    fn test_invalid_json5() {
        assert!(matches!(
            parse_scenario("{ this is not json5 }}}"),
            Err(ScenarioParseError::Json5Error(_))
        ));
    }
}
