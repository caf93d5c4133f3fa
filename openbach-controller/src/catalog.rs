//! Catalog - File-based scenario definitions and entity addressing.
//!
//! Scenarios are read from every `.json5` file in the configured directories;
//! later directories override scenarios with the same name from earlier ones.
//! Entities are read from a single json5 map of `entity name -> host[:port]`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use openbach_shared::DEFAULT_AGENT_PORT;
use openbach_shared::errors::{OpenbachError, OpenbachResult};
use openbach_shared::scenario::ScenarioDefinition;
use openbach_shared::scenario_json::parse_scenario_file;

/// Network location of an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    /// Parse `host` or `host:port`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            anyhow::bail!("Agent address cannot be empty");
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => Ok(Self {
                host: host.to_string(),
                port: port
                    .parse()
                    .with_context(|| format!("Invalid port in agent address '{}'", value))?,
            }),
            _ => Ok(Self {
                host: value.to_string(),
                port: DEFAULT_AGENT_PORT,
            }),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Scenario definitions and entity addresses known to the director.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scenarios: HashMap<String, ScenarioDefinition>,
    entities: HashMap<String, AgentEndpoint>,
}

impl Catalog {
    /// Build a catalog from already parsed parts.
    pub fn from_parts(
        scenarios: impl IntoIterator<Item = ScenarioDefinition>,
        entities: HashMap<String, AgentEndpoint>,
    ) -> Self {
        Self {
            scenarios: scenarios
                .into_iter()
                .map(|scenario| (scenario.name.clone(), scenario))
                .collect(),
            entities,
        }
    }

    /// Load scenarios from `directories` and entities from `entities_file`.
    pub fn load(directories: &[PathBuf], entities_file: Option<&Path>) -> Result<Self> {
        let mut scenarios: HashMap<String, ScenarioDefinition> = HashMap::new();

        for dir in directories {
            if !dir.exists() {
                debug!("Scenario directory does not exist, skipping: {:?}", dir);
                continue;
            }
            let loaded = load_from_directory(dir)
                .with_context(|| format!("Failed to load scenarios from {:?}", dir))?;
            let count = loaded.len();
            for scenario in loaded {
                if scenarios.contains_key(&scenario.name) {
                    debug!(
                        "Scenario '{}' from {:?} overrides previous definition",
                        scenario.name, dir
                    );
                }
                scenarios.insert(scenario.name.clone(), scenario);
            }
            if count > 0 {
                info!("Loaded {} scenarios from {:?}", count, dir);
            }
        }

        let entities = match entities_file {
            Some(path) => load_entities(path)?,
            None => HashMap::new(),
        };
        info!(
            "Catalog ready: {} scenarios, {} entities",
            scenarios.len(),
            entities.len()
        );

        Ok(Self {
            scenarios,
            entities,
        })
    }

    pub fn scenario(&self, name: &str) -> OpenbachResult<&ScenarioDefinition> {
        self.scenarios
            .get(name)
            .ok_or_else(|| OpenbachError::not_found(format!("No scenario named {}", name)))
    }

    pub fn scenario_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scenarios.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn agent(&self, entity_name: &str) -> OpenbachResult<&AgentEndpoint> {
        self.entities.get(entity_name).ok_or_else(|| {
            OpenbachError::bad_request(format!("Entity {} has no agent", entity_name))
        })
    }
}

fn load_from_directory(dir: &Path) -> Result<Vec<ScenarioDefinition>> {
    let mut scenarios = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {:?}", dir))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json5") {
            continue;
        }

        debug!("Loading scenario from {:?}", path);
        match parse_scenario_file(&path) {
            Ok(scenario) => scenarios.push(scenario),
            Err(e) => warn!("Failed to load scenario from {:?}: {}", path, e),
        }
    }

    Ok(scenarios)
}

/// Parse an entities map such as `{ client: "10.0.0.2", server: "10.0.0.3:2112" }`.
pub fn parse_entities(content: &str) -> Result<HashMap<String, AgentEndpoint>> {
    let raw: HashMap<String, String> =
        json5::from_str(content).map_err(|e| anyhow::anyhow!("Invalid entities file: {}", e))?;
    raw.into_iter()
        .map(|(name, address)| {
            let endpoint = AgentEndpoint::parse(&address)
                .with_context(|| format!("Invalid address for entity '{}'", name))?;
            Ok((name, endpoint))
        })
        .collect()
}

fn load_entities(path: &Path) -> Result<HashMap<String, AgentEndpoint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read entities file {:?}", path))?;
    parse_entities(&content).with_context(|| format!("Failed to parse entities file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scenario_file(name: &str, job: &str) -> String {
        format!(
            r#"{{
    name: "{}",
    openbach_functions: [
        {{ id: 1, start_job_instance: {{ entity_name: "client", job_name: "{}" }} }},
    ],
}}"#,
            name, job
        )
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            AgentEndpoint::parse("10.0.0.2").unwrap(),
            AgentEndpoint {
                host: "10.0.0.2".to_string(),
                port: 1112
            }
        );
        assert_eq!(
            AgentEndpoint::parse("agent.local:2112").unwrap().address(),
            "agent.local:2112"
        );
        assert!(AgentEndpoint::parse("agent:http").is_err());
        assert!(AgentEndpoint::parse("  ").is_err());
    }

    #[test]
    fn test_load_with_override() {
        let system = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        fs::write(system.path().join("rate.json5"), scenario_file("rate", "iperf3")).unwrap();
        fs::write(system.path().join("ping.json5"), scenario_file("ping", "fping")).unwrap();
        fs::write(system.path().join("notes.txt"), "ignored").unwrap();
        fs::write(system.path().join("broken.json5"), "{ nope").unwrap();
        fs::write(user.path().join("rate.json5"), scenario_file("rate", "nuttcp")).unwrap();

        let entities = system.path().join("entities.json5");
        fs::write(&entities, r#"{ client: "10.0.0.2", server: "10.0.0.3:2112" }"#).unwrap();

        let catalog = Catalog::load(
            &[
                system.path().to_path_buf(),
                user.path().to_path_buf(),
                PathBuf::from("/nonexistent/openbach/scenarios"),
            ],
            Some(&entities),
        )
        .unwrap();

        assert_eq!(catalog.scenario_names(), vec!["ping", "rate"]);
        let rate = catalog.scenario("rate").unwrap();
        assert_eq!(
            rate.openbach_functions[0].action["start_job_instance"]["job_name"],
            "nuttcp"
        );
        assert_eq!(catalog.agent("server").unwrap().port, 2112);
        assert!(matches!(
            catalog.agent("router"),
            Err(OpenbachError::BadRequest { .. })
        ));
        assert!(matches!(
            catalog.scenario("missing"),
            Err(OpenbachError::NotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_entities_file() {
        assert!(parse_entities("{ client: 12 }").is_err());
        assert!(parse_entities("{ client: \"host:99999\" }").is_err());
    }
}
