//! CLI argument parsing for the OpenBACH director.
//!
//! This module handles command line argument parsing using clap and provides
//! a structured representation of CLI configuration that can be used by
//! other configuration components.

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub verbose: bool,
    pub log_level: Option<String>,
    pub socket: String,
    pub scenarios_dirs: Vec<String>,
    pub entities: Option<String>,
    pub poll_interval_ms: u64,
    pub busy_tick_ms: u64,
    pub idle_tick_ms: u64,
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let socket = matches
            .get_one::<String>("socket")
            .ok_or_else(|| anyhow::anyhow!("Socket path is required"))?
            .clone();
        let scenarios_dirs = matches
            .get_many::<String>("scenarios-dir")
            .map(|dirs| dirs.cloned().collect())
            .unwrap_or_default();
        let millis = |name: &str| {
            matches
                .get_one::<u64>(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("--{} is required", name))
        };

        Ok(Self {
            verbose: matches.get_flag("verbose"),
            log_level: matches.get_one::<String>("log-level").cloned(),
            socket,
            scenarios_dirs,
            entities: matches.get_one::<String>("entities").cloned(),
            poll_interval_ms: millis("poll-interval-ms")?,
            busy_tick_ms: millis("busy-tick-ms")?,
            idle_tick_ms: millis("idle-tick-ms")?,
        })
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("openbach-director")
            .version(env!("CARGO_PKG_VERSION"))
            .about("OpenBACH director - scenario executor")
            .long_about(
                "Controller daemon that runs scenario instances: it launches OpenBACH \
                 functions once their wait conditions clear, dispatches job orders to \
                 agents and polls their status until every function has ended.",
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help(
                        "Enable verbose debug logging. This will show every request received, \
                         function launches and status poller activity.",
                    ),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: error, warn, info, debug or trace")
                    .value_parser(["error", "warn", "info", "debug", "trace"]),
            )
            .arg(
                Arg::new("socket")
                    .long("socket")
                    .value_name("PATH")
                    .help("Unix socket the director listens on")
                    .default_value("/run/openbach/director.sock"),
            )
            .arg(
                Arg::new("scenarios-dir")
                    .long("scenarios-dir")
                    .value_name("DIRECTORY")
                    .help("Directory of json5 scenario definitions (repeatable)")
                    .long_help(
                        "Directory of json5 scenario definitions. May be given several times; \
                         a scenario found in a later directory overrides one with the same \
                         name from an earlier directory.",
                    )
                    .action(clap::ArgAction::Append)
                    .default_value("/opt/openbach/controller/scenarios"),
            )
            .arg(
                Arg::new("entities")
                    .long("entities")
                    .value_name("FILE")
                    .help("json5 map of entity names to agent addresses")
                    .long_help(
                        "json5 file mapping each entity name to the address of its agent, \
                         as \"host\" or \"host:port\". The port defaults to 1112.",
                    ),
            )
            .arg(
                Arg::new("poll-interval-ms")
                    .long("poll-interval-ms")
                    .value_name("MILLIS")
                    .help("Period of job status polling")
                    .value_parser(clap::value_parser!(u64))
                    .default_value("2000"),
            )
            .arg(
                Arg::new("busy-tick-ms")
                    .long("busy-tick-ms")
                    .value_name("MILLIS")
                    .help("Scenario loop period while functions are pending")
                    .value_parser(clap::value_parser!(u64))
                    .default_value("200"),
            )
            .arg(
                Arg::new("idle-tick-ms")
                    .long("idle-tick-ms")
                    .value_name("MILLIS")
                    .help("Scenario loop period while only jobs are running")
                    .value_parser(clap::value_parser!(u64))
                    .default_value("1000"),
            )
    }

    /// Validate CLI configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket.is_empty() {
            return Err(anyhow::anyhow!("Socket path cannot be empty"));
        }
        if self.scenarios_dirs.iter().any(|dir| dir.is_empty()) {
            return Err(anyhow::anyhow!("Scenario directories cannot be empty"));
        }
        if self.poll_interval_ms == 0 || self.busy_tick_ms == 0 || self.idle_tick_ms == 0 {
            return Err(anyhow::anyhow!("Polling periods must be greater than 0"));
        }
        Ok(())
    }
}
