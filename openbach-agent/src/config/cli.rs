//! CLI argument parsing for the OpenBACH agent.
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
    pub listen: String,
    pub port: Option<u16>,
    pub jobs_dir: String,
    pub instances_dir: String,
    pub workers: usize,
    pub signal_exit_is_error: bool,
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let listen = matches
            .get_one::<String>("listen")
            .ok_or_else(|| anyhow::anyhow!("Listen address is required"))?
            .clone();
        let jobs_dir = matches
            .get_one::<String>("jobs-dir")
            .ok_or_else(|| anyhow::anyhow!("Jobs directory is required"))?
            .clone();
        let instances_dir = matches
            .get_one::<String>("instances-dir")
            .ok_or_else(|| anyhow::anyhow!("Instances directory is required"))?
            .clone();
        let workers = *matches
            .get_one::<usize>("workers")
            .ok_or_else(|| anyhow::anyhow!("Worker count is required"))?;

        Ok(Self {
            verbose: matches.get_flag("verbose"),
            log_level: matches.get_one::<String>("log-level").cloned(),
            listen,
            port: matches.get_one::<u16>("port").copied(),
            jobs_dir,
            instances_dir,
            workers,
            signal_exit_is_error: matches.get_flag("signal-exit-is-error"),
        })
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("openbach-agent")
            .version(env!("CARGO_PKG_VERSION"))
            .about("OpenBACH agent - job instance scheduler")
            .long_about(
                "Per-host daemon that installs measurement jobs, launches and stops their \
                 instances on request (immediately, at a date or on an interval) and \
                 reports their status to the director.",
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help(
                        "Enable verbose debug logging. This will show every request received, \
                         timer activity and process lifecycle events.",
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
                Arg::new("listen")
                    .long("listen")
                    .value_name("ADDRESS")
                    .help("Address to listen on")
                    .default_value("0.0.0.0"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("TCP port to listen on (default 1112)")
                    .long_help(
                        "TCP port to listen on. Falls back to the OPENBACH_AGENT_PORT \
                         environment variable, then to 1112.",
                    )
                    .value_parser(clap::value_parser!(u16)),
            )
            .arg(
                Arg::new("jobs-dir")
                    .long("jobs-dir")
                    .value_name("DIRECTORY")
                    .help("Directory holding installed job descriptors")
                    .default_value("/opt/openbach/agent/jobs"),
            )
            .arg(
                Arg::new("instances-dir")
                    .long("instances-dir")
                    .value_name("DIRECTORY")
                    .help("Directory holding pending start/stop records")
                    .long_help(
                        "Directory where start and stop orders that are not immediate are \
                         persisted, so they can be replayed after an agent restart.",
                    )
                    .default_value("/opt/openbach/agent/job_instances"),
            )
            .arg(
                Arg::new("workers")
                    .long("workers")
                    .value_name("COUNT")
                    .help("Number of concurrent process launches and stops")
                    .value_parser(clap::value_parser!(usize))
                    .default_value("50"),
            )
            .arg(
                Arg::new("signal-exit-is-error")
                    .long("signal-exit-is-error")
                    .action(clap::ArgAction::SetTrue)
                    .help("Report jobs killed by a signal as failed")
                    .long_help(
                        "Record a return code of -1 instead of 0 for job processes that exit \
                         without a return code, so their status reads Error.",
                    ),
            )
    }

    /// Validate CLI configuration
    pub fn validate(&self) -> Result<()> {
        if self.jobs_dir.is_empty() {
            return Err(anyhow::anyhow!("Jobs directory cannot be empty"));
        }
        if self.instances_dir.is_empty() {
            return Err(anyhow::anyhow!("Instances directory cannot be empty"));
        }
        if self.workers == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }
        if self.port == Some(0) {
            return Err(anyhow::anyhow!("Port must be greater than 0"));
        }
        Ok(())
    }
}
