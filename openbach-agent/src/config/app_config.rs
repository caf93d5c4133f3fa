//! Application configuration management for the OpenBACH agent.
//!
//! This module handles application-specific configuration including logging,
//! the listening address and the job scheduler settings.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use openbach_shared::DEFAULT_AGENT_PORT;

use super::cli::CliConfig;
use crate::jobs::{ExitCodePolicy, ManagerConfig};

/// Environment variable overriding the default listening port.
pub const PORT_ENV: &str = "OPENBACH_AGENT_PORT";

/// Log level enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub listen: IpAddr,
    pub port: u16,
    pub jobs_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub workers: usize,
    pub exit_policy: ExitCodePolicy,
}

impl AppConfig {
    /// Create application configuration from CLI config
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        let log_level = if cli_config.verbose {
            LogLevel::Debug
        } else if let Some(level) = &cli_config.log_level {
            Self::parse_log_level(level)
        } else {
            match env::var("RUST_LOG") {
                Ok(level_str) => Self::parse_log_level(&level_str),
                Err(_) => LogLevel::Info,
            }
        };

        let port = match cli_config.port {
            Some(port) => port,
            None => match env::var(PORT_ENV) {
                Ok(value) => value
                    .parse()
                    .with_context(|| format!("Invalid {} value '{}'", PORT_ENV, value))?,
                Err(_) => DEFAULT_AGENT_PORT,
            },
        };

        let listen = cli_config
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", cli_config.listen))?;

        Ok(Self {
            log_level,
            listen,
            port,
            jobs_dir: PathBuf::from(&cli_config.jobs_dir),
            instances_dir: PathBuf::from(&cli_config.instances_dir),
            workers: cli_config.workers,
            exit_policy: if cli_config.signal_exit_is_error {
                ExitCodePolicy::TreatAsError
            } else {
                ExitCodePolicy::AssumeSuccess
            },
        })
    }

    /// Parse log level from string
    pub fn parse_log_level(level_str: &str) -> LogLevel {
        // Extract the main log level from complex RUST_LOG format
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            jobs_dir: self.jobs_dir.clone(),
            instances_dir: self.instances_dir.clone(),
            workers: self.workers,
            exit_policy: self.exit_policy,
        }
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        let filter = match env::var("RUST_LOG") {
            Ok(existing) if !existing.is_empty() && self.log_level == LogLevel::Info => {
                EnvFilter::try_new(existing)?
            }
            _ => EnvFilter::try_new(self.log_level.to_filter_string())?,
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        tracing::info!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Validate application configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Port must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }
        if self.jobs_dir == self.instances_dir {
            return Err(anyhow::anyhow!(
                "Jobs and instances directories must differ"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliConfig {
        CliConfig {
            verbose: false,
            log_level: None,
            listen: "127.0.0.1".to_string(),
            port: Some(1112),
            jobs_dir: "/opt/openbach/agent/jobs".to_string(),
            instances_dir: "/opt/openbach/agent/job_instances".to_string(),
            workers: 50,
            signal_exit_is_error: false,
        }
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(AppConfig::parse_log_level("debug"), LogLevel::Debug);
        assert_eq!(AppConfig::parse_log_level("WARN"), LogLevel::Warn);
        assert_eq!(
            AppConfig::parse_log_level("trace,tokio=warn"),
            LogLevel::Trace
        );
        assert_eq!(AppConfig::parse_log_level("bogus"), LogLevel::Info);
    }

    #[test]
    fn test_verbose_wins() {
        let config = AppConfig::from_cli(&CliConfig {
            verbose: true,
            log_level: Some("error".to_string()),
            ..cli()
        })
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_from_cli() {
        let config = AppConfig::from_cli(&CliConfig {
            signal_exit_is_error: true,
            ..cli()
        })
        .unwrap();
        assert_eq!(config.socket_addr(), "127.0.0.1:1112".parse().unwrap());
        assert_eq!(config.exit_policy, ExitCodePolicy::TreatAsError);
        assert_eq!(config.manager_config().workers, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let result = AppConfig::from_cli(&CliConfig {
            listen: "not an address".to_string(),
            ..cli()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_same_directories_rejected() {
        let config = AppConfig::from_cli(&CliConfig {
            instances_dir: "/opt/openbach/agent/jobs".to_string(),
            ..cli()
        })
        .unwrap();
        assert!(config.validate().is_err());
    }
}
