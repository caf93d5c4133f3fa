//! Application configuration management for the OpenBACH director.
//!
//! This module handles application-specific configuration including logging,
//! the control socket, the scenario catalog and the executor cadence.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use super::cli::CliConfig;
use crate::catalog::Catalog;
use crate::director::DirectorConfig;

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
    pub socket: PathBuf,
    pub scenarios_dirs: Vec<PathBuf>,
    pub entities: Option<PathBuf>,
    pub director: DirectorConfig,
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

        Ok(Self {
            log_level,
            socket: PathBuf::from(&cli_config.socket),
            scenarios_dirs: cli_config.scenarios_dirs.iter().map(PathBuf::from).collect(),
            entities: cli_config.entities.as_ref().map(PathBuf::from),
            director: DirectorConfig {
                poll_interval: Duration::from_millis(cli_config.poll_interval_ms),
                busy_tick: Duration::from_millis(cli_config.busy_tick_ms),
                idle_tick: Duration::from_millis(cli_config.idle_tick_ms),
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

    /// Load the scenario catalog and entity map
    pub fn load_catalog(&self) -> Result<Catalog> {
        Catalog::load(&self.scenarios_dirs, self.entities.as_deref())
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
        if self.socket.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Socket path cannot be empty"));
        }
        if let Some(entities) = &self.entities {
            if !entities.is_file() {
                return Err(anyhow::anyhow!(
                    "Entities file {} does not exist",
                    entities.display()
                ));
            }
        }
        if self.director.idle_tick < self.director.busy_tick {
            return Err(anyhow::anyhow!(
                "Idle tick must not be shorter than the busy tick"
            ));
        }
        Ok(())
    }
}
