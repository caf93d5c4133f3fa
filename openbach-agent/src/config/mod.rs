//! Configuration management module for the OpenBACH agent.
//!
//! This module provides centralized configuration management with support for:
//! - CLI argument parsing
//! - Environment variable configuration
//! - Configuration validation

pub mod app_config;
pub mod cli;

pub use app_config::{AppConfig, LogLevel, PORT_ENV};
pub use cli::CliConfig;

use anyhow::Result;

/// Main configuration manager that combines all configuration sources
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub cli: CliConfig,
    pub app: AppConfig,
}

impl ConfigManager {
    /// Creates a new configuration manager from CLI arguments and environment
    pub fn from_cli_and_env() -> Result<Self> {
        let cli_config = CliConfig::from_args()?;
        Self::from_cli(cli_config)
    }

    pub fn from_cli(cli_config: CliConfig) -> Result<Self> {
        let app_config = AppConfig::from_cli(&cli_config)?;
        Ok(Self {
            cli: cli_config,
            app: app_config,
        })
    }

    /// Validates the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.cli.validate()?;
        self.app.validate()?;
        Ok(())
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        self.app.init_logging()
    }
}
