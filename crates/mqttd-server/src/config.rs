//! Broker configuration.
//!
//! Read from `config.yml` in the working directory. The `PORT` environment
//! variable overrides `server.port`. There are no command-line flags.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Config file read from the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Deployment environment; selects the log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Env {
    Production,
    #[default]
    Development,
}

impl Env {
    pub fn is_production(self) -> bool {
        matches!(self, Env::Production)
    }
}

// Any value other than "production" or "development" falls back to
// development rather than failing startup.
impl<'de> Deserialize<'de> for Env {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "production" => Env::Production,
            _ => Env::Development,
        })
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: String,
    pub server: ServerConfig,
}

/// Server section of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub env: Env,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            env: Env::Development,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid PORT override: {0:?}")]
    InvalidPortOverride(String),
}

impl Config {
    /// Load configuration from a YAML file, then apply the `PORT`
    /// environment variable override if present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Ok(port) = std::env::var("PORT") {
            config.override_port(&port)?;
        }
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply a `PORT` override. A non-numeric value is a configuration
    /// error: silently ignoring an operator override would hide it.
    fn override_port(&mut self, raw: &str) -> Result<(), ConfigError> {
        self.server.port = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPortOverride(raw.to_string()))?;
        Ok(())
    }
}
