//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::SandboxError;
use crate::input::InputStrategy;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_PREFER_THREAD: &str = "REPLBOX_PREFER_THREAD";
pub const ENV_TIMEOUT_MS: &str = "REPLBOX_TIMEOUT_MS";
pub const ENV_INPUT_URL: &str = "REPLBOX_INPUT_URL";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ReplboxConfig, SandboxError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<ReplboxConfig, SandboxError> {
        let mut config: ReplboxConfig = serde_yaml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse YAML config: {}", e)))?;
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults plus environment overrides
    pub fn defaults() -> Result<ReplboxConfig, SandboxError> {
        let mut config = ReplboxConfig::default();
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut ReplboxConfig) -> Result<(), SandboxError> {
        if let Ok(value) = env::var(ENV_PREFER_THREAD) {
            config.session.prefer_thread = parse_bool(ENV_PREFER_THREAD, &value)?;
        }

        if let Ok(value) = env::var(ENV_TIMEOUT_MS) {
            let interval_ms = value.trim().parse::<u64>().map_err(|e| {
                SandboxError::Config(format!("{} must be a number of milliseconds: {}", ENV_TIMEOUT_MS, e))
            })?;
            let timeout = config.session.timeout.get_or_insert_with(TimeoutSettings::default);
            timeout.interval_ms = interval_ms;
        }

        if let Ok(url) = env::var(ENV_INPUT_URL) {
            log::debug!("Input delivery overridden by {}", ENV_INPUT_URL);
            config.session.input = InputStrategy::Remote { url };
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, SandboxError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SandboxError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}
