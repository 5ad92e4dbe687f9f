//! Configuration types for sessions and the language registry

use crate::errors::SandboxError;
use crate::guest::engines::{ECHO_ENGINE, SHELL_ENGINE};
use crate::input::InputStrategy;
use crate::language::{EnvironmentTable, LanguageRegistry, LanguageSpec, PayloadRef};
use crate::session::SessionBuilder;
use crate::watchdog::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Executable started by the worker backend for the built-in languages.
pub const GUEST_BINARY: &str = "replbox-guest";

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplboxConfig {
    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default = "default_languages")]
    pub languages: Vec<LanguageSpec>,
}

impl Default for ReplboxConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            languages: default_languages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Prefer the worker backend when the host supports it
    #[serde(default = "default_true")]
    pub prefer_thread: bool,

    /// Whether the host can run the worker backend at all
    #[serde(default = "default_true")]
    pub thread_support: bool,

    /// Watchdog for the frame backend; disabled when absent
    #[serde(default)]
    pub timeout: Option<TimeoutSettings>,

    #[serde(default)]
    pub input: InputStrategy,

    /// Environment names consulted for conditional payloads, before
    /// `default`. Detected from the host when empty.
    #[serde(default)]
    pub environments: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            prefer_thread: true,
            thread_support: true,
            timeout: None,
            input: InputStrategy::Direct,
            environments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Missed deadlines tolerated before the evaluation is abandoned
    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_checks: default_max_checks(),
        }
    }
}

impl TimeoutSettings {
    pub fn to_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::max_checks(Duration::from_millis(self.interval_ms), self.max_checks)
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_max_checks() -> u32 {
    3
}

/// Languages served by the engines bundled with the guest runtime
pub fn default_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec {
            system_name: "echo".to_string(),
            name: "Echo".to_string(),
            extension: "txt".to_string(),
            matchings: vec![
                ("(".to_string(), ")".to_string()),
                ("[".to_string(), "]".to_string()),
                ("{".to_string(), "}".to_string()),
            ],
            scripts: vec![PayloadRef::from(GUEST_BINARY)],
            includes: Vec::new(),
            engine: ECHO_ENGINE.to_string(),
        },
        LanguageSpec {
            system_name: "shell".to_string(),
            name: "Shell".to_string(),
            extension: "sh".to_string(),
            matchings: vec![("(".to_string(), ")".to_string()), ("{".to_string(), "}".to_string())],
            scripts: vec![PayloadRef::from(GUEST_BINARY)],
            includes: Vec::new(),
            engine: SHELL_ENGINE.to_string(),
        },
    ]
}

impl ReplboxConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandboxError> {
        if let Some(timeout) = &self.session.timeout {
            if timeout.interval_ms == 0 {
                return Err(SandboxError::Config(
                    "session.timeout.interval_ms must be greater than 0".to_string(),
                ));
            }
            if timeout.max_checks == 0 {
                return Err(SandboxError::Config(
                    "session.timeout.max_checks must be greater than 0".to_string(),
                ));
            }
        }

        if let InputStrategy::Remote { url } = &self.session.input {
            if url.trim().is_empty() {
                return Err(SandboxError::Config(
                    "session.input.url cannot be empty for the remote strategy".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for language in &self.languages {
            language.validate()?;
            if !seen.insert(language.system_name.as_str()) {
                return Err(SandboxError::Config(format!(
                    "language '{}' is defined more than once",
                    language.system_name
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<LanguageRegistry, SandboxError> {
        LanguageRegistry::from_specs(self.languages.clone())
    }

    pub fn environment_table(&self) -> EnvironmentTable {
        if self.session.environments.is_empty() {
            EnvironmentTable::detect()
        } else {
            let names: Vec<&str> = self.session.environments.iter().map(String::as_str).collect();
            EnvironmentTable::with_order(&names)
        }
    }

    /// Session builder carrying every setting from this configuration.
    pub fn session_builder(&self) -> Result<SessionBuilder, SandboxError> {
        let mut builder = SessionBuilder::new(Arc::new(self.registry()?))
            .environment(self.environment_table())
            .thread_support(self.session.thread_support)
            .input_strategy(self.session.input.clone());
        if let Some(timeout) = &self.session.timeout {
            builder = builder.timeout(timeout.to_policy());
        }
        Ok(builder)
    }
}
