//! Language descriptions and the registry they are looked up from.
//!
//! A [`LanguageSpec`] lists the payload references an isolated context has
//! to load before it can evaluate code. Some references only make sense on
//! certain hosts; those are written as a table keyed by environment name
//! and resolved once, when the language is loaded, through an ordered
//! [`EnvironmentTable`] that always ends in [`DEFAULT_ENVIRONMENT`].

use crate::errors::SandboxError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const DEFAULT_ENVIRONMENT: &str = "default";

/// One loadable payload: a plain reference or a per-environment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadRef {
    Path(String),
    Conditional(BTreeMap<String, String>),
}

impl PayloadRef {
    pub fn resolve(&self, environment: &EnvironmentTable) -> Result<String, SandboxError> {
        match self {
            PayloadRef::Path(path) => Ok(path.clone()),
            PayloadRef::Conditional(variants) => environment
                .order()
                .iter()
                .find_map(|env| variants.get(env))
                .cloned()
                .ok_or_else(|| {
                    SandboxError::Config(format!(
                        "No payload variant for environments {:?} (available: {:?})",
                        environment.order(),
                        variants.keys().collect::<Vec<_>>()
                    ))
                }),
        }
    }
}

impl From<&str> for PayloadRef {
    fn from(path: &str) -> Self {
        PayloadRef::Path(path.to_string())
    }
}

/// Ordered list of environment names consulted when resolving a
/// conditional payload. The first name with a matching variant wins.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentTable {
    order: Vec<String>,
}

impl EnvironmentTable {
    /// Operating system, then OS family, then the default fallback.
    pub fn detect() -> Self {
        Self::with_order(&[std::env::consts::OS, std::env::consts::FAMILY])
    }

    /// Build a table from explicit names; the default fallback is appended
    /// when missing.
    pub fn with_order(names: &[&str]) -> Self {
        let mut order: Vec<String> = Vec::with_capacity(names.len() + 1);
        for name in names {
            if !name.is_empty() && !order.iter().any(|existing| existing == name) {
                order.push(name.to_string());
            }
        }
        if !order.iter().any(|name| name == DEFAULT_ENVIRONMENT) {
            order.push(DEFAULT_ENVIRONMENT.to_string());
        }
        Self { order }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }
}

impl Default for EnvironmentTable {
    fn default() -> Self {
        Self::detect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub system_name: String,
    pub name: String,
    #[serde(default)]
    pub extension: String,
    /// Bracket pairs for editors; not interpreted here.
    #[serde(default)]
    pub matchings: Vec<(String, String)>,
    /// The first entry is the backend's own entry point.
    pub scripts: Vec<PayloadRef>,
    #[serde(default)]
    pub includes: Vec<String>,
    pub engine: String,
}

impl LanguageSpec {
    /// Resolved scripts followed by the engine entry point.
    pub fn resolve_payloads(
        &self,
        environment: &EnvironmentTable,
    ) -> Result<Vec<String>, SandboxError> {
        let mut payloads = self
            .scripts
            .iter()
            .map(|script| script.resolve(environment))
            .collect::<Result<Vec<_>, _>>()?;
        payloads.push(self.engine.clone());
        Ok(payloads)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.system_name.trim().is_empty() {
            return Err(SandboxError::Config(
                "language system_name cannot be empty".to_string(),
            ));
        }
        if self.scripts.is_empty() {
            return Err(SandboxError::Config(format!(
                "language '{}' must list at least its entry-point script",
                self.system_name
            )));
        }
        if self.engine.trim().is_empty() {
            return Err(SandboxError::Config(format!(
                "language '{}' has no engine",
                self.system_name
            )));
        }
        Ok(())
    }
}

/// Read-only lookup of languages by system name.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageSpec>>,
}

impl LanguageRegistry {
    pub fn from_specs(specs: Vec<LanguageSpec>) -> Result<Self, SandboxError> {
        let mut languages = HashMap::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            let key = spec.system_name.clone();
            if languages.insert(key.clone(), Arc::new(spec)).is_some() {
                return Err(SandboxError::Config(format!(
                    "language '{}' is defined more than once",
                    key
                )));
            }
        }
        Ok(Self { languages })
    }

    pub fn get(&self, system_name: &str) -> Result<Arc<LanguageSpec>, SandboxError> {
        self.languages
            .get(system_name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownLanguage(system_name.to_string()))
    }

    pub fn contains(&self, system_name: &str) -> bool {
        self.languages.contains_key(system_name)
    }

    /// System names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
