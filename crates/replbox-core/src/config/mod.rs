//! Configuration module
//!
//! Sessions and the language registry are configured from a YAML file,
//! with a handful of environment overrides applied on top.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::SandboxError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<ReplboxConfig, SandboxError> {
    ConfigLoader::from_file(path).await
}
