//! Error types for the sandbox orchestration core
//!
//! Failures are split by how they propagate. Resource-lifecycle failures
//! (an unknown language, an input transport the host cannot provide) are
//! caller misconfiguration and are returned immediately from the call that
//! requested them. Protocol decode failures never leave the isolation layer:
//! cross-context channels may carry unrelated noise, so undecodable payloads
//! are dropped. Failures of the evaluated program travel back through the
//! same callback slot as successful results.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),
    #[error("Unsupported input delivery mechanism: {0}")]
    UnsupportedDeliveryMechanism(String),
    #[error("No isolation context is loaded")]
    ContextNotLoaded,
    #[error("An evaluation is already in progress")]
    EvaluationInProgress,
    #[error("The context is still running an abandoned evaluation; kill or reload it first")]
    ContextAbandoned,
    #[error("Failed to spawn isolation context: {0}")]
    Spawn(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Input delivery failed: {0}")]
    Delivery(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Delivery(err.to_string())
    }
}

/// Outcome of a failed evaluation, handed to the `evaluate` callback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The program raised an error; the context stays usable.
    #[error("{0}")]
    Runtime(String),
    /// The watchdog predicate asked to give up on the evaluation.
    #[error("Evaluation abandoned after {checks} watchdog checks")]
    Abandoned { checks: u32 },
    /// The context was killed or replaced while the evaluation was pending.
    #[error("Isolation context terminated before the evaluation finished")]
    Terminated,
}
