//! Wire format shared by the controller and the isolated context.
//!
//! A message is a `{type, data}` pair encoded as a single line of JSON. The
//! encoding never contains a raw newline, so line-oriented transports (the
//! worker's stdio pipes) can frame messages without extra headers.

use crate::errors::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVALUATE: &str = "evaluate";
pub const EVALUATE_RAW: &str = "evaluateRaw";
pub const GET_NEXT_LINE_INDENT: &str = "getNextLineIndent";
pub const IMPORT_SCRIPTS: &str = "importScripts";
pub const SET_INPUT_SERVER: &str = "setInputServer";
pub const RESULT: &str = "result";
pub const ERROR: &str = "error";
pub const PROGRESS: &str = "progress";
pub const OUTPUT: &str = "output";
pub const INDENT: &str = "indent";
pub const INPUT: &str = "input";
pub const READY: &str = "ready";

/// Published by the watchdog on every missed deadline and forwarded to the
/// isolated context, which only records it.
pub const TIMEOUT: &str = "timeout";

/// Published on the controller side when a context stops on its own; never
/// crosses the boundary.
pub const EXIT: &str = "exit";

/// Message types that cross the boundary. Other types are still accepted
/// and republished as-is.
pub const VOCABULARY: &[&str] = &[
    EVALUATE,
    EVALUATE_RAW,
    GET_NEXT_LINE_INDENT,
    IMPORT_SCRIPTS,
    SET_INPUT_SERVER,
    RESULT,
    ERROR,
    PROGRESS,
    OUTPUT,
    INDENT,
    INPUT,
    READY,
    TIMEOUT,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn is_known(&self) -> bool {
        VOCABULARY.contains(&self.kind.as_str())
    }

    pub fn encode(&self) -> Result<String, SandboxError> {
        serde_json::to_string(self)
            .map_err(|e| SandboxError::ProtocolDecode(format!("Failed to encode message: {}", e)))
    }

    /// Parse one raw payload. Anything that is not an object with a
    /// non-empty string `type` is rejected.
    pub fn decode(raw: &str) -> Result<Self, SandboxError> {
        let message: Message = serde_json::from_str(raw.trim())
            .map_err(|e| SandboxError::ProtocolDecode(e.to_string()))?;
        if message.kind.is_empty() {
            return Err(SandboxError::ProtocolDecode(
                "message type is empty".to_string(),
            ));
        }
        Ok(message)
    }
}
