//! Agent error types

use thiserror::Error;

/// Errors surfaced by the script engine and runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The referenced script does not exist
    #[error("invalid script id")]
    InvalidScriptId,

    /// The script runtime rejected the operation
    #[error("{0}")]
    Runtime(String),
}

impl AgentError {
    /// Create a runtime error from anything printable
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}
