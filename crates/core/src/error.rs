use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid config value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialize(e.to_string())
    }
}

/// Failure taxonomy shared by every tool result that crosses the executor
/// boundary. Serialized as `NOT_FOUND`, `ACCESS_DENIED`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Unknown tool.
    NotFound,
    /// Rejected by the permission filter.
    AccessDenied,
    RateLimited,
    CircuitOpen,
    /// Bad arguments. Never retried.
    Validation,
    /// Tool-internal failure.
    ExecutionError,
    Timeout,
    /// A prerequisite in a chain failed.
    DependencyFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::ExecutionError => "EXECUTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::DependencyFailed => "DEPENDENCY_FAILED",
        }
    }

    /// Whether the failure says something about the caller rather than the
    /// backend. Such failures do not count against a circuit breaker.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::AccessDenied | ErrorKind::Validation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
