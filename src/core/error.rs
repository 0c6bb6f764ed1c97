use std::fmt;

use thiserror::Error;

/// A single field-level problem found while validating an agent definition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in one definition, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![ValidationError::new(field, message)])
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("chat call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure of a tool implementation itself. In-band failures are returned as
/// `{"status":"error"}` strings instead and never reach this type.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Execution(String),
    #[error("tool call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("sqlite memory error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("kv memory error: {0}")]
    Kv(#[from] redb::Error),
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("memory io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory task failed: {0}")]
    Join(String),
    #[error("unsupported memory backend: {0}")]
    UnsupportedBackend(String),
    #[error("corrupt stored message: {0}")]
    Corrupt(String),
    #[error("invalid conversation key: {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("job payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("lease on job {0} is no longer held")]
    LeaseLost(String),
}

/// The error taxonomy surfaced by the engine to producers and workers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid agent definition: {0}")]
    Config(#[from] ValidationErrors),
    #[error("configuration error: {0}")]
    Setup(String),
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("agent disabled: {0}")]
    Disabled(String),
    #[error("webhook token mismatch for agent {0}")]
    Unauthorized(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {name} failed: {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },
    #[error("upstream chat failure: {0}")]
    Upstream(#[from] ChatError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("enqueue failed: {0}")]
    Delivery(#[from] QueueError),
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Configuration and dispatch errors will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Memory(e) => !matches!(
                e,
                MemoryError::Corrupt(_)
                    | MemoryError::InvalidKey(_)
                    | MemoryError::UnsupportedBackend(_)
            ),
            _ => matches!(
                self,
                EngineError::Upstream(_)
                    | EngineError::Tool { .. }
                    | EngineError::Delivery(_)
                    | EngineError::Cancelled
            ),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_join_every_field() {
        let mut errs = ValidationErrors::default();
        errs.push("name", "is required");
        errs.push("max_turns", "must be greater than 0");
        assert_eq!(
            errs.to_string(),
            "name: is required; max_turns: must be greater than 0"
        );
        assert!(errs.into_result().is_err());
    }

    #[test]
    fn unknown_tool_is_not_retryable() {
        assert!(!EngineError::UnknownTool("x".into()).is_retryable());
        assert!(EngineError::Cancelled.is_retryable());
        assert_eq!(EngineError::UnknownTool("x".into()).to_string(), "unknown tool: x");
    }

    #[test]
    fn corrupt_memory_is_not_retried() {
        let corrupt = EngineError::Memory(MemoryError::Corrupt("unknown role 'robot'".into()));
        assert!(!corrupt.is_retryable());
        assert_eq!(corrupt.to_string(), "corrupt stored message: unknown role 'robot'");
        assert!(EngineError::Memory(MemoryError::Join("panicked".into())).is_retryable());
    }
}
