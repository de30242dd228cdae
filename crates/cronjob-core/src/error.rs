//! Error types for the trigger engine.
//!
//! Every variant except [`SchedulerError`] is recovered inside the engine:
//! the affected unit of work is skipped and the failure is logged.

use thiserror::Error;

/// A cron expression failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct ExpressionError {
    pub expression: String,
    pub reason: String,
}

impl ExpressionError {
    pub(crate) fn new(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{key}' is already held")]
    Held { key: String },
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch channel closed")]
    Closed,
    #[error("dispatch of '{command}' failed: {reason}")]
    Failed { command: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed task list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Conditions that stop the scheduler loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("memory usage {used_mb:.1} MB exceeds limit of {limit_mb} MB")]
    MemoryLimitExceeded { used_mb: f64, limit_mb: u64 },
}
