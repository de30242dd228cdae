use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Options passed to a command when it is dispatched.
///
/// Keys are kept sorted so that two maps with the same contents serialize
/// identically, which is what task identity hashing relies on.
pub type TaskOptions = BTreeMap<String, serde_json::Value>;

/// Marker TTL used when a task does not declare its own.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 3600;

// ──────────────────── Task Types ────────────────────

/// A schedulable command occurrence, built fresh on every evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Command name handed to the dispatcher (e.g. "report:daily").
    pub command: String,
    /// Command options. Part of the task identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: TaskOptions,
    /// 5-field cron expression.
    #[serde(alias = "expression", alias = "cronExpression")]
    pub cron_expression: String,
    /// How long the "already triggered" marker survives, in seconds.
    #[serde(
        default,
        alias = "lockTtl",
        skip_serializing_if = "Option::is_none"
    )]
    pub lock_ttl: Option<u64>,
}

impl TaskDescriptor {
    pub fn new(command: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            options: TaskOptions::new(),
            cron_expression: cron_expression.into(),
            lock_ttl: None,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_lock_ttl(mut self, secs: u64) -> Self {
        self.lock_ttl = Some(secs);
        self
    }

    /// Marker TTL for this task, falling back to `default` when undeclared.
    pub fn effective_ttl(&self, default: u64) -> u64 {
        self.lock_ttl.unwrap_or(default)
    }
}

/// One schedule attached to a statically registered command.
///
/// A command may carry several of these; each is evaluated independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// 5-field cron expression.
    #[serde(default = "default_expression")]
    pub expression: String,
    /// Marker TTL override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl: Option<u64>,
}

fn default_expression() -> String {
    "* * * * *".to_string()
}

impl ScheduleSpec {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            lock_ttl: None,
        }
    }

    pub fn with_lock_ttl(mut self, secs: u64) -> Self {
        self.lock_ttl = Some(secs);
        self
    }
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self::new(default_expression())
    }
}

// ──────────────────── Dispatch Types ────────────────────

/// Payload handed to the asynchronous execution subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedCommand {
    pub command: String,
    #[serde(default)]
    pub options: TaskOptions,
}

// ──────────────────── HTTP Types ────────────────────

/// Body returned by `POST /cron/trigger`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Whether this call ran the evaluation pass for the current minute.
    pub success: bool,
    pub message: String,
    /// Unix seconds at response time.
    pub timestamp: i64,
}

impl TriggerResponse {
    pub const TRIGGERED: &'static str = "Cron tasks triggered successfully";
    pub const SKIPPED: &'static str = "No tasks triggered or already running";

    pub fn from_outcome(success: bool, timestamp: i64) -> Self {
        let message = if success { Self::TRIGGERED } else { Self::SKIPPED };
        Self {
            success,
            message: message.to_string(),
            timestamp,
        }
    }
}
