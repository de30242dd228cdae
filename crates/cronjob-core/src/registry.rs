//! Static task registry and the built-in task providers.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use cronjob_types::{ScheduleSpec, TaskDescriptor};

use crate::error::ProviderError;
use crate::traits::TaskProvider;

/// Name of the evaluator's own command. Never scheduled by the registry.
pub const RUN_COMMAND_NAME: &str = "cron:run";

/// A statically registered command and every schedule it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCommand {
    pub name: String,
    pub schedules: Vec<ScheduleSpec>,
}

/// Commands registered at process start, evaluated with empty options.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    commands: Vec<ScheduledCommand>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    /// Registered commands in registration order, minus the evaluator itself.
    pub fn commands(&self) -> impl Iterator<Item = &ScheduledCommand> {
        self.commands
            .iter()
            .filter(|c| c.name != RUN_COMMAND_NAME)
    }

    pub fn len(&self) -> usize {
        self.commands().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistryBuilder {
    commands: Vec<ScheduledCommand>,
}

impl TaskRegistryBuilder {
    /// Register `name` under `schedules`. Repeated names accumulate schedules.
    pub fn command(
        mut self,
        name: impl Into<String>,
        schedules: impl IntoIterator<Item = ScheduleSpec>,
    ) -> Self {
        let name = name.into();
        let schedules = schedules.into_iter();
        match self.commands.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.schedules.extend(schedules),
            None => self.commands.push(ScheduledCommand {
                name,
                schedules: schedules.collect(),
            }),
        }
        self
    }

    /// Register one more schedule for `name`.
    pub fn schedule(self, name: impl Into<String>, spec: ScheduleSpec) -> Self {
        self.command(name, [spec])
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            commands: self.commands,
        }
    }
}

// ── Providers ────────────────────────────────────────────────────────────────

/// A provider returning a fixed list.
pub struct StaticProvider {
    name: String,
    tasks: Vec<TaskDescriptor>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

#[async_trait]
impl TaskProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn commands(&self) -> Result<Vec<TaskDescriptor>, ProviderError> {
        Ok(self.tasks.clone())
    }
}

/// Reads a JSON array of task descriptors from disk on every evaluation.
///
/// Edits to the file take effect at the next minute without a restart. A
/// missing file yields no tasks.
pub struct JsonFileProvider {
    name: String,
    path: PathBuf,
}

impl JsonFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
        }
    }
}

#[async_trait]
impl TaskProvider for JsonFileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn commands(&self) -> Result<Vec<TaskDescriptor>, ProviderError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Task file not found, no tasks");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }
}
