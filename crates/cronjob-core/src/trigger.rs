//! Trigger coordinator: per-minute evaluation with two-layer dedup.
//!
//! Every shared-state access follows check → lock → re-check → act → mark.
//! The per-minute layer short-circuits repeat invokers within a minute; the
//! per-task layer keeps each task occurrence to at most one dispatch even when
//! a minute's evaluation is entered concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use cronjob_types::{DEFAULT_LOCK_TTL_SECS, TaskOptions};

use crate::expression;
use crate::instant::{Clock, EvaluationInstant, SystemClock};
use crate::keys::{TaskKey, global_key};
use crate::registry::TaskRegistry;
use crate::traits::{CronTrigger, DedupCache, LockService, TaskDispatcher, TaskProvider};

/// Tunables of the trigger protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Namespace of the per-minute lock and marker.
    pub lock_prefix: String,
    /// Lifetime of the per-minute marker.
    pub global_marker_ttl: Duration,
    /// Lifetime of the per-minute lock, which is never released explicitly.
    pub global_lock_ttl: Duration,
    /// Per-task marker lifetime when the task declares none.
    pub default_task_ttl: Duration,
    /// Crash bound of the per-task lock; it is normally released right away.
    pub task_lock_ttl: Duration,
    /// When set, a failed dispatch leaves no marker so a later invoker retries.
    pub retry_on_dispatch_failure: bool,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            lock_prefix: "cron-trigger".to_string(),
            global_marker_ttl: Duration::from_secs(120),
            global_lock_ttl: Duration::from_secs(60),
            default_task_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            task_lock_ttl: Duration::from_secs(30),
            retry_on_dispatch_failure: false,
        }
    }
}

pub struct TriggerCoordinator {
    registry: TaskRegistry,
    providers: Vec<Arc<dyn TaskProvider>>,
    locks: Arc<dyn LockService>,
    cache: Arc<dyn DedupCache>,
    dispatcher: Arc<dyn TaskDispatcher>,
    clock: Arc<dyn Clock>,
    settings: TriggerSettings,
}

impl TriggerCoordinator {
    pub fn new(
        locks: Arc<dyn LockService>,
        cache: Arc<dyn DedupCache>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            registry: TaskRegistry::default(),
            providers: Vec::new(),
            locks,
            cache,
            dispatcher,
            clock: Arc::new(SystemClock::local()),
            settings: TriggerSettings::default(),
        }
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn TaskProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: TriggerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// Evaluate the current minute.
    pub async fn trigger_scheduled_tasks(&self) -> bool {
        self.trigger_at(EvaluationInstant::new(self.clock.now()))
            .await
    }

    /// Evaluate `instant`. Returns `true` iff this call ran the pass to completion.
    pub async fn trigger_at(&self, instant: EvaluationInstant) -> bool {
        let minute = instant.minute_key();
        let key = global_key(&self.settings.lock_prefix, &instant);

        if self.marker_present(&key).await {
            debug!(minute = %minute, cache_key = %key, "Cron tasks already triggered for this minute (cache hit)");
            return false;
        }

        // Deliberately never released: the lock lapses on its own TTL.
        if let Err(e) = self.locks.acquire(&key, self.settings.global_lock_ttl).await {
            debug!(minute = %minute, lock_key = %key, error = %e, "Cron trigger lock already acquired for this minute");
            return false;
        }

        if self.marker_present(&key).await {
            debug!(minute = %minute, cache_key = %key, "Cron tasks already triggered for this minute (double check)");
            return false;
        }

        info!(minute = %minute, timestamp = %instant, "Starting cron trigger execution");

        let tasks_triggered = self.process_tasks(&instant).await;

        match self.cache.set(&key, self.settings.global_marker_ttl).await {
            Ok(()) => {
                info!(minute = %minute, tasks_triggered, "Cron trigger execution completed");
                true
            }
            Err(e) => {
                error!(minute = %minute, error = %e, "Failed to trigger cron tasks");
                false
            }
        }
    }

    /// Run the per-task protocol for one occurrence.
    ///
    /// Returns `true` when this call decided to fire the task.
    pub async fn trigger_task(
        &self,
        command: &str,
        options: &TaskOptions,
        instant: &EvaluationInstant,
        lock_ttl: Option<u64>,
    ) -> bool {
        let key = match TaskKey::derive(command, options, instant) {
            Ok(k) => k,
            Err(e) => {
                error!(command = %command, error = %e, "Failed to derive task key, skipping");
                return false;
            }
        };
        let ttl = lock_ttl
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_task_ttl);

        if self.marker_present(&key.cache_key).await {
            debug!(command = %command, cache_key = %key.cache_key, "Task already triggered, skipping (cache hit)");
            return false;
        }

        let handle = match self
            .locks
            .acquire(&key.lock_key, self.settings.task_lock_ttl)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(command = %command, key = %key.lock_key, error = %e, "Unable to acquire task lock, skipping");
                return false;
            }
        };

        let fired = self.dispatch_and_mark(command, options, &key, ttl).await;

        if let Err(e) = self.locks.release(handle).await {
            warn!(command = %command, key = %key.lock_key, error = %e, "Failed to release task lock");
        }

        fired
    }

    async fn dispatch_and_mark(
        &self,
        command: &str,
        options: &TaskOptions,
        key: &TaskKey,
        ttl: Duration,
    ) -> bool {
        if self.marker_present(&key.cache_key).await {
            debug!(command = %command, cache_key = %key.cache_key, "Task already triggered, skipping (double check)");
            return false;
        }

        info!(command = %command, "Dispatching scheduled command");
        if let Err(e) = self.dispatcher.dispatch(command, options).await {
            error!(command = %command, error = %e, "Failed to dispatch scheduled command");
            if self.settings.retry_on_dispatch_failure {
                return false;
            }
        }

        if let Err(e) = self.cache.set(&key.cache_key, ttl).await {
            error!(command = %command, cache_key = %key.cache_key, error = %e, "Failed to record task marker");
        }
        true
    }

    async fn process_tasks(&self, instant: &EvaluationInstant) -> usize {
        self.process_registered_tasks(instant).await + self.process_provider_tasks(instant).await
    }

    async fn process_registered_tasks(&self, instant: &EvaluationInstant) -> usize {
        let options = TaskOptions::new();
        let mut triggered = 0;

        for command in self.registry.commands() {
            for schedule in &command.schedules {
                if !self.is_due(&schedule.expression, instant) {
                    continue;
                }
                if self
                    .trigger_task(&command.name, &options, instant, schedule.lock_ttl)
                    .await
                {
                    triggered += 1;
                }
            }
        }

        triggered
    }

    async fn process_provider_tasks(&self, instant: &EvaluationInstant) -> usize {
        let mut triggered = 0;

        let default_ttl = self.settings.default_task_ttl.as_secs();
        for provider in &self.providers {
            let tasks = match provider.commands().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(provider = %provider.name(), error = %e, "Failed to load tasks from provider, skipping");
                    continue;
                }
            };

            for task in tasks {
                if !self.is_due(&task.cron_expression, instant) {
                    continue;
                }
                if self
                    .trigger_task(
                        &task.command,
                        &task.options,
                        instant,
                        Some(task.effective_ttl(default_ttl)),
                    )
                    .await
                {
                    triggered += 1;
                }
            }
        }

        triggered
    }

    fn is_due(&self, expression: &str, instant: &EvaluationInstant) -> bool {
        match expression::is_due(expression, instant.as_naive()) {
            Ok(due) => due,
            Err(e) => {
                error!(expression = %expression, error = %e, "Failed to evaluate cron expression");
                false
            }
        }
    }

    /// Whether a marker is present. A failed lookup counts as present so the
    /// unit of work is skipped rather than risking a duplicate.
    async fn marker_present(&self, key: &str) -> bool {
        match self.cache.get(key).await {
            Ok(entry) => entry.is_hit(),
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Dedup cache lookup failed");
                true
            }
        }
    }
}

#[async_trait]
impl CronTrigger for TriggerCoordinator {
    async fn trigger_scheduled_tasks(&self) -> bool {
        TriggerCoordinator::trigger_scheduled_tasks(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChannelDispatcher, InMemoryCache, InMemoryLockService};
    use cronjob_types::ScheduleSpec;

    #[test]
    fn default_settings() {
        let settings = TriggerSettings::default();
        assert_eq!(settings.global_marker_ttl, Duration::from_secs(120));
        assert_eq!(settings.default_task_ttl, Duration::from_secs(3600));
        assert!(!settings.retry_on_dispatch_failure);
    }

    #[tokio::test]
    async fn static_schedules_share_identity_within_a_minute() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel();
        let registry = TaskRegistry::builder()
            .schedule("cmd:foo", ScheduleSpec::new("* * * * *"))
            .schedule("cmd:foo", ScheduleSpec::new("*/1 * * * *"))
            .build();
        let coordinator = TriggerCoordinator::new(
            Arc::new(InMemoryLockService::new()),
            Arc::new(InMemoryCache::new()),
            Arc::new(dispatcher),
        )
        .with_registry(registry);

        assert!(coordinator.trigger_scheduled_tasks().await);
        assert_eq!(rx.recv().await.unwrap().command, "cmd:foo");
        assert!(rx.try_recv().is_err());
    }
}
