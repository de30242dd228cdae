//! Builds the trigger engine from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info, warn};

use cronjob_config::{CronJobConfig, DispatchConfig, SchedulerConfig, TimeZoneSetting, TriggerConfig};
use cronjob_core::memory::{InMemoryCache, InMemoryLockService};
use cronjob_core::scheduler::ResetHook;
use cronjob_core::{
    Clock, DedupCache, JsonFileProvider, LockService, SchedulerLoop, SchedulerSettings,
    SystemClock, TaskDispatcher, TaskRegistry, TriggerCoordinator, TriggerSettings,
};
use cronjob_storage::CronStorage;

use crate::dispatch::{LogDispatcher, WebhookDispatcher};

/// Everything a subcommand needs to evaluate or loop.
pub struct Engine {
    pub coordinator: Arc<TriggerCoordinator>,
    pub locks: Arc<dyn LockService>,
    pub storage: Option<Arc<CronStorage>>,
}

impl Engine {
    pub fn build(config: &CronJobConfig) -> anyhow::Result<Self> {
        let storage = match config.sqlite_path()? {
            Some(path) => Some(Arc::new(
                CronStorage::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            )),
            None => {
                warn!("In-memory backend: locks and markers are not shared between processes");
                None
            }
        };

        let (locks, cache) = match &storage {
            Some(s) => (s.clone() as Arc<dyn LockService>, s.clone() as Arc<dyn DedupCache>),
            None => (
                Arc::new(InMemoryLockService::new()) as Arc<dyn LockService>,
                Arc::new(InMemoryCache::new()) as Arc<dyn DedupCache>,
            ),
        };

        let dispatcher = build_dispatcher(&config.dispatch, storage.as_ref())?;

        let mut coordinator = TriggerCoordinator::new(locks.clone(), cache, dispatcher)
            .with_registry(build_registry(config))
            .with_clock(build_clock(config.trigger.timezone))
            .with_settings(trigger_settings(&config.trigger));
        for path in &config.task_files {
            debug!(path = %path.display(), "Registering task file");
            coordinator = coordinator.with_provider(Arc::new(JsonFileProvider::new(path)));
        }

        Ok(Self {
            coordinator: Arc::new(coordinator),
            locks,
            storage,
        })
    }

    /// Scheduler loop over this engine, purging expired rows after each cycle.
    pub fn scheduler(&self, config: &SchedulerConfig) -> SchedulerLoop {
        let mut scheduler = SchedulerLoop::new(self.coordinator.clone(), self.locks.clone())
            .with_settings(scheduler_settings(config));

        if let Some(storage) = &self.storage {
            let storage = storage.clone();
            let purge: ResetHook = Arc::new(move || {
                let storage = storage.clone();
                Box::pin(async move {
                    match storage.purge_expired().await {
                        Ok(stats) => debug!(locks = stats.locks, markers = stats.markers, "Purged expired rows"),
                        Err(e) => warn!(error = %e, "Failed to purge expired rows"),
                    }
                })
            });
            scheduler = scheduler.with_reset_hook(purge);
        }
        scheduler
    }
}

fn build_dispatcher(
    config: &DispatchConfig,
    storage: Option<&Arc<CronStorage>>,
) -> anyhow::Result<Arc<dyn TaskDispatcher>> {
    let dispatcher: Arc<dyn TaskDispatcher> = match config {
        DispatchConfig::Queue => match storage {
            Some(s) => s.clone(),
            None => bail!("queue dispatch requires the sqlite backend"),
        },
        DispatchConfig::Webhook {
            url,
            auth_token,
            timeout_secs,
        } => Arc::new(WebhookDispatcher::new(
            url,
            auth_token.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
        DispatchConfig::Log => Arc::new(LogDispatcher),
    };
    info!(dispatch = dispatch_kind(config), "Dispatcher ready");
    Ok(dispatcher)
}

fn dispatch_kind(config: &DispatchConfig) -> &'static str {
    match config {
        DispatchConfig::Queue => "queue",
        DispatchConfig::Webhook { .. } => "webhook",
        DispatchConfig::Log => "log",
    }
}

pub fn build_registry(config: &CronJobConfig) -> TaskRegistry {
    config
        .tasks
        .iter()
        .fold(TaskRegistry::builder(), |builder, task| {
            builder.command(task.command.clone(), task.schedules.iter().cloned())
        })
        .build()
}

fn build_clock(zone: TimeZoneSetting) -> Arc<dyn Clock> {
    match zone {
        TimeZoneSetting::Local => Arc::new(SystemClock::local()),
        TimeZoneSetting::Utc => Arc::new(SystemClock::utc()),
    }
}

pub fn trigger_settings(config: &TriggerConfig) -> TriggerSettings {
    TriggerSettings {
        lock_prefix: config.lock_prefix.clone(),
        global_marker_ttl: Duration::from_secs(config.global_marker_ttl_secs),
        global_lock_ttl: Duration::from_secs(config.global_lock_ttl_secs),
        default_task_ttl: Duration::from_secs(config.default_task_ttl_secs),
        task_lock_ttl: Duration::from_secs(config.task_lock_ttl_secs),
        retry_on_dispatch_failure: config.retry_on_dispatch_failure,
    }
}

pub fn scheduler_settings(config: &SchedulerConfig) -> SchedulerSettings {
    SchedulerSettings {
        memory_limit_mb: config.memory_limit_mb,
        lock_ttl: Duration::from_secs(config.lock_ttl_secs),
    }
}
