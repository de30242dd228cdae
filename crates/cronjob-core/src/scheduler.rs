//! Long-running scheduler loop: wakes at each minute boundary and evaluates.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::keys::scheduler_key;
use crate::traits::{CronTrigger, LockService};

/// Async callback run after every cycle to drop per-cycle state.
pub type ResetHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Time left until the next minute boundary.
///
/// Exactly on a boundary this is a full minute.
pub fn delay_until_next_minute(now: DateTime<Utc>) -> Duration {
    let secs = now.timestamp().rem_euclid(60) as u64;
    let nanos = u64::from(now.timestamp_subsec_nanos()).min(999_999_999);
    Duration::from_secs(60 - secs) - Duration::from_nanos(nanos)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Resident memory above which the loop stops with an error.
    pub memory_limit_mb: u64,
    /// Lifetime of the per-minute scheduling lock.
    pub lock_ttl: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024,
            lock_ttl: Duration::from_secs(60),
        }
    }
}

/// Reports the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in MiB, or `None` when unavailable.
    fn resident_mb(&self) -> Option<f64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_mb(&self) -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A stop was requested; the loop exits.
    Stopped,
    /// Another scheduler holds this minute.
    Skipped,
    /// The evaluation ran; `triggered` is its result.
    Evaluated { triggered: bool },
}

pub struct SchedulerLoop {
    trigger: Arc<dyn CronTrigger>,
    locks: Arc<dyn LockService>,
    settings: SchedulerSettings,
    marker_file: Option<PathBuf>,
    cancel: CancellationToken,
    memory: Arc<dyn MemoryProbe>,
    reset_hooks: Vec<ResetHook>,
}

impl SchedulerLoop {
    pub fn new(trigger: Arc<dyn CronTrigger>, locks: Arc<dyn LockService>) -> Self {
        Self {
            trigger,
            locks,
            settings: SchedulerSettings::default(),
            marker_file: None,
            cancel: CancellationToken::new(),
            memory: Arc::new(ProcMemoryProbe),
            reset_hooks: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Stop once `path` no longer exists.
    pub fn with_marker_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.marker_file = Some(path.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn with_reset_hook(mut self, hook: ResetHook) -> Self {
        self.reset_hooks.push(hook);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until stopped. Only a fatal housekeeping failure returns an error.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        info!(
            marker_file = ?self.marker_file,
            memory_limit_mb = self.settings.memory_limit_mb,
            "Cron scheduler started"
        );

        loop {
            let delay = delay_until_next_minute(Utc::now());
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for next minute");

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Cron scheduler cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.run_cycle(Utc::now().timestamp()).await? == CycleOutcome::Stopped {
                info!("Cron scheduler stopped");
                return Ok(());
            }
        }
    }

    /// One wake-up: stop check, locked evaluation, housekeeping.
    pub async fn run_cycle(&self, unix_secs: i64) -> Result<CycleOutcome, SchedulerError> {
        if self.stop_requested() {
            return Ok(CycleOutcome::Stopped);
        }

        let key = scheduler_key(unix_secs);
        let outcome = match self.locks.acquire(&key, self.settings.lock_ttl).await {
            Ok(handle) => {
                info!("Running cron tasks");
                let trigger = Arc::clone(&self.trigger);
                let triggered =
                    match tokio::spawn(async move { trigger.trigger_scheduled_tasks().await })
                        .await
                    {
                        Ok(triggered) => triggered,
                        Err(e) => {
                            error!(error = %e, "Cron evaluation aborted");
                            false
                        }
                    };

                if let Err(e) = self.locks.release(handle).await {
                    warn!(lock_key = %key, error = %e, "Failed to release scheduling lock");
                }
                CycleOutcome::Evaluated { triggered }
            }
            Err(e) => {
                debug!(lock_key = %key, error = %e, "Scheduling lock held elsewhere, skipping this minute");
                CycleOutcome::Skipped
            }
        };

        self.housekeeping().await?;
        Ok(outcome)
    }

    fn stop_requested(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match &self.marker_file {
            Some(path) if !path.exists() => {
                info!(path = %path.display(), "Marker file removed, stopping");
                true
            }
            _ => false,
        }
    }

    async fn housekeeping(&self) -> Result<(), SchedulerError> {
        for hook in &self.reset_hooks {
            hook().await;
        }

        if let Some(used_mb) = self.memory.resident_mb() {
            debug!(used_mb, "Scheduler memory usage");
            if used_mb > self.settings.memory_limit_mb as f64 {
                error!(
                    used_mb,
                    limit_mb = self.settings.memory_limit_mb,
                    "Memory limit exceeded, stopping scheduler"
                );
                return Err(SchedulerError::MemoryLimitExceeded {
                    used_mb,
                    limit_mb: self.settings.memory_limit_mb,
                });
            }
        }
        Ok(())
    }
}
