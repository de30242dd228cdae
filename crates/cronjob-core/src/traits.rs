//! Collaborator seams of the trigger engine.
//!
//! The engine never owns lock, cache or dispatch state. Every implementation
//! must be safe to share between processes, not just threads, for the
//! at-most-once guarantee to hold across a fleet.

use std::time::Duration;

use async_trait::async_trait;

use cronjob_types::{TaskDescriptor, TaskOptions};

use crate::error::{CacheError, DispatchError, LockError, ProviderError};

/// Proof of a held lock, passed back to [`LockService::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    /// Identifies the holder so a release never frees someone else's lock.
    pub token: String,
}

impl LockHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Named mutual exclusion with expiry.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lock or fail immediately with [`LockError::Held`]. Never queues.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle, LockError>;

    /// Release a lock previously returned by `acquire`.
    async fn release(&self, handle: LockHandle) -> Result<(), LockError>;
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    hit: bool,
}

impl CacheEntry {
    pub fn hit() -> Self {
        Self { hit: true }
    }

    pub fn miss() -> Self {
        Self { hit: false }
    }

    pub fn is_hit(&self) -> bool {
        self.hit
    }
}

/// Key/value store of valueless "already triggered" markers.
#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<CacheEntry, CacheError>;

    /// Store a marker that expires after `ttl`.
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// Hands a command off to the asynchronous execution subsystem.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, command: &str, options: &TaskOptions) -> Result<(), DispatchError>;
}

/// A dynamic source of schedulable tasks, queried once per evaluation.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn commands(&self) -> Result<Vec<TaskDescriptor>, ProviderError>;
}

/// Entry point shared by the CLI, the HTTP gateway and the scheduler loop.
#[async_trait]
pub trait CronTrigger: Send + Sync {
    /// Returns `true` iff this call ran the evaluation pass for the current minute.
    async fn trigger_scheduled_tasks(&self) -> bool;
}
