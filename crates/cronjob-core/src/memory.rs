//! Process-local lock, cache and dispatcher implementations.
//!
//! These only coordinate callers inside one process. Use them for embedding,
//! tests and single-invoker deployments; fleets need a shared backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use cronjob_types::{DispatchedCommand, TaskOptions};

use crate::error::{CacheError, DispatchError, LockError};
use crate::traits::{CacheEntry, DedupCache, LockHandle, LockService, TaskDispatcher};

// ── InMemoryLockService ──────────────────────────────────────────────────────

struct HeldLock {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLockService {
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub async fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        // Minute-scoped keys are never reacquired, so expired holders go here.
        locks.retain(|_, held| held.expires_at > now);
        if locks.contains_key(key) {
            return Err(LockError::Held {
                key: key.to_string(),
            });
        }

        let handle = LockHandle::new(key);
        locks.insert(
            key.to_string(),
            HeldLock {
                token: handle.token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(handle)
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&handle.key)
            .is_some_and(|held| held.token == handle.token)
        {
            locks.remove(&handle.key);
        }
        Ok(())
    }
}

// ── InMemoryCache ────────────────────────────────────────────────────────────

struct Marker {
    expires_at: Instant,
    ttl: Duration,
}

#[derive(Default)]
pub struct InMemoryCache {
    markers: Mutex<HashMap<String, Marker>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL the live marker under `key` was stored with.
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        let markers = self.markers.lock().await;
        markers
            .get(key)
            .filter(|m| m.expires_at > Instant::now())
            .map(|m| m.ttl)
    }

    /// Keys of all live markers, sorted.
    pub async fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let markers = self.markers.lock().await;
        let mut keys: Vec<String> = markers
            .iter()
            .filter(|(_, m)| m.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DedupCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<CacheEntry, CacheError> {
        let now = Instant::now();
        let mut markers = self.markers.lock().await;
        match markers.get(key) {
            Some(m) if m.expires_at > now => Ok(CacheEntry::hit()),
            Some(_) => {
                markers.remove(key);
                Ok(CacheEntry::miss())
            }
            None => Ok(CacheEntry::miss()),
        }
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut markers = self.markers.lock().await;
        markers.retain(|_, m| m.expires_at > now);
        markers.insert(
            key.to_string(),
            Marker {
                expires_at: now + ttl,
                ttl,
            },
        );
        Ok(())
    }
}

// ── ChannelDispatcher ────────────────────────────────────────────────────────

/// Forwards dispatched commands to an in-process worker over a channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<DispatchedCommand>,
}

impl ChannelDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchedCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    async fn dispatch(&self, command: &str, options: &TaskOptions) -> Result<(), DispatchError> {
        self.sender
            .send(DispatchedCommand {
                command: command.to_string(),
                options: options.clone(),
            })
            .map_err(|_| DispatchError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_until_expiry() {
        let locks = InMemoryLockService::new();
        let ttl = Duration::from_secs(60);

        let _held = locks.acquire("k", ttl).await.unwrap();
        assert!(matches!(
            locks.acquire("k", ttl).await,
            Err(LockError::Held { .. })
        ));
        assert!(locks.acquire("other", ttl).await.is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!locks.is_locked("k").await);
        assert!(locks.acquire("k", ttl).await.is_ok());
    }

    #[tokio::test]
    async fn release_only_frees_own_lock() {
        let locks = InMemoryLockService::new();
        let ttl = Duration::from_secs(60);

        let held = locks.acquire("k", ttl).await.unwrap();
        let stranger = LockHandle::new("k");
        locks.release(stranger).await.unwrap();
        assert!(locks.is_locked("k").await);

        locks.release(held).await.unwrap();
        assert!(!locks.is_locked("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_marker_expires() {
        let cache = InMemoryCache::new();
        assert!(!cache.get("m").await.unwrap().is_hit());

        cache.set("m", Duration::from_secs(120)).await.unwrap();
        assert!(cache.get("m").await.unwrap().is_hit());
        assert_eq!(cache.ttl_of("m").await, Some(Duration::from_secs(120)));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(cache.get("m").await.unwrap().is_hit());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.get("m").await.unwrap().is_hit());
        assert_eq!(cache.ttl_of("m").await, None);
        assert!(cache.live_keys().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_over_many_minutes() {
        use crate::instant::EvaluationInstant;
        use crate::registry::TaskRegistry;
        use crate::trigger::TriggerCoordinator;
        use chrono::NaiveDate;
        use cronjob_types::ScheduleSpec;
        use std::sync::Arc;

        let locks = Arc::new(InMemoryLockService::new());
        let cache = Arc::new(InMemoryCache::new());
        let (dispatcher, _rx) = ChannelDispatcher::channel();
        let coordinator =
            TriggerCoordinator::new(locks.clone(), cache.clone(), Arc::new(dispatcher))
                .with_registry(
                    TaskRegistry::builder()
                        .schedule("cmd:foo", ScheduleSpec::default())
                        .build(),
                );

        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        for minute in 0..300 {
            let now = start + chrono::Duration::minutes(minute);
            assert!(coordinator.trigger_at(EvaluationInstant::new(now)).await);
            tokio::time::advance(Duration::from_secs(60)).await;
        }

        // Only the last minute's lock can still be live; it expires on the next sweep.
        assert!(locks.locks.lock().await.len() <= 1);

        // One hour of task markers (3600 s TTL) plus the two newest minute markers (120 s TTL).
        let stored = cache.markers.lock().await.len();
        assert!(stored <= 62, "{stored} markers retained");
        assert!(stored >= cache.live_keys().await.len());
    }

    #[tokio::test]
    async fn channel_dispatcher_forwards_commands() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel();
        let mut options = TaskOptions::new();
        options.insert("date".into(), serde_json::json!("2024-01-01"));

        dispatcher.dispatch("report:daily", &options).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.command, "report:daily");
        assert_eq!(received.options, options);

        drop(rx);
        assert!(matches!(
            dispatcher.dispatch("x", &TaskOptions::new()).await,
            Err(DispatchError::Closed)
        ));
    }
}
