//! cronjob-storage: SQLite-backed locks, dedup markers and command queue.
//!
//! One database file can be shared by every invoker on a host, so the
//! trigger protocol's guarantees hold across processes, not only tasks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use cronjob_core::error::{CacheError, DispatchError, LockError};
use cronjob_core::traits::{CacheEntry, DedupCache, LockHandle, LockService, TaskDispatcher};
use cronjob_types::TaskOptions;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Options encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cron_locks (
        key TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cron_markers (
        key TEXT PRIMARY KEY,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS command_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command TEXT NOT NULL,
        options TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL
    );";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A command waiting in the queue for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub id: i64,
    pub command: String,
    pub options: TaskOptions,
    /// Unix milliseconds.
    pub enqueued_at: i64,
}

/// Rows removed by [`CronStorage::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub locks: usize,
    pub markers: usize,
}

pub struct CronStorage {
    conn: Arc<Mutex<Connection>>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl CronStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, private to this handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Locks ──────────────────────────────────────────────

    /// Take `key` for `ttl` under `token`. Returns `false` if a live holder exists.
    ///
    /// Expired locks under any key are deleted in the same transaction.
    pub async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM cron_locks WHERE expires_at <= ?1",
                rusqlite::params![now],
            )?;
            let inserted = tx.execute(
                "INSERT INTO cron_locks (key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                rusqlite::params![key, token, expiry(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await?
    }

    /// Drop `key` if `token` still holds it.
    pub async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM cron_locks WHERE key = ?1 AND token = ?2",
                rusqlite::params![key, token],
            )?;
            Ok(())
        })
        .await?
    }

    /// Whether a live lock exists under `key`.
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let found = conn
                .query_row(
                    "SELECT 1 FROM cron_locks WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now_millis()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await?
    }

    // ─── Markers ────────────────────────────────────────────

    pub async fn has_marker(&self, key: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let found = conn
                .query_row(
                    "SELECT 1 FROM cron_markers WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now_millis()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await?
    }

    /// Store a marker under `key` for `ttl`, dropping expired markers first.
    pub async fn put_marker(&self, key: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM cron_markers WHERE expires_at <= ?1",
                rusqlite::params![now_millis()],
            )?;
            tx.execute(
                "INSERT INTO cron_markers (key, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                rusqlite::params![key, expiry(ttl)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    // ─── Command queue ──────────────────────────────────────

    /// Append a command to the queue. Returns its id.
    pub async fn enqueue(&self, command: &str, options: &TaskOptions) -> Result<i64> {
        let conn = self.conn.clone();
        let command = command.to_string();
        let options = serde_json::to_string(options)?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO command_queue (command, options, enqueued_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![command, options, now_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    /// Oldest queued commands first, at most `limit`.
    pub async fn pending(&self, limit: usize) -> Result<Vec<QueuedCommand>> {
        let conn = self.conn.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, command, options, enqueued_at FROM command_queue
                 ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, command, options, enqueued_at)| -> Result<QueuedCommand> {
                    Ok(QueuedCommand {
                        id,
                        command,
                        options: serde_json::from_str(&options)?,
                        enqueued_at,
                    })
                })
                .collect()
        })
        .await?
    }

    /// Remove a command once a worker has taken it.
    pub async fn acknowledge(&self, id: i64) -> Result<bool> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let removed = conn.execute(
                "DELETE FROM command_queue WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(removed == 1)
        })
        .await?
    }

    // ─── Housekeeping ───────────────────────────────────────

    /// Delete lock and marker rows whose TTL has passed.
    pub async fn purge_expired(&self) -> Result<PurgeStats> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let now = now_millis();
            let locks = conn.execute(
                "DELETE FROM cron_locks WHERE expires_at <= ?1",
                rusqlite::params![now],
            )?;
            let markers = conn.execute(
                "DELETE FROM cron_markers WHERE expires_at <= ?1",
                rusqlite::params![now],
            )?;
            Ok(PurgeStats { locks, markers })
        })
        .await?
    }
}

#[async_trait]
impl LockService for CronStorage {
    async fn acquire(&self, key: &str, ttl: Duration) -> std::result::Result<LockHandle, LockError> {
        let handle = LockHandle::new(key);
        match self.try_lock(key, &handle.token, ttl).await {
            Ok(true) => Ok(handle),
            Ok(false) => Err(LockError::Held {
                key: key.to_string(),
            }),
            Err(e) => Err(LockError::Backend(e.to_string())),
        }
    }

    async fn release(&self, handle: LockHandle) -> std::result::Result<(), LockError> {
        self.unlock(&handle.key, &handle.token)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl DedupCache for CronStorage {
    async fn get(&self, key: &str) -> std::result::Result<CacheEntry, CacheError> {
        match self.has_marker(key).await {
            Ok(true) => Ok(CacheEntry::hit()),
            Ok(false) => Ok(CacheEntry::miss()),
            Err(e) => Err(CacheError::Backend(e.to_string())),
        }
    }

    async fn set(&self, key: &str, ttl: Duration) -> std::result::Result<(), CacheError> {
        self.put_marker(key, ttl)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}

#[async_trait]
impl TaskDispatcher for CronStorage {
    async fn dispatch(
        &self,
        command: &str,
        options: &TaskOptions,
    ) -> std::result::Result<(), DispatchError> {
        let id = self
            .enqueue(command, options)
            .await
            .map_err(|e| DispatchError::Failed {
                command: command.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(command = %command, id, "Command queued");
        Ok(())
    }
}
