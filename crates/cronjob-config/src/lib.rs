use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cronjob_types::{DEFAULT_LOCK_TTL_SECS, ScheduleSpec};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "CRONJOB_CONFIG";

/// File name of the background-mode marker inside the temp dir.
pub const PID_FILE_NAME: &str = ".cron-pid";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Settings for the per-minute trigger protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Namespace prefix of the per-minute lock and marker.
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
    /// TTL of the per-minute "already evaluated" marker.
    #[serde(default = "default_global_marker_ttl")]
    pub global_marker_ttl_secs: u64,
    /// TTL of the per-minute lock. Never released explicitly.
    #[serde(default = "default_global_lock_ttl")]
    pub global_lock_ttl_secs: u64,
    /// Marker TTL for tasks that don't declare one.
    #[serde(default = "default_task_ttl")]
    pub default_task_ttl_secs: u64,
    /// Upper bound on how long a per-task lock can outlive a crashed holder.
    #[serde(default = "default_task_lock_ttl")]
    pub task_lock_ttl_secs: u64,
    /// Leave no marker when dispatch fails, so a later invoker retries.
    #[serde(default)]
    pub retry_on_dispatch_failure: bool,
    /// Zone in which cron expressions are evaluated.
    #[serde(default)]
    pub timezone: TimeZoneSetting,
}

fn default_lock_prefix() -> String {
    "cron-trigger".to_string()
}

fn default_global_marker_ttl() -> u64 {
    120
}

fn default_global_lock_ttl() -> u64 {
    60
}

fn default_task_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_task_lock_ttl() -> u64 {
    30
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            lock_prefix: default_lock_prefix(),
            global_marker_ttl_secs: default_global_marker_ttl(),
            global_lock_ttl_secs: default_global_lock_ttl(),
            default_task_ttl_secs: default_task_ttl(),
            task_lock_ttl_secs: default_task_lock_ttl(),
            retry_on_dispatch_failure: false,
            timezone: TimeZoneSetting::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeZoneSetting {
    #[default]
    Local,
    Utc,
}

/// Settings for the long-running scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Resident memory ceiling; the loop exits fatally past it.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,
    /// TTL of the outer per-minute scheduling lock.
    #[serde(default = "default_scheduler_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Marker file for background mode. Defaults to `<temp dir>/.cron-pid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

fn default_memory_limit() -> u64 {
    1024
}

fn default_scheduler_lock_ttl() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: default_memory_limit(),
            lock_ttl_secs: default_scheduler_lock_ttl(),
            pid_file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(PID_FILE_NAME))
    }
}

/// HTTP trigger server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token required on `POST /cron/trigger` (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Run a trigger pass after every handled request.
    #[serde(default)]
    pub trigger_on_request: bool,
    /// Default polling interval of the auto-trigger script.
    #[serde(default = "default_auto_trigger_interval")]
    pub auto_trigger_interval_ms: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_auto_trigger_interval() -> u64 {
    60_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
            trigger_on_request: false,
            auto_trigger_interval_ms: default_auto_trigger_interval(),
        }
    }
}

/// Where locks and dedup markers live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// SQLite database shared by every process on the host.
    Sqlite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// Process-local maps. Only safe with a single invoker process.
    Memory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Sqlite { path: None }
    }
}

/// Where triggered commands are handed off to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchConfig {
    /// Append to the SQLite `command_queue` table for an external worker.
    #[default]
    Queue,
    /// POST the command as JSON to a URL.
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
    /// Only log the command.
    Log,
}

fn default_webhook_timeout() -> u64 {
    10
}

/// A statically registered command and its schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTaskConfig {
    pub command: String,
    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
}

/// Top-level cronjob configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronJobConfig {
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Statically registered commands.
    #[serde(default)]
    pub tasks: Vec<StaticTaskConfig>,
    /// JSON files of task descriptors, re-read on every evaluation.
    #[serde(default)]
    pub task_files: Vec<PathBuf>,
}

impl CronJobConfig {
    /// SQLite path for the shared backend, or `None` for the in-memory one.
    pub fn sqlite_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        match &self.backend {
            BackendConfig::Memory => Ok(None),
            BackendConfig::Sqlite { path: Some(p) } => Ok(Some(p.clone())),
            BackendConfig::Sqlite { path: None } => {
                Ok(Some(ensure_config_dir()?.join("cronjob.db")))
            }
        }
    }
}

/// Resolve the config directory (~/.cronjob/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".cronjob"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path, honouring `CRONJOB_CONFIG`.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<CronJobConfig, ConfigError> {
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<CronJobConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(CronJobConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: CronJobConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CronJobConfig::default();
        assert_eq!(config.trigger.lock_prefix, "cron-trigger");
        assert_eq!(config.trigger.global_marker_ttl_secs, 120);
        assert_eq!(config.trigger.default_task_ttl_secs, 3600);
        assert!(!config.trigger.retry_on_dispatch_failure);
        assert_eq!(config.scheduler.memory_limit_mb, 1024);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.dispatch, DispatchConfig::Queue);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            trigger: { global_marker_ttl_secs: 90, retry_on_dispatch_failure: true, timezone: "utc" },
            scheduler: { memory_limit_mb: 256 },
            backend: { type: "memory" },
            dispatch: { type: "webhook", url: "http://worker/run" },
            tasks: [
                { command: "app:cleanup", schedules: [{ expression: "0 * * * *", lock_ttl: 600 }, {}] },
            ],
            task_files: ["/etc/cronjob/tasks.json"],
        }"#;
        let config: CronJobConfig = json5::from_str(json5_str).unwrap();
        assert_eq!(config.trigger.global_marker_ttl_secs, 90);
        assert_eq!(config.trigger.default_task_ttl_secs, 3600);
        assert!(config.trigger.retry_on_dispatch_failure);
        assert_eq!(config.trigger.timezone, TimeZoneSetting::Utc);
        assert_eq!(config.scheduler.memory_limit_mb, 256);
        assert_eq!(config.backend, BackendConfig::Memory);
        match &config.dispatch {
            DispatchConfig::Webhook { url, timeout_secs, .. } => {
                assert_eq!(url, "http://worker/run");
                assert_eq!(*timeout_secs, 10);
            }
            other => panic!("unexpected dispatch config: {other:?}"),
        }
        assert_eq!(config.tasks[0].schedules.len(), 2);
        assert_eq!(config.tasks[0].schedules[1].expression, "* * * * *");
        assert_eq!(config.task_files.len(), 1);
    }

    #[test]
    fn test_memory_backend_has_no_sqlite_path() {
        let config = CronJobConfig {
            backend: BackendConfig::Memory,
            ..Default::default()
        };
        assert_eq!(config.sqlite_path().unwrap(), None);
    }

    #[test]
    fn test_explicit_sqlite_path() {
        let config: CronJobConfig =
            json5::from_str(r#"{ backend: { type: "sqlite", path: "/tmp/x.db" } }"#).unwrap();
        assert_eq!(
            config.sqlite_path().unwrap(),
            Some(PathBuf::from("/tmp/x.db"))
        );
    }

    #[test]
    fn test_pid_file_defaults_to_temp_dir() {
        let config = SchedulerConfig::default();
        assert_eq!(
            config.pid_file_path(),
            std::env::temp_dir().join(".cron-pid")
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config.trigger.lock_prefix, "cron-trigger");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(&path, "{ gateway: { port: 9000, trigger_on_request: true } }").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert!(config.gateway.trigger_on_request);
    }
}
