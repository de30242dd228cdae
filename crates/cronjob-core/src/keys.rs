//! Lock and marker key derivation.

use sha2::{Digest, Sha256};

use cronjob_types::TaskOptions;

use crate::instant::EvaluationInstant;

/// Prefix of the scheduler loop's outer per-minute lock.
pub const SCHEDULER_LOCK_PREFIX: &str = "cron-scheduler";

/// Key shared by the per-minute lock and marker.
pub fn global_key(prefix: &str, instant: &EvaluationInstant) -> String {
    format!("{prefix}-{}", instant.minute_key())
}

/// Key of the scheduler loop's outer lock for the minute containing `unix_secs`.
pub fn scheduler_key(unix_secs: i64) -> String {
    format!("{SCHEDULER_LOCK_PREFIX}-{}", unix_secs.div_euclid(60))
}

/// SHA-256 over the canonical JSON form of `options`.
///
/// `TaskOptions` is a sorted map, so equal contents always hash equally.
pub fn options_digest(options: &TaskOptions) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(options)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Lock and marker keys of one task occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKey {
    pub lock_key: String,
    pub cache_key: String,
}

impl TaskKey {
    pub fn derive(
        command: &str,
        options: &TaskOptions,
        instant: &EvaluationInstant,
    ) -> Result<Self, serde_json::Error> {
        let lock_key = format!(
            "{}{}-cron-{}",
            command.replace(':', "-"),
            options_digest(options)?,
            instant.second_key()
        );
        let cache_key = format!("task-{lock_key}");
        Ok(Self {
            lock_key,
            cache_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn instant() -> EvaluationInstant {
        EvaluationInstant::new(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 30)
                .unwrap(),
        )
    }

    #[test]
    fn global_key_format() {
        assert_eq!(global_key("cron-trigger", &instant()), "cron-trigger-202401010000");
    }

    #[test]
    fn scheduler_key_floors_to_minute() {
        assert_eq!(scheduler_key(0), "cron-scheduler-0");
        assert_eq!(scheduler_key(59), "cron-scheduler-0");
        assert_eq!(scheduler_key(60), "cron-scheduler-1");
        assert_eq!(scheduler_key(1_704_067_230), "cron-scheduler-28401120");
    }

    #[test]
    fn task_key_format() {
        let key = TaskKey::derive("report:daily", &TaskOptions::new(), &instant()).unwrap();
        let digest = options_digest(&TaskOptions::new()).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(
            key.lock_key,
            format!("report-daily{digest}-cron-20240101000000")
        );
        assert_eq!(key.cache_key, format!("task-{}", key.lock_key));
    }

    #[test]
    fn distinct_options_distinct_keys() {
        let mut a = TaskOptions::new();
        a.insert("date".into(), json!("2024-01-01"));
        let mut b = TaskOptions::new();
        b.insert("date".into(), json!("2024-01-02"));

        let ka = TaskKey::derive("report:daily", &a, &instant()).unwrap();
        let kb = TaskKey::derive("report:daily", &b, &instant()).unwrap();
        assert_ne!(ka, kb);

        let nested_a: TaskOptions = serde_json::from_value(json!({"x": {"b": 1, "a": 2}})).unwrap();
        let nested_b: TaskOptions = serde_json::from_value(json!({"x": {"a": 2, "b": 1}})).unwrap();
        assert_eq!(
            options_digest(&nested_a).unwrap(),
            options_digest(&nested_b).unwrap()
        );
    }

    #[test]
    fn keys_are_deterministic() {
        let mut opts = TaskOptions::new();
        opts.insert("n".into(), json!(1));
        assert_eq!(
            TaskKey::derive("a:b", &opts, &instant()).unwrap(),
            TaskKey::derive("a:b", &opts, &instant()).unwrap()
        );
    }
}
