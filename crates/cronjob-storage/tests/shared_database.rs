use std::sync::Arc;

use chrono::NaiveDate;

use cronjob_core::{FixedClock, TaskRegistry, TriggerCoordinator};
use cronjob_storage::CronStorage;
use cronjob_types::ScheduleSpec;

/// Several invokers, each with its own connection to one database file,
/// race to evaluate the same minute.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_handles_dispatch_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cronjob.db");
    let now = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();

    let invokers: Vec<_> = (0..6)
        .map(|_| {
            let storage = Arc::new(CronStorage::open(&path).unwrap());
            TriggerCoordinator::new(storage.clone(), storage.clone(), storage)
                .with_clock(Arc::new(FixedClock(now)))
                .with_registry(
                    TaskRegistry::builder()
                        .schedule("cmd:foo", ScheduleSpec::default())
                        .schedule("report:daily", ScheduleSpec::new("0 0 * * *"))
                        .build(),
                )
        })
        .collect();

    let results = futures::future::join_all(
        invokers
            .iter()
            .map(|coordinator| coordinator.trigger_scheduled_tasks()),
    )
    .await;
    assert_eq!(results.iter().filter(|r| **r).count(), 1);

    let queue = CronStorage::open(&path).unwrap();
    let mut commands: Vec<String> = queue
        .pending(100)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.command)
        .collect();
    commands.sort();
    assert_eq!(commands, ["cmd:foo", "report:daily"]);
}
