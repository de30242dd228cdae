//! cronjob-core: cron trigger coordination.
//!
//! Decides, once per minute and across any number of concurrent invokers,
//! which registered tasks are due and hands each due occurrence to a
//! [`TaskDispatcher`] at most once. Locking, dedup markers and dispatch are
//! collaborators behind traits; [`memory`] has process-local versions.

pub mod error;
pub mod expression;
pub mod instant;
pub mod keys;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod traits;
pub mod trigger;

pub use error::{
    CacheError, DispatchError, ExpressionError, LockError, ProviderError, SchedulerError,
};
pub use expression::{CronExpression, is_due};
pub use instant::{Clock, EvaluationInstant, FixedClock, SystemClock};
pub use registry::{JsonFileProvider, StaticProvider, TaskRegistry};
pub use scheduler::{CycleOutcome, SchedulerLoop, SchedulerSettings, delay_until_next_minute};
pub use traits::{
    CacheEntry, CronTrigger, DedupCache, LockHandle, LockService, TaskDispatcher, TaskProvider,
};
pub use trigger::{TriggerCoordinator, TriggerSettings};
