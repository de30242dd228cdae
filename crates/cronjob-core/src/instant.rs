//! Minute-resolution evaluation instants and the clocks that produce them.

use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike, Utc};

/// A timestamp truncated to the minute.
///
/// Used both as cron-matching input and as the dedup partition key of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvaluationInstant(NaiveDateTime);

impl EvaluationInstant {
    pub fn new(time: NaiveDateTime) -> Self {
        let truncated = time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(time);
        Self(truncated)
    }

    pub fn as_naive(&self) -> &NaiveDateTime {
        &self.0
    }

    /// `YYYYMMDDHHmm`.
    pub fn minute_key(&self) -> String {
        self.0.format("%Y%m%d%H%M").to_string()
    }

    /// `YYYYMMDDHHmm00`.
    pub fn second_key(&self) -> String {
        self.0.format("%Y%m%d%H%M00").to_string()
    }
}

impl From<NaiveDateTime> for EvaluationInstant {
    fn from(time: NaiveDateTime) -> Self {
        Self::new(time)
    }
}

impl fmt::Display for EvaluationInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M"))
    }
}

/// Source of "now" in the zone cron expressions are evaluated in.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock, in local time or UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    utc: bool,
}

impl SystemClock {
    pub fn local() -> Self {
        Self { utc: false }
    }

    pub fn utc() -> Self {
        Self { utc: true }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        if self.utc {
            Utc::now().naive_utc()
        } else {
            Local::now().naive_local()
        }
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
