//! Standard 5-field cron expression matching.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week. Each field is
//! a comma-separated union of values, ranges, steps and wildcards. When both
//! day fields are restricted a time matches if *either* one matches, as in
//! Vixie cron.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::ExpressionError;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names mapped to `min + index`.
    names: &'static [&'static str],
    /// Whether `?` is accepted as a wildcard.
    question_mark: bool,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    question_mark: false,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    question_mark: false,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    question_mark: true,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    question_mark: false,
};
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    question_mark: true,
};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    /// Parses a 5-field expression or one of the `@hourly`-style macros.
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(expression, trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ExpressionError::new(
                expression,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(expression, fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.to_string(),
            minutes: parse_field(expression, fields[0], &MINUTE)?,
            hours: parse_field(expression, fields[1], &HOUR)?,
            days_of_month: parse_field(expression, fields[2], &DAY_OF_MONTH)?,
            months: parse_field(expression, fields[3], &MONTH)?,
            days_of_week,
            dom_restricted: is_restricted(fields[2]),
            dow_restricted: is_restricted(fields[4]),
        })
    }

    /// The expression as it was written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `time` falls in this expression's fire window. Seconds are ignored.
    pub fn matches(&self, time: &NaiveDateTime) -> bool {
        let bit = |set: u64, value: u32| set & (1u64 << value) != 0;

        if !bit(self.minutes, time.minute())
            || !bit(self.hours, time.hour())
            || !bit(self.months, time.month())
        {
            return false;
        }

        let dom = bit(self.days_of_month, time.day());
        let dow = bit(self.days_of_week, time.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parses `expression` and checks it against `time`.
pub fn is_due(expression: &str, time: &NaiveDateTime) -> Result<bool, ExpressionError> {
    Ok(CronExpression::parse(expression)?.matches(time))
}

fn expand_macro<'a>(expression: &str, trimmed: &'a str) -> Result<&'a str, ExpressionError> {
    match trimmed.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(ExpressionError::new(
            expression,
            format!("unsupported macro '{trimmed}'"),
        )),
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn parse_field(expression: &str, field: &str, spec: &FieldSpec) -> Result<u64, ExpressionError> {
    let mut set = 0u64;

    for item in field.split(',') {
        if item.is_empty() {
            return Err(ExpressionError::new(
                expression,
                format!("empty list item in {} field", spec.name),
            ));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(expression, step, spec)?)),
            None => (item, None),
        };

        let (lo, hi) = if range == "*" || (range == "?" && spec.question_mark) {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(expression, a, spec)?;
            let hi = parse_value(expression, b, spec)?;
            if lo > hi {
                return Err(ExpressionError::new(
                    expression,
                    format!("range {lo}-{hi} is reversed in {} field", spec.name),
                ));
            }
            (lo, hi)
        } else {
            let value = parse_value(expression, range, spec)?;
            // "5/15" means "from 5 to the end, every 15".
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        for value in (lo..=hi).step_by(step.unwrap_or(1)) {
            set |= 1u64 << value;
        }
    }

    Ok(set)
}

fn parse_step(expression: &str, step: &str, spec: &FieldSpec) -> Result<usize, ExpressionError> {
    match step.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ExpressionError::new(
            expression,
            format!("invalid step '{step}' in {} field", spec.name),
        )),
    }
}

fn parse_value(expression: &str, token: &str, spec: &FieldSpec) -> Result<u32, ExpressionError> {
    let value = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|idx| spec.min + idx as u32)
            .ok_or_else(|| {
                ExpressionError::new(
                    expression,
                    format!("invalid value '{token}' in {} field", spec.name),
                )
            })?,
    };

    if value < spec.min || value > spec.max {
        return Err(ExpressionError::new(
            expression,
            format!(
                "value {value} out of range {}-{} in {} field",
                spec.min, spec.max, spec.name
            ),
        ));
    }
    Ok(value)
}
