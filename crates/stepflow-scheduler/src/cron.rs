//! Cron expression handling
//!
//! Expressions use six fields with seconds first (`sec min hour dom month
//! dow`). Validation and next-fire computation delegate to the `cron` crate;
//! the minimum-interval estimate used by missed-run detection is derived
//! from the raw seconds field, deliberately conservatively. Over-estimating
//! the interval only makes catch-up less eager, never wrong.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// A validated cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Conservative lower bound on the gap between consecutive firings,
    /// derived from the seconds field alone:
    ///
    /// - `*/k` → k seconds
    /// - `*` → 1 second
    /// - comma list → minimum successive-value gap
    /// - a literal (or anything unrecognized) → 60 seconds
    pub fn min_interval(&self) -> Duration {
        let seconds_field = self.expression.split_whitespace().next().unwrap_or("");
        Duration::from_secs(seconds_field_min_interval(seconds_field))
    }

    /// Whether a firing was missed between `last` and `now` (both in
    /// milliseconds since epoch). True iff at least one minimum interval has
    /// elapsed since the last firing.
    pub fn should_have_run(&self, last: i64, now: i64) -> bool {
        let min_interval_ms = self.min_interval().as_millis() as i64;
        last + min_interval_ms <= now && last < now
    }
}

fn seconds_field_min_interval(field: &str) -> u64 {
    if field == "*" {
        return 1;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u64>().map(|k| k.max(1)).unwrap_or(60);
    }
    if field.contains(',') {
        let values: Option<Vec<u64>> =
            field.split(',').map(|v| v.trim().parse().ok()).collect();
        if let Some(mut values) = values {
            values.sort_unstable();
            values.dedup();
            let min_gap = values
                .windows(2)
                .map(|pair| pair[1] - pair[0])
                .min();
            if let Some(gap) = min_gap {
                return gap;
            }
        }
        return 60;
    }
    // A literal second fires once per minute; unknown shapes assume the same.
    60
}
