//! Cron handling for repeatable jobs

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Parse a cron expression.
///
/// Five-field expressions (`min hour dom mon dow`) are accepted and fire at
/// second zero; six and seven field expressions are used as-is.
pub fn parse_schedule(pattern: &str) -> Result<Schedule> {
    let fields = pattern.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", pattern.trim()),
        6 | 7 => pattern.trim().to_string(),
        n => {
            return Err(QueueError::InvalidCron {
                pattern: pattern.to_string(),
                reason: format!("expected 5 to 7 fields, found {}", n),
            })
        }
    };

    Schedule::from_str(&normalized).map_err(|e| QueueError::InvalidCron {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time strictly after `after`
pub fn next_run(pattern: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse_schedule(pattern)?.after(&after).next())
}

/// Key identifying a repeatable definition.
///
/// Registering the same job name with the same pattern twice resolves to the
/// same key, so the second registration updates the first.
pub fn repeat_key(job_name: &str, pattern: &str) -> String {
    format!("{}::{}", job_name, pattern.trim())
}

/// Id of the job materialized by a repeatable definition for one fire time
pub(crate) fn repeat_job_id(key: &str, run_at: DateTime<Utc>) -> String {
    format!("repeat:{}:{}", key, run_at.timestamp_millis())
}
