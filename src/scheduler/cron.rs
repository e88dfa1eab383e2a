//! Cron-expression parsing and `next_run` computation, in UTC (§4.1).
//!
//! Schedule fields follow standard cron semantics extended with a leading
//! `sec` field and a trailing `year` field, giving the `cron` crate's
//! seven-field format (`sec min hour dom mon dow year`). A bare five-field
//! Unix expression is not a valid input here — callers go through
//! [`CronDefinition::cron_expression`][crate::types::CronDefinition::cron_expression],
//! which always supplies `sec` and `year`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::types::error::SchedulerError;

/// Parse a cron definition's expression, returning an error that names
/// the owning cron for diagnostics.
pub fn parse(name: &str, expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidSchedule {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Compute the next fire instant strictly after `after` (or now, if
/// `after` is `None`).
pub fn next_run_after(schedule: &Schedule, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let reference = after.unwrap_or_else(Utc::now);
    schedule.after(&reference).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn seven_field_expression_parses() {
        let schedule = parse("every-minute", "0 * * * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let next = next_run_after(&schedule, Some(after)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn five_field_unix_cron_is_rejected() {
        let err = parse("bad", "*/5 * * * *").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(parse("bad", "not a cron").is_err());
    }
}
