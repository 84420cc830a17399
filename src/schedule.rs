//! Next-fire-time computation over cron-style schedule expressions.
//!
//! Expressions carry 5 to 7 space-separated fields:
//! `[seconds] minutes hours day-of-month month day-of-week [year]`.
//! The underlying parser requires the seconds field, so a 5-field
//! expression is parsed with an implicit leading `0`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid schedule \"{expr}\": {reason}")]
    Invalid { expr: String, reason: String },

    #[error("schedule \"{expr}\" has no fire time after {after}")]
    Exhausted { expr: String, after: DateTime<Utc> },
}

/// Compute the first fire instant of `expr` strictly after `after`.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = Schedule::from_str(&normalize(expr)).map_err(|e| ScheduleError::Invalid {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::Exhausted {
            expr: expr.to_string(),
            after,
        })
}

fn normalize(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_gets_implicit_seconds() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let next = next_after("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 35, 0).unwrap());
    }

    #[test]
    fn six_field_expression_has_seconds() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let next = next_after("*/10 * * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 50).unwrap());
    }

    #[test]
    fn seven_field_expression_includes_year() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = next_after("0 0 0 1 1 * 2030", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 35, 0).unwrap();
        let next = next_after("*/5 * * * *", after).unwrap();
        assert!(next > after);
    }

    #[test]
    fn garbage_is_invalid() {
        let after = Utc::now();
        assert!(matches!(
            next_after("not a cron", after),
            Err(ScheduleError::Invalid { .. })
        ));
    }

    #[test]
    fn past_year_is_exhausted() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            next_after("0 0 0 1 1 * 2020", after),
            Err(ScheduleError::Exhausted { .. })
        ));
    }
}
