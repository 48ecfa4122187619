//! ABOUTME: Cron expression parsing and timezone-aware next-fire computation
//! ABOUTME: User-facing expressions are standard 5-field (minute..day-of-week)

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use wf_core::{Error, Result};

/// Parse a standard 5-field cron expression. The `cron` crate wants a
/// leading seconds field, so `* * * * *` becomes `0 * * * * *`.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(Error::Validation(format!(
            "Cron expression '{}' must have 5 fields, found {}",
            expr, fields
        )));
    }
    let normalized = format!("0 {}", expr);
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Validate an expression without keeping the schedule
pub fn validate_expression(expr: &str) -> Result<()> {
    parse_schedule(expr).map(|_| ())
}

/// Parse an IANA timezone name
pub fn parse_timezone(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>()
        .map_err(|_| Error::Validation(format!("Invalid timezone '{}'", tz)))
}

/// Next fire instant strictly after `after`, computed in the entry's
/// timezone and returned in UTC. None when the schedule has run out.
pub fn next_fire(expr: &str, timezone: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_schedule(expr)?;
    let tz = parse_timezone(timezone)?;
    let local_after = after.with_timezone(&tz);
    Ok(schedule
        .after(&local_after)
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_accepted() {
        assert!(validate_expression("*/5 * * * *").is_ok());
        assert!(validate_expression("0 9 * * 1-5").is_ok());
        assert!(validate_expression("30 2 1 * *").is_ok());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        // 6-field (with seconds) is not the user-facing format
        assert!(validate_expression("0 0 9 * * *").is_err());
        assert!(validate_expression("* * * *").is_err());
        assert!(validate_expression("").is_err());
        assert!(validate_expression("not a cron").is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(validate_expression("61 * * * *").is_err());
        assert!(validate_expression("* 25 * * *").is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("UTC").is_ok());
        assert!(parse_timezone("America/Chicago").is_ok());
    }

    #[test]
    fn test_next_fire_utc() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let next = next_fire("0 13 * * *", "UTC", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        // 09:00 in Chicago (CST, UTC-6 on this date) is 15:00 UTC
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let next = next_fire("0 9 * * *", "America/Chicago", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_strictly_after() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        let next = next_fire("0 13 * * *", "UTC", instant).unwrap().unwrap();
        // the same instant never fires twice
        assert!(next > instant);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 13, 0, 0).unwrap());
    }
}
