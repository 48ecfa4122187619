// ABOUTME: Timestamp helpers shared across weft components.
// ABOUTME: All persisted and logged timestamps are UTC RFC3339.
use chrono::{DateTime, SecondsFormat, Utc};

/// Format a UTC timestamp as RFC3339 with second precision.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// let t = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(wf_core::to_rfc3339(t), "2021-01-01T00:00:00Z");
/// ```
pub fn to_rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time as an RFC3339 string.
pub fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_rfc3339() {
        let t = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_rfc3339(t), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn test_now_rfc3339_parses_back() {
        let s = now_rfc3339();
        let parsed = DateTime::parse_from_rfc3339(&s).unwrap();
        assert!(parsed.timestamp() > 1_577_836_800); // after 2020-01-01
    }
}
