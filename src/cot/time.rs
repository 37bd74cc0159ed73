//! CoT timestamp handling.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::core::{CommoError, Result};

/// Current time as a CoT timestamp plus `offset`.
pub fn cot_time_from_now(offset: Duration) -> DateTime<Utc> {
    let offset = chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + offset
}

/// Format a timestamp the way CoT expects (`2024-01-31T12:00:00.000Z`).
pub fn format_cot_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a CoT timestamp into POSIX milliseconds.
pub fn parse_cot_millis(s: &str) -> Result<i64> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.timestamp_millis());
    }
    // Some producers omit the zone designator
    let trimmed = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc().timestamp_millis())
        .map_err(|e| CommoError::Parse(format!("bad CoT time {s:?}: {e}")))
}

/// Convert POSIX milliseconds back into a timestamp.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let ms = parse_cot_millis("2020-02-03T04:05:06.789Z").unwrap();
        assert_eq!(format_cot_time(&from_millis(ms)), "2020-02-03T04:05:06.789Z");
    }

    #[test]
    fn test_parse_variants() {
        assert!(parse_cot_millis("2020-02-03T04:05:06Z").is_ok());
        assert!(parse_cot_millis("2020-02-03T04:05:06.1").is_ok());
        assert!(parse_cot_millis("yesterday").is_err());
    }
}
