//! Timestamp encoding shared by the store and the wire protocol.
//!
//! Timestamps are written as UTC RFC 3339 with a fixed six-digit fraction
//! (`2024-01-01T00:00:00.000000Z`), so lexical order on the stored text is
//! the same as chronological order. That lets SQLite compare `updated_at`
//! columns as plain text.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Formats a timestamp in the canonical fixed-width form.
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses an RFC 3339 timestamp, or a naive ISO-8601 one interpreted as UTC.
pub fn parse(s: &str) -> Result<DateTime<Utc>, InvalidTimestamp> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }

    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
            return Ok(naive.and_utc());
        }
    }

    Err(InvalidTimestamp(s.to_string()))
}

/// A string that is not a recognizable timestamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp '{0}'")]
pub struct InvalidTimestamp(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert_eq!(format(&a), "2024-01-01T00:00:00.000000Z");
        assert_eq!(format(&a).len(), format(&b).len());
        assert!(format(&a) < format(&b));
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_naive_as_utc() {
        let ts = parse("2024-03-01T12:00:00.250000").unwrap();
        assert_eq!(format(&ts), "2024-03-01T12:00:00.250000Z");

        let ts = parse("2024-03-01 12:00:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_round_trips_canonical_form() {
        let ts = Utc.with_ymd_and_hms(2023, 7, 9, 8, 7, 6).unwrap();
        assert_eq!(parse(&format(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("yesterday").is_err());
        assert!(parse("").is_err());
    }
}
