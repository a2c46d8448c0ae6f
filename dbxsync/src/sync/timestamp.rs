//! Ledger timestamp encoding.
//!
//! Timestamps are stored as local wall-clock time with a numeric offset,
//! e.g. `2024-01-01T00:00:00+0000`. Older ledgers stored bare
//! `2024-01-01 00:00:00` strings; those are read in the configured zone and
//! come back out in the qualified form on the next save.

use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

const QUALIFIED_FORMATS: &[&str] = &[TIMESTAMP_FORMAT, "%Y-%m-%d %H:%M:%S%z"];
const LEGACY_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub type Timestamp = DateTime<FixedOffset>;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("unrecognised timestamp: {0}")]
    Unrecognised(String),
    #[error("{0} does not exist in the configured time zone")]
    NonExistentLocalTime(String),
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a ledger value, localising legacy zone-less values in `tz`.
pub fn parse_timestamp(value: &str, tz: Tz) -> Result<Timestamp, TimestampError> {
    let value = value.trim();
    for format in QUALIFIED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed);
    }
    for format in LEGACY_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.fixed_offset())
                .ok_or_else(|| TimestampError::NonExistentLocalTime(value.to_string()));
        }
    }
    Err(TimestampError::Unrecognised(value.to_string()))
}

/// Parses a server-side modification time (RFC 3339, usually `...Z`).
pub fn parse_server_time(value: &str) -> Result<Timestamp, TimestampError> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|_| TimestampError::Unrecognised(value.to_string()))
}

/// Converts a filesystem time into the configured zone, truncated to whole seconds.
pub fn from_system_time(time: SystemTime, tz: Tz) -> Timestamp {
    let utc: DateTime<Utc> = time.into();
    let utc = utc.with_nanosecond(0).unwrap_or(utc);
    utc.with_timezone(&tz).fixed_offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_with_numeric_offset() {
        let ts = parse_server_time("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-01T00:00:00+0000");
    }

    #[test]
    fn parses_qualified_value_verbatim() {
        let ts = parse_timestamp("2024-02-01T09:00:00+0100", chrono_tz::UTC).unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 3600);
        assert_eq!(format_timestamp(&ts), "2024-02-01T09:00:00+0100");
    }

    #[test]
    fn legacy_value_is_localised_in_configured_zone() {
        let ts = parse_timestamp("2024-07-01 12:00:00", chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-07-01T12:00:00+0200");
        assert_eq!(ts, parse_server_time("2024-07-01T10:00:00Z").unwrap());
    }

    #[test]
    fn legacy_value_in_dst_gap_is_rejected() {
        let err = parse_timestamp("2024-03-31 02:30:00", chrono_tz::Europe::Berlin).unwrap_err();
        assert!(matches!(err, TimestampError::NonExistentLocalTime(_)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_timestamp("yesterday", chrono_tz::UTC).is_err());
    }

    #[test]
    fn system_time_is_truncated_to_seconds() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200);
        let ts = from_system_time(base + Duration::from_millis(750), chrono_tz::UTC);
        assert_eq!(format_timestamp(&ts), "2024-01-01T00:00:00+0000");
        assert_eq!(ts, from_system_time(base, chrono_tz::UTC));
    }

    #[test]
    fn comparisons_ignore_offsets() {
        let cloud = parse_timestamp("2024-02-01T10:00:00+0000", chrono_tz::UTC).unwrap();
        let server = parse_server_time("2024-02-01T10:00:00Z").unwrap();
        let earlier = parse_timestamp("2024-02-01T11:00:00+0200", chrono_tz::UTC).unwrap();
        assert_eq!(cloud, server);
        assert!(earlier < server);
    }
}
