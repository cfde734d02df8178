//! Timeline handling
//!
//! Epoch seconds (`f64`) are the single canonical unit everywhere in the
//! engine. Source files carry seconds, milliseconds or microseconds; they are
//! normalized on read with [`normalize_epoch`].

pub mod openrca_query;
pub mod query;
pub mod remapper;

pub use query::{FaultRecord, QueryParser, QueryResult, TimeRange, WindowSource};
pub use remapper::TimeRemapper;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

pub const MILLIS_PER_SEC: f64 = 1_000.0;
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Values above this are taken to be epoch milliseconds (year 5138 in seconds).
const MILLIS_THRESHOLD: f64 = 1e11;
/// Values above this are taken to be epoch microseconds.
const MICROS_THRESHOLD: f64 = 1e14;

/// Human-readable UTC format used in query results and fault records.
pub const UTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Normalize an epoch value in s / ms / us to float seconds.
#[inline]
pub fn normalize_epoch(raw: f64) -> f64 {
    if raw > MICROS_THRESHOLD {
        raw / MICROS_PER_SEC
    } else if raw > MILLIS_THRESHOLD {
        raw / MILLIS_PER_SEC
    } else {
        raw
    }
}

/// Current wall clock as epoch seconds.
#[inline]
pub fn now_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / MICROS_PER_SEC
}

/// Epoch seconds to `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_utc(ts: f64) -> String {
    utc_datetime(ts)
        .map(|dt| dt.format(UTC_FORMAT).to_string())
        .unwrap_or_else(|| format!("{:.3}", ts))
}

pub fn utc_datetime(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(secs as i64, nanos).single()
}

/// Parse an ISO-8601 timestamp; naive values are taken as UTC.
pub fn parse_iso_utc(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / MICROS_PER_SEC);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| {
            let dt = naive.and_utc();
            dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / MICROS_PER_SEC
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_epoch_units() {
        assert_eq!(normalize_epoch(1_647_716_400.0), 1_647_716_400.0);
        assert_eq!(normalize_epoch(1_647_716_400_000.0), 1_647_716_400.0);
        assert_eq!(normalize_epoch(1_647_716_400_000_000.0), 1_647_716_400.0);
        assert_eq!(normalize_epoch(1_647_716_400_500.0), 1_647_716_400.5);
    }

    #[test]
    fn test_format_and_parse_utc() {
        assert_eq!(format_utc(1_614_870_000.0), "2021-03-04 15:00:00");
        assert_eq!(parse_iso_utc("2021-03-04 15:00:00"), Some(1_614_870_000.0));
        assert_eq!(parse_iso_utc("2021-03-04T23:00:00+08:00"), Some(1_614_870_000.0));
        assert_eq!(parse_iso_utc("2021-03-04T15:00:00Z"), Some(1_614_870_000.0));
        assert_eq!(parse_iso_utc("yesterday"), None);
    }
}
