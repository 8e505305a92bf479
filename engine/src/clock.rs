//! Timestamp helpers.
//!
//! Timestamps are stored as RFC 3339 strings with a fixed microsecond
//! precision and a `Z` suffix, so lexicographic comparison in SQL matches
//! chronological order. Entry creation times are truncated to microseconds
//! at the source so the on-disk, in-store, and in-memory values stay
//! bit-identical through round trips.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time, truncated to microsecond precision.
pub fn now() -> DateTime<Utc> {
    let t = Utc::now();
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

/// Canonical storage format: fixed-width RFC 3339, microseconds, `Z`.
pub fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse any RFC 3339 timestamp back to UTC.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_roundtrip() {
        let t = now();
        let s = fmt_ts(&t);
        assert!(s.ends_with('Z'));
        assert_eq!(parse_ts(&s), Some(t));
    }

    #[test]
    fn lexicographic_order_matches_time() {
        let a = now();
        let b = a + chrono::Duration::microseconds(1);
        assert!(fmt_ts(&a) < fmt_ts(&b));
    }
}
