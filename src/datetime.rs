//! Date/time utilities for rssagg.
//!
//! Feed documents carry timestamps in a handful of dialects; the store keeps
//! them as fixed-width RFC 3339 UTC strings so that lexical order in SQL
//! equals chronological order.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Naive layouts accepted in feeds, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%a, %d %b %Y %H:%M:%S",
];

/// Parse a publish timestamp as found in a syndication document.
///
/// Accepted, in order:
/// - RFC 2822 / RFC 1123 (`Mon, 02 Jan 2006 15:04:05 -0700`, also `GMT`, `EST`...)
/// - RFC 3339 (`2006-01-02T15:04:05Z`)
/// - naive date-times (see `NAIVE_FORMATS`), taken as UTC
/// - a bare `YYYY-MM-DD`, taken as midnight UTC
///
/// Returns `None` for anything else; callers substitute the ingestion time.
pub fn parse_feed_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Format a timestamp for storage.
pub fn to_stored(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp (RFC 3339, or SQLite's `datetime('now')` layout).
pub fn parse_stored(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
