use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

pub fn utc_ns_now() -> u64 {
    since_epoch().as_nanos() as u64
}

pub fn utc_ms_now() -> u64 {
    since_epoch().as_millis() as u64
}

/// RFC 3339 rendering of a millisecond UTC timestamp.
pub fn format_utc_ms(utc_ms: u64) -> String {
    i64::try_from(utc_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("{}ms", utc_ms))
}
