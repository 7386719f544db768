//! Timestamp range accepted by the job stores.
//!
//! Stores keep timestamps as RFC3339 text and compare them as text, which is
//! only ordered for four-digit years.

use chrono::{DateTime, Datelike, Utc};

const LATEST_SECS: i64 = 253_402_300_799; // 9999-12-31T23:59:59Z

/// `at` falls in years 0000 through 9999.
pub fn is_storable(at: DateTime<Utc>) -> bool {
    (0..=9999).contains(&at.year())
}

/// The last storable second.
pub fn latest_storable() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
