//! Exponential backoff for failed jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time;

/// Default `backoff-base`.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Longest delay the policy will ever produce.
const MAX_DELAY_SECS: u64 = u32::MAX as u64;

/// Retry policy: `delay(attempts) = base ^ attempts` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Exponent base, in seconds.
    pub base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    /// Delay before a job that has made `attempts` attempts may run again.
    ///
    /// Saturates at `u32::MAX` seconds.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let secs = u64::from(self.base)
            .checked_pow(attempts)
            .unwrap_or(MAX_DELAY_SECS)
            .min(MAX_DELAY_SECS);
        Duration::from_secs(secs)
    }

    /// Earliest time the job becomes eligible again, capped at the last
    /// storable second.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.delay_for_attempt(attempts).as_secs() as i64;
        let latest = time::latest_storable();
        now.checked_add_signed(chrono::Duration::seconds(secs))
            .map_or(latest, |at| at.min(latest))
    }
}
