//! Attempt limits and retry scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backoff::calculate_next_retry_time;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before an entry is failed.
    ///
    /// Default: 25 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubles with every further one.
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Cap on the retry delay.
    ///
    /// Default: 86400 seconds (24 hours)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Delays are randomised within ±`retry_jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry that has made `attempt_count` attempts may make another.
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// When an entry that has made `attempt_count` attempts should be tried
    /// again.
    #[must_use]
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt_count: u32) -> DateTime<Utc> {
        calculate_next_retry_time(
            now,
            attempt_count,
            self.base_retry_delay_secs,
            self.max_retry_delay_secs,
            self.retry_jitter_factor,
        )
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempt_count: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt_count)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        25
    }

    pub const fn base_retry_delay_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn max_retry_delay_secs() -> u64 {
        86400 // 24 hours
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}
