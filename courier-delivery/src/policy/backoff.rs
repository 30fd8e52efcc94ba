//! Exponential backoff with jitter

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Delay before the attempt following `attempt`, without jitter.
///
/// `min(base * 2^(attempt - 1), max)`, with `attempt` 1-indexed.
#[must_use]
pub fn backoff_delay_secs(attempt: u32, base_delay_secs: u64, max_delay_secs: u64) -> u64 {
    let exponent = attempt.saturating_sub(1);
    if exponent >= 63 {
        return max_delay_secs;
    }

    base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(max_delay_secs)
}

/// When the next attempt should happen, counted from `now`.
///
/// The backoff delay is randomised within `±jitter_factor` so entries failing
/// together do not retry together.
#[must_use]
pub fn calculate_next_retry_time(
    now: DateTime<Utc>,
    attempt: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    jitter_factor: f64,
) -> DateTime<Utc> {
    let delay = backoff_delay_secs(attempt, base_delay_secs, max_delay_secs);

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap
    )]
    let jittered_delay = {
        let jitter_range = (delay as f64) * jitter_factor.clamp(0.0, 1.0);
        let jitter: f64 = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        ((delay as f64) + jitter).max(0.0) as i64
    };

    TimeDelta::try_seconds(jittered_delay)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
