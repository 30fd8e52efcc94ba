use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::{DnsConfig, policy::RetryPolicy};

fn default_max_workers() -> usize {
    num_cpus::get()
}

const fn default_borrow_timeout_ms() -> u64 {
    5000
}

const fn default_idle_wait_secs() -> u64 {
    60
}

const fn default_worker_idle_wait_secs() -> u64 {
    60
}

const fn default_sweep_interval_secs() -> u64 {
    3600 // 1 hour
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

#[allow(clippy::unnecessary_wraps)]
const fn default_expiry_secs() -> Option<u64> {
    Some(4 * 24 * 3600) // 4 days
}

/// Settings for the delivery manager, its worker pool and the sweeper.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound on concurrently running workers
    ///
    /// Default: number of CPUs
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long the loop waits to borrow a worker before releasing the entry
    /// back to the queue (in milliseconds)
    ///
    /// Default: 5000
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,

    /// How long the loop sleeps when nothing is eligible, unless woken
    /// (in seconds)
    ///
    /// Default: 60
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,

    /// How long an idle worker waits for an assignment before looping
    /// (in seconds)
    ///
    /// Default: 60
    #[serde(default = "default_worker_idle_wait_secs")]
    pub worker_idle_wait_secs: u64,

    /// Interval between maintenance sweeps (in seconds)
    ///
    /// Default: 3600
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long in-flight deliveries may run after shutdown before they are
    /// interrupted (in seconds)
    ///
    /// Default: 30
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Retention for messages submitted without an expiry (in seconds);
    /// `None` keeps them until delivered or out of attempts
    ///
    /// Default: 345600 (4 days)
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
            idle_wait_secs: default_idle_wait_secs(),
            worker_idle_wait_secs: default_worker_idle_wait_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            default_expiry_secs: default_expiry_secs(),
            retry: RetryPolicy::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    #[must_use]
    pub const fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }

    #[must_use]
    pub const fn worker_idle_wait(&self) -> Duration {
        Duration::from_secs(self.worker_idle_wait_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Expiry for a message submitted at `now` without one of its own.
    /// Retentions past the representable range saturate.
    #[must_use]
    pub fn default_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.default_expiry_secs.map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|retention| now.checked_add_signed(retention))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }
}
