//! Periodic removal of message bodies nothing refers to any more.

use std::{sync::Arc, time::Duration};

use courier_common::{Signal, internal};
use courier_spool::{MailId, MessageStore, QueueStore, SpoolError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info};

use crate::manager::Core;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Messages that still have queue entries.
    pub referenced: usize,
    /// Bodies removed from the message store.
    pub removed: Vec<MailId>,
}

/// Purge completed messages from the queue store, then drop every stored body
/// whose identifier the queue no longer references.
///
/// Callers hold the store lock so no submission can land between the two
/// steps.
///
/// # Errors
/// The first store failure; bodies removed before it stay removed.
pub async fn sweep_stores(
    queue: &dyn QueueStore,
    messages: &dyn MessageStore,
) -> Result<SweepReport, SpoolError> {
    let referenced = queue.sweep().await?;

    let mut removed = Vec::new();
    for mail_id in messages.list_ids().await? {
        if !referenced.contains(&mail_id) {
            messages.remove(&mail_id).await?;
            removed.push(mail_id);
        }
    }

    Ok(SweepReport {
        referenced: referenced.len(),
        removed,
    })
}

/// Runs [`sweep_stores`] on an interval, and once more on shutdown.
#[derive(Debug)]
pub struct MaintenanceSweeper {
    core: Arc<Core>,
    interval: Duration,
}

impl MaintenanceSweeper {
    pub(crate) const fn new(core: Arc<Core>, interval: Duration) -> Self {
        Self { core, interval }
    }

    async fn sweep(&self) {
        match self.core.sweep().await {
            Ok(report) if report.removed.is_empty() => {
                internal!(
                    level = DEBUG,
                    "Sweep found nothing to remove, {} message(s) pending",
                    report.referenced
                );
            }
            Ok(report) => {
                info!(
                    removed = report.removed.len(),
                    pending = report.referenced,
                    "Removed unreferenced message bodies"
                );
            }
            Err(err) => error!(error = %err, "Maintenance sweep failed"),
        }
    }

    pub(crate) async fn run(self, mut signals: broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => self.sweep().await,
                signal = signals.recv() => {
                    if matches!(signal, Err(RecvError::Lagged(_))) {
                        continue;
                    }
                    self.sweep().await;
                    break;
                }
            }
        }

        internal!(level = DEBUG, "Maintenance sweeper stopped");
    }
}
