//! Turning delivery outcomes into entry transitions.
//!
//! | outcome                          | transition                          |
//! |----------------------------------|-------------------------------------|
//! | pipeline success                 | `InProgress → Sent`                 |
//! | permanent failure                | `InProgress → Failed`               |
//! | temporary / system failure       | left `InProgress`, settled on release |
//! | settled on release, in bounds    | `InProgress → Queued` with backoff  |
//! | settled on release, out of bounds| `InProgress → Failed`               |

use chrono::{DateTime, Utc};
use courier_spool::{DeliveryState, QueueEntry};
use tracing::{debug, warn};

use crate::{DeliveryError, policy::RetryPolicy};

/// Result recorded for a successful delivery whose handlers left none.
pub const DEFAULT_SENT_RESULT: &str = "250 OK";

#[derive(Debug, Clone, Default)]
pub struct DeliveryStateMachine {
    retry: RetryPolicy,
}

impl DeliveryStateMachine {
    #[must_use]
    pub const fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Record the outcome of a pipeline run on its entry.
    pub fn apply(
        &self,
        entry: &mut QueueEntry,
        outcome: &Result<(), DeliveryError>,
        now: DateTime<Utc>,
    ) -> DeliveryState {
        let transition = match outcome {
            Ok(()) if entry.has_state(DeliveryState::InProgress) => {
                entry.mark_sent(now, DEFAULT_SENT_RESULT)
            }
            Ok(()) => Ok(()),
            Err(error) if error.is_permanent() => entry.mark_failed(now, error.to_string()),
            Err(error) => {
                entry.result_info = Some(error.to_string());
                Ok(())
            }
        };

        if let Err(error) = transition {
            warn!(
                mail_id = %entry.mail_id,
                recipient = %entry.recipient,
                error = %error,
                "Ignoring delivery outcome for settled entry"
            );
        }

        entry.state()
    }

    /// Settle an entry that is still `InProgress`: requeue it with backoff
    /// while it is in bounds, fail it otherwise. Entries in any other state are
    /// left as they are.
    pub fn settle(&self, entry: &mut QueueEntry, now: DateTime<Utc>) -> DeliveryState {
        if !entry.has_state(DeliveryState::InProgress) {
            return entry.state();
        }

        let retry_at = self.retry.next_retry_at(now, entry.attempts());
        match entry.requeue(now, self.retry.max_attempts, retry_at) {
            Ok(DeliveryState::Queued) => {
                debug!(
                    mail_id = %entry.mail_id,
                    recipient = %entry.recipient,
                    attempt = entry.attempts(),
                    remaining = self.retry.remaining_attempts(entry.attempts()),
                    retry_at = %retry_at,
                    "Requeued for retry"
                );
            }
            Ok(state) => {
                debug!(
                    mail_id = %entry.mail_id,
                    recipient = %entry.recipient,
                    attempt = entry.attempts(),
                    state = %state,
                    "Out of bounds, not retrying"
                );
            }
            Err(error) => {
                warn!(mail_id = %entry.mail_id, error = %error, "Could not settle entry");
            }
        }

        entry.state()
    }
}
