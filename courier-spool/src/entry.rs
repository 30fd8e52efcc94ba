//! Per-recipient queue entries and the transitions between their states.
//!
//! ```text
//!            begin_attempt                 mark_sent
//!   Queued ───────────────▶ InProgress ─────────────▶ Sent
//!     ▲                       │  │
//!     └───── requeue ─────────┘  └──── mark_failed ─▶ Failed
//!           (in bounds)            (or out of bounds)
//! ```
//!
//! `Sent` and `Failed` are terminal: every transition out of them is rejected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MailId;

/// Delivery state of a single queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Waiting to be picked up once `next_attempt_at` has passed.
    Queued,
    /// Claimed by exactly one worker.
    InProgress,
    /// Delivered.
    Sent,
    /// Given up on.
    Failed,
}

impl DeliveryState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move entry from {from} to {to}")]
pub struct TransitionError {
    pub from: DeliveryState,
    pub to: DeliveryState,
}

/// One recipient of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub mail_id: MailId,
    pub recipient: String,
    /// Position of the recipient in the submission; entries are keyed by
    /// `(mail_id, index)` so repeated recipients stay distinct.
    pub index: u32,
    /// Submission the entry belongs to. A cancelled and resubmitted identifier
    /// starts a new generation, so stale releases cannot overwrite it.
    #[serde(default)]
    pub generation: u64,
    state: DeliveryState,
    attempts: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    /// Last remote response or failure description.
    pub result_info: Option<String>,
    /// Transcript of the last attempt.
    pub log: Option<String>,
    pub last_attempt_started: Option<DateTime<Utc>>,
    pub last_attempt_finished: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Create a fresh, immediately eligible entry.
    #[must_use]
    pub fn new(
        mail_id: MailId,
        recipient: String,
        index: u32,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            mail_id,
            recipient,
            index,
            generation: 0,
            state: DeliveryState::Queued,
            attempts: 0,
            expires_at,
            next_attempt_at: now,
            result_info: None,
            log: None,
            last_attempt_started: None,
            last_attempt_finished: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> DeliveryState {
        self.state
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn has_state(&self, state: DeliveryState) -> bool {
        self.state == state
    }

    /// Whether the entry has passed its expiry timestamp.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Whether another attempt is allowed: not expired and fewer than
    /// `max_attempts` attempts made.
    #[must_use]
    pub fn is_in_time_bounds(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        !self.is_expired(now) && self.attempts < max_attempts
    }

    /// Whether the queue may hand this entry out at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == DeliveryState::Queued && self.next_attempt_at <= now
    }

    const fn require(&self, from: DeliveryState, to: DeliveryState) -> Result<(), TransitionError> {
        if matches!(
            (self.state, from),
            (DeliveryState::Queued, DeliveryState::Queued)
                | (DeliveryState::InProgress, DeliveryState::InProgress)
        ) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                to,
            })
        }
    }

    /// `Queued → InProgress`, counting the attempt.
    ///
    /// # Errors
    /// If the entry is not `Queued`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(DeliveryState::Queued, DeliveryState::InProgress)?;
        self.state = DeliveryState::InProgress;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_started = Some(now);
        Ok(())
    }

    /// `InProgress → Sent`.
    ///
    /// # Errors
    /// If the entry is not `InProgress`.
    pub fn mark_sent(
        &mut self,
        now: DateTime<Utc>,
        info: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.require(DeliveryState::InProgress, DeliveryState::Sent)?;
        self.state = DeliveryState::Sent;
        self.result_info = Some(info.into());
        self.last_attempt_finished = Some(now);
        Ok(())
    }

    /// `InProgress → Failed`.
    ///
    /// # Errors
    /// If the entry is not `InProgress`.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        info: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.require(DeliveryState::InProgress, DeliveryState::Failed)?;
        self.state = DeliveryState::Failed;
        self.result_info = Some(info.into());
        self.last_attempt_finished = Some(now);
        Ok(())
    }

    /// `InProgress → Queued` when still within bounds, scheduling the next
    /// attempt at `retry_at`; `InProgress → Failed` otherwise.
    ///
    /// Returns the state the entry ended in.
    ///
    /// # Errors
    /// If the entry is not `InProgress`.
    pub fn requeue(
        &mut self,
        now: DateTime<Utc>,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<DeliveryState, TransitionError> {
        self.require(DeliveryState::InProgress, DeliveryState::Queued)?;
        self.last_attempt_finished = Some(now);

        if self.is_in_time_bounds(now, max_attempts) {
            self.state = DeliveryState::Queued;
            self.next_attempt_at = retry_at;
        } else {
            self.state = DeliveryState::Failed;
            if self.is_expired(now) {
                self.result_info = Some(format!(
                    "Message expired after {} attempt(s): {}",
                    self.attempts,
                    self.result_info.as_deref().unwrap_or("no response")
                ));
            } else {
                self.result_info = Some(format!(
                    "Giving up after {} attempt(s): {}",
                    self.attempts,
                    self.result_info.as_deref().unwrap_or("no response")
                ));
            }
        }

        Ok(self.state)
    }

    /// Hand back a claim that never reached a worker: the attempt is not
    /// counted and the entry is immediately eligible again, unless it has
    /// expired in the meantime.
    ///
    /// # Errors
    /// If the entry is not `InProgress`.
    pub fn abandon_attempt(&mut self, now: DateTime<Utc>) -> Result<DeliveryState, TransitionError> {
        self.require(DeliveryState::InProgress, DeliveryState::Queued)?;
        self.attempts = self.attempts.saturating_sub(1);
        self.requeue(now, u32::MAX, now)
    }
}
