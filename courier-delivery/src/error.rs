//! Typed errors for the delivery engine.
//!
//! Pipeline failures are classified so the state machine can decide what
//! happens to an entry:
//! - [`DeliveryError::Permanent`]: the entry is failed, never retried
//! - [`DeliveryError::Temporary`]: the entry is requeued while in bounds
//! - [`DeliveryError::System`]: internal problems, handled like temporary ones

use std::time::Duration;

use courier_spool::{SpoolError, TransitionError};
use thiserror::Error;

use crate::{DnsError, context::DeliveryContext, transport::TransportError};

/// Classified failure returned by a pipeline handler.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Failures that will not go away by trying again.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The recipient address could not be parsed or was refused as invalid.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The remote server answered with a 5xx response.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// The message body is gone from the message store.
    #[error("Message content missing: {0}")]
    ContentMissing(String),
}

/// Failures that may succeed on a later attempt.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    /// Every resolved target was tried and none accepted the message.
    #[error("All {tried} mail server(s) failed, last error: {last}")]
    AllTargetsFailed { tried: usize, last: String },

    #[error("No worker available: {0}")]
    PoolExhausted(String),

    #[error("Delivery interrupted: {0}")]
    Interrupted(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Store error: {0}")]
    Store(#[from] SpoolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

/// Every DNS failure is temporary: an empty answer or a failed lookup may well
/// resolve on a later attempt.
impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => Self::Temporary(TemporaryError::NoMailServers(domain)),
            DnsError::Timeout(domain) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(format!("timed out for {domain}")))
            }
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// - **5xx responses** → Permanent
/// - **Other responses** → Temporary
/// - **Connection failures** → Temporary
/// - **Invalid recipient** → Permanent
impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Rejected { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }
            TransportError::Rejected { code, message } => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }
            TransportError::Connection(reason) => {
                Self::Temporary(TemporaryError::ConnectionFailed(reason))
            }
            TransportError::InvalidRecipient(recipient) => {
                Self::Permanent(PermanentError::InvalidRecipient(recipient))
            }
        }
    }
}

impl From<SpoolError> for DeliveryError {
    fn from(error: SpoolError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

/// Failures borrowing or assigning a worker.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No worker became available within {0:?}")]
    Exhausted(Duration),

    #[error("Worker pool is closed")]
    Closed,

    /// The worker already holds a context; the rejected one is handed back.
    #[error("Worker is already occupied")]
    Occupied(Box<DeliveryContext>),
}

/// Failures of the manager's public operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Delivery manager is already running")]
    AlreadyRunning,

    #[error("Delivery manager has been shut down")]
    Stopped,

    #[error("Message has no recipients")]
    NoRecipients,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Store(#[from] SpoolError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<mailparse::MailParseError> for ManagerError {
    fn from(error: mailparse::MailParseError) -> Self {
        Self::InvalidMessage(error.to_string())
    }
}
