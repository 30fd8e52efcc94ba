//! The contract for handing a message to a remote mail server.
//!
//! The wire conversation itself lives outside this crate; the send handler
//! only needs a classified outcome per target.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::MailServer;

/// What the remote server said when it accepted the message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    /// Final response line, e.g. `250 2.0.0 Ok: queued`.
    pub response: String,
    /// Full conversation log of the attempt.
    pub log: String,
}

impl Transcript {
    #[must_use]
    pub fn new(response: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            log: log.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered with a failure response.
    #[error("{code} {message}")]
    Rejected { code: u16, message: String },

    /// The server could not be reached or dropped the connection.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The recipient could not be expressed on the wire.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl TransportError {
    /// Whether trying another server is pointless.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => (500..600).contains(code),
            Self::InvalidRecipient(_) => true,
            Self::Connection(_) => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Deliver `body` to `recipient` through `target`.
    ///
    /// # Errors
    /// A classified [`TransportError`].
    async fn send(
        &self,
        target: &MailServer,
        recipient: &str,
        body: &[u8],
    ) -> Result<Transcript, TransportError>;
}
