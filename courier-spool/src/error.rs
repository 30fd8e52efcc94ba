//! Error types for the courier-spool crate.

use std::io;

use thiserror::Error;

use crate::{MailId, entry::TransitionError};

/// Top-level spool error type.
///
/// All store operations return this error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No queue entry or message exists for the identifier.
    #[error("Message not found: {0}")]
    NotFound(MailId),

    /// A message with this identifier is already queued.
    #[error("Message already exists: {0}")]
    AlreadyExists(MailId),

    /// The store has reached its configured capacity.
    #[error("Store capacity exceeded: {used}/{capacity} messages")]
    CapacityExceeded { used: usize, capacity: usize },

    /// Store or identifier validation failed.
    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A queue entry was asked to make a transition its state does not allow.
    #[error("Invalid state transition: {0}")]
    Transition(#[from] TransitionError),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Validation errors for store locations and identifiers.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Store path does not exist.
    #[error("Spool path does not exist: {0}")]
    PathNotFound(String),

    /// Store path is not a directory.
    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),

    /// Store path contains `..` components.
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentDirectory(String),

    /// Store path is relative.
    #[error("Spool path must be absolute: {0}")]
    NotAbsolute(String),

    /// Store path points into a system directory.
    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// The identifier cannot be used as a file name.
    #[error("Mail id is not usable as a file name: {0}")]
    UnsafeId(MailId),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
