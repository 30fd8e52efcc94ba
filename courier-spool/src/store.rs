use std::{collections::HashSet, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{MailId, QueueEntry};

/// Raw message body storage.
///
/// Bodies are immutable once stored; every queue entry of a message shares the
/// same body.
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Prepare the store for use (create directories, drop stale temporaries).
    async fn init(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Store a body under `id`, replacing any previous body.
    async fn put(&self, id: &MailId, body: Arc<[u8]>) -> crate::Result<()>;

    /// Fetch a body, `None` when it is not stored.
    async fn get(&self, id: &MailId) -> crate::Result<Option<Arc<[u8]>>>;

    /// Remove a body. Removing an absent body is not an error.
    async fn remove(&self, id: &MailId) -> crate::Result<()>;

    /// Snapshot of every stored identifier.
    async fn list_ids(&self) -> crate::Result<Vec<MailId>>;
}

/// Persisted per-recipient delivery state.
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    async fn init(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Create one `Queued` entry per recipient, in order.
    ///
    /// # Errors
    /// [`SpoolError::AlreadyExists`](crate::SpoolError::AlreadyExists) if the
    /// identifier is already queued.
    async fn add(
        &self,
        mail_id: &MailId,
        expires_at: Option<DateTime<Utc>>,
        recipients: &[String],
    ) -> crate::Result<Vec<QueueEntry>>;

    /// Claim the next eligible entry, moving it to `InProgress` before it is
    /// returned. Returns `None` when nothing is eligible yet.
    async fn next(&self) -> crate::Result<Option<QueueEntry>>;

    /// Number of entries held, in any state.
    async fn size(&self) -> crate::Result<usize>;

    /// Remove every entry of a message, returning how many were removed.
    async fn remove(&self, mail_id: &MailId) -> crate::Result<usize>;

    /// Write back the state, result and log of an entry.
    ///
    /// # Errors
    /// [`SpoolError::NotFound`](crate::SpoolError::NotFound) if the entry is no
    /// longer queued (for example after a cancel), or if its `generation` no
    /// longer matches because the identifier was resubmitted.
    async fn persist(&self, entry: &QueueEntry) -> crate::Result<()>;

    /// Whether every entry of the message is terminal. Unknown messages are
    /// not completed.
    async fn is_completed(&self, mail_id: &MailId) -> crate::Result<bool>;

    /// Purge completed messages and return the identifiers still referenced by
    /// the remaining entries.
    async fn sweep(&self) -> crate::Result<HashSet<MailId>>;

    /// Current entries of a message, in recipient order.
    async fn entries(&self, mail_id: &MailId) -> crate::Result<Vec<QueueEntry>>;
}
