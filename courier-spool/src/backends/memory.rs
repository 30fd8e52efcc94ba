use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    MailId, QueueEntry, SpoolError,
    store::{MessageStore, QueueStore},
};

/// In-memory message body store
///
/// Bodies live in a `HashMap` behind an `RwLock`. Primarily intended for
/// testing, but also usable for transient relays.
///
/// # Capacity Management
/// An optional capacity bounds the number of bodies held. When reached,
/// `put` fails with [`SpoolError::CapacityExceeded`], which is how a
/// submission that cannot be stored surfaces to the caller.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    pub(crate) messages: Arc<RwLock<HashMap<MailId, Arc<[u8]>>>>,
    /// Maximum number of bodies to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that holds at most `capacity` bodies.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of stored bodies.
    ///
    /// Recovers gracefully if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: &MailId) -> bool {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(id)
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn put(&self, id: &MailId, body: Arc<[u8]>) -> crate::Result<()> {
        let mut messages = self.messages.write()?;

        if let Some(capacity) = self.capacity
            && !messages.contains_key(id)
            && messages.len() >= capacity
        {
            return Err(SpoolError::CapacityExceeded {
                used: messages.len(),
                capacity,
            });
        }

        messages.insert(id.clone(), body);
        Ok(())
    }

    async fn get(&self, id: &MailId) -> crate::Result<Option<Arc<[u8]>>> {
        Ok(self.messages.read()?.get(id).cloned())
    }

    async fn remove(&self, id: &MailId) -> crate::Result<()> {
        self.messages.write()?.remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> crate::Result<Vec<MailId>> {
        let mut ids: Vec<_> = self.messages.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug)]
struct QueuedMessage {
    /// Submission order, used to break ties between equally eligible entries.
    seq: u64,
    entries: Vec<QueueEntry>,
}

impl QueuedMessage {
    fn is_completed(&self) -> bool {
        self.entries.iter().all(|entry| entry.state().is_terminal())
    }
}

/// In-memory queue-state store
///
/// # Selection order
/// [`QueueStore::next`] hands out the eligible entry with the earliest
/// `next_attempt_at`; ties go to the earlier submission, then the lower
/// recipient index. The claim happens under the write lock, so two callers can
/// never receive the same entry.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    messages: Arc<RwLock<HashMap<MailId, QueuedMessage>>>,
    seq: Arc<AtomicU64>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next eligible entry as of `now`.
    ///
    /// # Errors
    /// If the lock is poisoned.
    pub fn next_at(&self, now: DateTime<Utc>) -> crate::Result<Option<QueueEntry>> {
        let mut messages = self.messages.write()?;

        let candidate = messages
            .iter()
            .flat_map(|(mail_id, message)| {
                message
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_eligible(now))
                    .map(move |(position, entry)| {
                        (
                            (entry.next_attempt_at, message.seq, entry.index),
                            mail_id,
                            position,
                        )
                    })
            })
            .min_by_key(|(key, _, _)| *key)
            .map(|(_, mail_id, position)| (mail_id.clone(), position));

        let Some((mail_id, position)) = candidate else {
            return Ok(None);
        };

        let Some(entry) = messages
            .get_mut(&mail_id)
            .and_then(|message| message.entries.get_mut(position))
        else {
            return Ok(None);
        };

        entry.begin_attempt(now)?;
        Ok(Some(entry.clone()))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn add(
        &self,
        mail_id: &MailId,
        expires_at: Option<DateTime<Utc>>,
        recipients: &[String],
    ) -> crate::Result<Vec<QueueEntry>> {
        let now = Utc::now();
        let mut messages = self.messages.write()?;

        if messages.contains_key(mail_id) {
            return Err(SpoolError::AlreadyExists(mail_id.clone()));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<_> = recipients
            .iter()
            .zip(0u32..)
            .map(|(recipient, index)| {
                let mut entry =
                    QueueEntry::new(mail_id.clone(), recipient.clone(), index, expires_at, now);
                entry.generation = seq;
                entry
            })
            .collect();

        messages.insert(
            mail_id.clone(),
            QueuedMessage {
                seq,
                entries: entries.clone(),
            },
        );

        Ok(entries)
    }

    async fn next(&self) -> crate::Result<Option<QueueEntry>> {
        self.next_at(Utc::now())
    }

    async fn size(&self) -> crate::Result<usize> {
        Ok(self
            .messages
            .read()?
            .values()
            .map(|message| message.entries.len())
            .sum())
    }

    async fn remove(&self, mail_id: &MailId) -> crate::Result<usize> {
        Ok(self
            .messages
            .write()?
            .remove(mail_id)
            .map_or(0, |message| message.entries.len()))
    }

    async fn persist(&self, entry: &QueueEntry) -> crate::Result<()> {
        let mut messages = self.messages.write()?;

        let slot = messages
            .get_mut(&entry.mail_id)
            .and_then(|message| {
                message
                    .entries
                    .iter_mut()
                    .find(|queued| {
                        queued.index == entry.index && queued.generation == entry.generation
                    })
            })
            .ok_or_else(|| SpoolError::NotFound(entry.mail_id.clone()))?;

        slot.clone_from(entry);
        Ok(())
    }

    async fn is_completed(&self, mail_id: &MailId) -> crate::Result<bool> {
        Ok(self
            .messages
            .read()?
            .get(mail_id)
            .is_some_and(QueuedMessage::is_completed))
    }

    async fn sweep(&self) -> crate::Result<HashSet<MailId>> {
        let mut messages = self.messages.write()?;
        messages.retain(|_, message| !message.is_completed());
        Ok(messages.keys().cloned().collect())
    }

    async fn entries(&self, mail_id: &MailId) -> crate::Result<Vec<QueueEntry>> {
        Ok(self
            .messages
            .read()?
            .get(mail_id)
            .map(|message| message.entries.clone())
            .unwrap_or_default())
    }
}
