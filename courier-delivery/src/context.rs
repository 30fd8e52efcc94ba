use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use ahash::AHashMap;
use courier_spool::QueueEntry;

use crate::MailServer;

/// Everything one delivery attempt works on.
///
/// A fresh context is built for every attempt and dropped once the entry is
/// released; nothing in it is persisted except through the entry.
pub struct DeliveryContext {
    entry: QueueEntry,
    body: Arc<[u8]>,
    targets: Option<Arc<Vec<MailServer>>>,
    extensions: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("entry", &self.entry)
            .field("body_len", &self.body.len())
            .field("targets", &self.targets)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

impl DeliveryContext {
    #[must_use]
    pub fn new(entry: QueueEntry, body: Arc<[u8]>) -> Self {
        Self {
            entry,
            body,
            targets: None,
            extensions: AHashMap::new(),
        }
    }

    #[must_use]
    pub const fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    pub const fn entry_mut(&mut self) -> &mut QueueEntry {
        &mut self.entry
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Resolved delivery targets, most preferred first.
    #[must_use]
    pub fn targets(&self) -> Option<&[MailServer]> {
        self.targets.as_deref().map(Vec::as_slice)
    }

    pub fn set_targets(&mut self, targets: Arc<Vec<MailServer>>) {
        self.targets = Some(targets);
    }

    /// Attach a typed value for later handlers, returning the one it replaces.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Give up the context, keeping only the entry for release.
    #[must_use]
    pub fn into_entry(self) -> QueueEntry {
        self.entry
    }
}
