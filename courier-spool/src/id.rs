use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Process-wide generator backing [`MailId::generate`].
static GENERATOR: MailIdGenerator = MailIdGenerator::new();

/// Identifier of a submitted message, shared by all of its queue entries.
///
/// Generated identifiers have the form `{unix_seconds}.{counter:x}`: a one
/// second time bucket followed by a monotonic hexadecimal suffix, so ids sort
/// roughly by submission time and never repeat within a process unless more
/// than 2^32 ids are minted in the same second. Identifiers supplied by the
/// caller (for example from a message header) are used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailId(Arc<str>);

impl MailId {
    /// Mint a new identifier from the process-wide generator.
    #[must_use]
    pub fn generate() -> Self {
        GENERATOR.next_id()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier can be used as a file name without escaping the
    /// store directory.
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && !self.0.contains("..")
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | '+'))
    }

    /// Parse an identifier from a store file name like `1700000000.2a.eml`.
    ///
    /// Temporary files (leading `.`) and anything that would not round-trip
    /// through [`MailId::is_path_safe`] are rejected.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".eml")?;
        let id = Self::from(stem);
        id.is_path_safe().then_some(id)
    }
}

impl fmt::Display for MailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MailId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for MailId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Source of generated [`MailId`]s.
///
/// A single instance is shared by the whole process; additional instances are
/// only useful in tests.
#[derive(Debug)]
pub struct MailIdGenerator {
    counter: AtomicU32,
}

impl MailIdGenerator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Mint the next identifier.
    pub fn next_id(&self) -> MailId {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let suffix = self.counter.fetch_add(1, Ordering::Relaxed);

        MailId::from(format!("{secs}.{suffix:x}"))
    }
}

impl Default for MailIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
