//! Storage contracts for the delivery engine.
//!
//! Two stores back the engine:
//! - a [`MessageStore`] holding raw message bodies keyed by [`MailId`]
//! - a [`QueueStore`] holding one [`QueueEntry`] per recipient, whose
//!   [`DeliveryState`] drives the delivery state machine
//!
//! In-memory implementations of both, and a file-backed message store, live in
//! [`backends`].

pub mod backends;
pub mod entry;
pub mod error;
pub mod id;
pub mod store;

pub use backends::{FileMessageStore, FileMessageStoreBuilder, MemoryMessageStore, MemoryQueueStore};
pub use entry::{DeliveryState, QueueEntry, TransitionError};
pub use error::{Result, SpoolError, ValidationError};
pub use id::{MailId, MailIdGenerator};
pub use store::{MessageStore, QueueStore};
