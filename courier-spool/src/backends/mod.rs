//! Store implementations
//!
//! - `memory`: in-memory message and queue stores, for tests and transient use
//! - `file`: file-based message store for production use

pub mod file;
pub mod memory;

pub use file::{FileMessageStore, FileMessageStoreBuilder};
pub use memory::{MemoryMessageStore, MemoryQueueStore};
