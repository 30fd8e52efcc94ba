//! Outbound delivery engine for messages held in the spool
//!
//! This crate provides:
//! - A manager loop that claims eligible queue entries and dispatches them
//! - A bounded pool of long-lived workers running the delivery pipeline
//! - A Resolve → Send pipeline with pluggable DNS and transport
//! - Retry with exponential backoff, expiry and a periodic maintenance sweep
//! - Listener fan-out of per-recipient outcomes

pub mod config;
pub mod context;
mod dns;
pub mod error;
pub mod listener;
mod manager;
pub mod message;
pub mod pipeline;
pub mod policy;
pub mod pool;
mod state;
mod sweeper;
pub mod transport;

pub use config::DeliveryConfig;
pub use context::DeliveryContext;
pub use dns::{DnsConfig, DnsError, DnsResolver, MailResolver, MailServer, StaticResolver};
pub use error::{
    DeliveryError, ManagerError, PermanentError, PoolError, SystemError, TemporaryError,
};
pub use listener::{ChannelListener, DeliveryListener, ListenerManager, Notification, ResultKind};
pub use manager::{DeliveryManager, Expiry, Reconfigure};
pub use pipeline::{DeliveryHandler, Pipeline};
pub use policy::RetryPolicy;
pub use pool::{WorkerMetrics, WorkerPool, WorkerStatus};
pub use state::DeliveryStateMachine;
pub use sweeper::{SweepReport, sweep_stores};
pub use transport::{Transcript, Transport, TransportError};
