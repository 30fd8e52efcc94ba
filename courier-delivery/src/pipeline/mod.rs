//! Ordered delivery handlers.
//!
//! Each [`DeliveryHandler`] either advances the [`DeliveryContext`] or returns
//! a classified [`DeliveryError`]. The standard pipeline is:
//!
//! 1. [`ResolveHandler`]: parse the recipient and resolve its mail exchangers
//! 2. [`SendHandler`]: hand the message to the first target that takes it
//!
//! Execution stops at the first error.

mod resolve;
mod send;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

pub use resolve::ResolveHandler;
pub use send::SendHandler;

use crate::{
    DeliveryContext, DeliveryError, DnsConfig, DnsError, DnsResolver, MailResolver,
    transport::Transport,
};

#[async_trait]
pub trait DeliveryHandler: Send + Sync + Debug {
    /// Name the handler is registered under.
    fn name(&self) -> &'static str;

    /// # Errors
    /// A classified failure; later handlers do not run.
    async fn handle(&self, context: &mut DeliveryContext) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    handlers: Vec<Arc<dyn DeliveryHandler>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve, then Send.
    #[must_use]
    pub fn standard(resolver: Arc<dyn MailResolver>, transport: Arc<dyn Transport>) -> Self {
        Self::new()
            .with(Arc::new(ResolveHandler::new(resolver)))
            .with(Arc::new(SendHandler::new(transport)))
    }

    /// Resolve through the system DNS configuration tuned by `dns`, then Send.
    ///
    /// # Errors
    /// If the system DNS configuration cannot be loaded.
    pub fn from_dns_config(
        dns: &DnsConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DnsError> {
        let resolver = DnsResolver::new(dns.clone())?;
        Ok(Self::standard(Arc::new(resolver), transport))
    }

    /// Append a handler.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[must_use]
    pub fn handler(&self, name: &str) -> Option<&Arc<dyn DeliveryHandler>> {
        self.handlers.iter().find(|handler| handler.name() == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|handler| handler.name())
    }

    /// Run every handler in order.
    ///
    /// # Errors
    /// The first handler failure.
    pub async fn run(&self, context: &mut DeliveryContext) -> Result<(), DeliveryError> {
        for handler in &self.handlers {
            if let Err(error) = handler.handle(context).await {
                debug!(
                    handler = handler.name(),
                    mail_id = %context.entry().mail_id,
                    recipient = %context.entry().recipient,
                    error = %error,
                    "Delivery handler failed"
                );
                return Err(error);
            }
        }

        Ok(())
    }
}
