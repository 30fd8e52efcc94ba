use std::sync::Arc;

use async_trait::async_trait;
use courier_common::internal;

use super::DeliveryHandler;
use crate::{
    DeliveryContext, DeliveryError, MailResolver, error::TemporaryError, message::Recipient,
};

/// Parses the recipient and stores its mail exchangers in the context.
///
/// The parsed [`Recipient`] is attached to the context for later handlers.
#[derive(Debug)]
pub struct ResolveHandler {
    resolver: Arc<dyn MailResolver>,
}

impl ResolveHandler {
    pub const NAME: &'static str = "resolve";

    #[must_use]
    pub fn new(resolver: Arc<dyn MailResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl DeliveryHandler for ResolveHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(mail_id = %context.entry().mail_id, recipient = %context.entry().recipient)
    )]
    async fn handle(&self, context: &mut DeliveryContext) -> Result<(), DeliveryError> {
        let recipient = Recipient::parse(&context.entry().recipient)?;

        let targets = self.resolver.resolve(&recipient.domain).await?;
        if targets.is_empty() {
            return Err(TemporaryError::NoMailServers(recipient.domain).into());
        }

        internal!(
            level = DEBUG,
            "{} resolved to {} target(s)",
            recipient.domain,
            targets.len()
        );

        context.set_targets(targets);
        context.insert(recipient);
        Ok(())
    }
}
