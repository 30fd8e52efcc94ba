use std::{fmt::Write, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::outgoing;
use tracing::warn;

use super::DeliveryHandler;
use crate::{
    DeliveryContext, DeliveryError,
    error::{SystemError, TemporaryError},
    message::Recipient,
    transport::{Transport, TransportError},
};

/// Tries each resolved target in order until one accepts the message.
///
/// A permanent response or an unusable recipient stops at once. Connection
/// failures and transient responses move on to the next target.
#[derive(Debug)]
pub struct SendHandler {
    transport: Arc<dyn Transport>,
}

impl SendHandler {
    pub const NAME: &'static str = "send";

    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DeliveryHandler for SendHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(mail_id = %context.entry().mail_id, recipient = %context.entry().recipient)
    )]
    async fn handle(&self, context: &mut DeliveryContext) -> Result<(), DeliveryError> {
        let recipient = match context.get::<Recipient>() {
            Some(recipient) => recipient.address.clone(),
            None => Recipient::parse(&context.entry().recipient)?.address,
        };

        let domain = recipient
            .rsplit_once('@')
            .map_or_else(String::new, |(_, domain)| domain.to_string());
        let Some(targets) = context.targets().filter(|targets| !targets.is_empty()) else {
            return Err(TemporaryError::NoMailServers(domain).into());
        };

        let mut log = String::new();
        let mut tried = 0;
        let mut outcome: Result<_, TransportError> =
            Err(TransportError::Connection("no target attempted".to_string()));

        for target in targets {
            tried += 1;
            outgoing!(
                level = DEBUG,
                "Sending {} to {recipient} via {}",
                context.entry().mail_id,
                target.address()
            );

            outcome = self
                .transport
                .send(target, &recipient, context.body())
                .await;

            match &outcome {
                Ok(transcript) => {
                    let _ = writeln!(log, "{}: {}", target.address(), transcript.response);
                    break;
                }
                Err(error) => {
                    let _ = writeln!(log, "{}: {error}", target.address());
                    if error.is_permanent() {
                        break;
                    }
                    warn!(target = %target.address(), error = %error, "Target failed, trying next");
                }
            }
        }

        let entry = context.entry_mut();
        match outcome {
            Ok(transcript) => {
                entry.log = Some(if transcript.log.is_empty() {
                    log
                } else {
                    transcript.log
                });
                entry
                    .mark_sent(Utc::now(), transcript.response)
                    .map_err(|error| SystemError::Internal(error.to_string()))?;
                Ok(())
            }
            Err(error) if error.is_permanent() => {
                entry.log = Some(log);
                Err(error.into())
            }
            Err(error) => {
                entry.log = Some(log);
                Err(TemporaryError::AllTargetsFailed {
                    tried,
                    last: DeliveryError::from(error).to_string(),
                }
                .into())
            }
        }
    }
}
