//! Apollo's legacy `subscriptions-transport-ws` protocol.
//!
//! Advertises the `graphql-ws` subprotocol. Operations start with a `start`
//! frame wrapping the request payload and stop with `stop`; the server
//! streams `data` frames and signals liveness with `connection_keep_alive`.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::protocol::{
    OperationMessage, OperationMessageType, SubscriptionProtocol, decode_error_payload,
    send_connection_init,
};
use super::session::SubscriptionContext;
use super::{Subscription, SubscriptionStatus};
use crate::Result;
use crate::types::GraphqlResponse;
use crate::ws::connection::is_disconnect;

/// Protocol strategy for the legacy Apollo specification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionsTransportWS;

#[async_trait]
impl SubscriptionProtocol for SubscriptionsTransportWS {
    fn subprotocols(&self) -> Vec<String> {
        vec!["graphql-ws".to_owned()]
    }

    async fn connection_init(
        &self,
        ctx: &SubscriptionContext,
        connection_params: Option<Map<String, Value>>,
    ) -> Result<()> {
        send_connection_init(ctx, connection_params).await
    }

    async fn subscribe(&self, ctx: &SubscriptionContext, sub: &Subscription) -> Result<()> {
        if sub.status() == SubscriptionStatus::Running {
            return Ok(());
        }

        let message = OperationMessage::new(OperationMessageType::Start)
            .with_id(sub.id())
            .with_json_payload(sub.payload())?;
        ctx.send(&message).await?;

        let mut started = sub.clone();
        started.set_status(SubscriptionStatus::Running);
        ctx.set_subscription(started);

        Ok(())
    }

    async fn unsubscribe(&self, ctx: &SubscriptionContext, sub: &Subscription) -> Result<()> {
        let message = OperationMessage::new(OperationMessageType::Stop).with_id(sub.id());
        match ctx.send(&message).await {
            // The transport being gone already achieves what stop asks for.
            Err(e) if is_disconnect(&e) => Ok(()),
            other => other,
        }
    }

    async fn on_message(
        &self,
        ctx: &SubscriptionContext,
        sub: Option<Subscription>,
        message: OperationMessage,
    ) -> Result<()> {
        match message.message_type {
            OperationMessageType::ConnectionAck => {
                ctx.set_acknowledged();
                ctx.on_connected();
                for waiting in ctx
                    .subscriptions()
                    .into_iter()
                    .filter(|sub| sub.status() == SubscriptionStatus::Waiting)
                {
                    self.subscribe(ctx, &waiting).await?;
                }
                Ok(())
            }
            OperationMessageType::ConnectionKeepAlive => {
                ctx.on_connection_alive();
                Ok(())
            }
            OperationMessageType::Data => {
                let Some(sub) = sub else {
                    return Ok(());
                };
                let response: GraphqlResponse = message.decode_payload()?;
                if response.has_errors() {
                    let errors = response.errors.unwrap_or_default();
                    sub.deliver(Err(crate::error::GraphqlErrors(errors).into()));
                } else if let Some(data) = response.data_bytes() {
                    sub.deliver(Ok(data));
                }
                Ok(())
            }
            OperationMessageType::Error => {
                // A per-subscription error; the session itself stays up.
                if let Some(sub) = sub {
                    sub.deliver(Err(decode_error_payload(&message)));
                }
                Ok(())
            }
            OperationMessageType::Complete => {
                if let Some(sub) = sub {
                    ctx.on_subscription_complete(&sub);
                    ctx.remove_subscription(sub.key());
                }
                Ok(())
            }
            OperationMessageType::ConnectionError => Err(decode_error_payload(&message)),
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%message, "ignoring unexpected operation message");
                Ok(())
            }
        }
    }

    async fn close(&self, ctx: &SubscriptionContext) -> Result<()> {
        let message = OperationMessage::new(OperationMessageType::ConnectionTerminate);
        match ctx.send(&message).await {
            Err(e) if is_disconnect(&e) => Ok(()),
            other => other,
        }
    }
}
