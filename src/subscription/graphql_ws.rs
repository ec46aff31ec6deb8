//! The modern GraphQL-over-WebSocket protocol (`graphql-ws` library).
//!
//! Advertises the `graphql-transport-ws` subprotocol. Operations are started
//! with a `subscribe` frame carrying the request payload directly and
//! stopped with `complete`; results arrive as `next` frames. Liveness is
//! bidirectional `ping`/`pong`.

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

/// Protocol strategy for the modern specification.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphQLWS;

#[async_trait]
impl SubscriptionProtocol for GraphQLWS {
    fn subprotocols(&self) -> Vec<String> {
        vec!["graphql-transport-ws".to_owned()]
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

        let message = OperationMessage::new(OperationMessageType::Subscribe)
            .with_id(sub.id())
            .with_json_payload(sub.payload())?;
        ctx.send(&message).await?;

        let mut started = sub.clone();
        started.set_status(SubscriptionStatus::Running);
        ctx.set_subscription(started);

        Ok(())
    }

    async fn unsubscribe(&self, ctx: &SubscriptionContext, sub: &Subscription) -> Result<()> {
        let message = OperationMessage::new(OperationMessageType::Complete).with_id(sub.id());
        match ctx.send(&message).await {
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
            OperationMessageType::Ping => {
                // Reply with a pong echoing the payload. An inbound ping is
                // also a liveness signal.
                let mut pong = OperationMessage::new(OperationMessageType::Pong);
                if let Some(payload) = message.payload.clone() {
                    pong = pong.with_raw_payload(payload);
                }
                ctx.send(&pong).await?;
                ctx.on_connection_alive();
                Ok(())
            }
            OperationMessageType::Pong => {
                ctx.on_connection_alive();
                Ok(())
            }
            OperationMessageType::Next => {
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
                // The payload is a list of GraphQL errors for this id; the
                // session itself stays up.
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
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%message, "ignoring unexpected operation message");
                Ok(())
            }
        }
    }

    // This protocol has no terminate frame; the websocket close handshake
    // itself ends the conversation.
    async fn close(&self, _ctx: &SubscriptionContext) -> Result<()> {
        Ok(())
    }
}
