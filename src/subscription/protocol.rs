//! The wire envelope and the protocol strategy both subscription transports
//! implement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use super::session::SubscriptionContext;
use super::{GraphQLWS, Subscription, SubscriptionsTransportWS};
use crate::Result;
use crate::error::Error;

/// The two supported subscription wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionProtocolType {
    /// Apollo's legacy `subscriptions-transport-ws` specification.
    /// Advertises the `graphql-ws` subprotocol.
    SubscriptionsTransportWS,
    /// The modern GraphQL-over-WebSocket specification (`graphql-ws`
    /// library). Advertises the `graphql-transport-ws` subprotocol.
    GraphQLWS,
}

impl SubscriptionProtocolType {
    pub(crate) fn instantiate(self) -> Arc<dyn SubscriptionProtocol> {
        match self {
            Self::SubscriptionsTransportWS => Arc::new(SubscriptionsTransportWS),
            Self::GraphQLWS => Arc::new(GraphQLWS),
        }
    }
}

/// Message type discriminator shared by both protocols. The wire value is
/// the snake_case rendering; types not covered by either specification
/// decode as [`Unknown`](Self::Unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMessageType {
    ConnectionInit,
    ConnectionAck,
    ConnectionError,
    ConnectionKeepAlive,
    Start,
    Data,
    Error,
    Complete,
    Stop,
    ConnectionTerminate,
    Ping,
    Pong,
    Subscribe,
    Next,
    #[serde(other)]
    Unknown,
}

/// A subscription operation message: the `{id?, type, payload?}` envelope
/// both protocols share. The payload stays unparsed; its shape depends on
/// the message type and protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: OperationMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl OperationMessage {
    #[must_use]
    pub fn new(message_type: OperationMessageType) -> Self {
        Self {
            id: None,
            message_type,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_json_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::value::to_raw_value(payload)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_raw_payload(mut self, payload: Box<RawValue>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Decode the payload into `T`. Fails when the message carries none.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| Error::validation("operation message has no payload"))?;
        Ok(serde_json::from_str(payload.get())?)
    }
}

impl fmt::Display for OperationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unencodable operation message>"),
        }
    }
}

/// Life-cycle capability set of a subscription wire protocol.
///
/// Implementations are stateless; all mutable state lives in the
/// [`SubscriptionContext`] handed into every operation.
#[async_trait]
pub trait SubscriptionProtocol: Send + Sync {
    /// Subprotocol names offered in the `Sec-WebSocket-Protocol` header.
    /// The GraphQL server relies on these to select the wire specification.
    fn subprotocols(&self) -> Vec<String>;

    /// Send the protocol-specific initialisation frame carrying
    /// `connection_params` as an opaque payload.
    async fn connection_init(
        &self,
        ctx: &SubscriptionContext,
        connection_params: Option<Map<String, Value>>,
    ) -> Result<()>;

    /// Request the GraphQL operation in the subscription's payload, binding
    /// it to the subscription's per-session id.
    async fn subscribe(&self, ctx: &SubscriptionContext, sub: &Subscription) -> Result<()>;

    /// Ask the server to stop the subscription. Already-closed transport
    /// errors are not fatal here.
    async fn unsubscribe(&self, ctx: &SubscriptionContext, sub: &Subscription) -> Result<()>;

    /// Interpret one inbound frame: drive session state or invoke the
    /// subscription's handler. `sub` is the subscription the frame's id
    /// resolved to, if any.
    async fn on_message(
        &self,
        ctx: &SubscriptionContext,
        sub: Option<Subscription>,
        message: OperationMessage,
    ) -> Result<()>;

    /// Best-effort terminate frame before the websocket closes. Idempotent.
    async fn close(&self, ctx: &SubscriptionContext) -> Result<()>;
}

/// Send the `connection_init` event. The payload format of both protocols is
/// identical, so the implementations share this.
pub(crate) async fn send_connection_init(
    ctx: &SubscriptionContext,
    connection_params: Option<Map<String, Value>>,
) -> Result<()> {
    let mut message = OperationMessage::new(OperationMessageType::ConnectionInit);
    if let Some(params) = connection_params {
        message = message.with_json_payload(&params)?;
    }

    ctx.send(&message).await
}

/// Decode the payload of an `error`/`connection_error` frame into a crate
/// error. Servers send either a list of GraphQL errors, a single error
/// object, or a bare string.
pub(crate) fn decode_error_payload(message: &OperationMessage) -> Error {
    use crate::error::{GraphqlError, GraphqlErrors};

    let Some(payload) = message.payload.as_ref() else {
        return GraphqlErrors(vec![GraphqlError::default()]).into();
    };

    if let Ok(errors) = serde_json::from_str::<Vec<GraphqlError>>(payload.get()) {
        return GraphqlErrors(errors).into();
    }
    if let Ok(error) = serde_json::from_str::<GraphqlError>(payload.get()) {
        return GraphqlErrors(vec![error]).into();
    }

    GraphqlErrors(vec![GraphqlError {
        message: payload.get().to_owned(),
        ..GraphqlError::default()
    }])
    .into()
}
