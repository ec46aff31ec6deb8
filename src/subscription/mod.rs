//! GraphQL subscriptions over a multiplexed websocket.
//!
//! One [`SubscriptionClient`] supervises many logical subscriptions on a
//! single connection. The client reconnects on transport failures and
//! re-subscribes everything that was registered; each reconnect mints fresh
//! per-session ids so the server never sees a duplicate subscriber id.
//!
//! # Architecture
//!
//! - [`SubscriptionClient`]: the supervisor, owning the registry, retry
//!   policy, lifecycle callbacks and the run loop
//! - [`session`]: everything tied to one underlying websocket connection
//! - [`SubscriptionProtocol`]: the wire protocol strategy, implemented by
//!   [`SubscriptionsTransportWS`] (Apollo legacy) and [`GraphQLWS`] (modern)

pub mod client;
pub mod graphql_ws;
pub mod protocol;
pub mod session;
pub mod transport_ws;

use std::fmt;
use std::sync::Arc;

pub use client::{ClientStatus, SubscriptionClient};
pub use graphql_ws::GraphQLWS;
pub use protocol::{
    OperationMessage, OperationMessageType, SubscriptionProtocol, SubscriptionProtocolType,
};
pub use session::SubscriptionContext;
pub use transport_ws::SubscriptionsTransportWS;

use crate::Result;
use crate::types::GraphqlRequest;

/// Lifecycle state of a logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Not yet registered with the server
    Waiting,
    /// Accepted by the server in an acknowledged session
    Running,
    /// Stopped by the user; inert until removed
    Unsubscribed,
}

/// The wrapped per-subscription handler stored in the registry. Receives the
/// raw `data` bytes of each result frame, or the error that ended it.
pub(crate) type SubscriptionHandler = Arc<dyn Fn(Result<Vec<u8>>) + Send + Sync>;

/// A logical subscription request and its runtime state.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    key: String,
    payload: GraphqlRequest,
    handler: SubscriptionHandler,
    status: SubscriptionStatus,
}

impl Subscription {
    pub(crate) fn new(id: String, payload: GraphqlRequest, handler: SubscriptionHandler) -> Self {
        Self {
            key: id.clone(),
            id,
            payload,
            handler,
            status: SubscriptionStatus::Waiting,
        }
    }

    /// The per-session subscription id sent on the wire. Regenerated every
    /// session to avoid duplicate-id conflicts on the server.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The immutable key of the subscription, assigned at registration and
    /// stable across reconnects. This is the id [`SubscriptionClient::exec`]
    /// returns.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The GraphQL request this subscription was registered with.
    #[must_use]
    pub fn payload(&self) -> &GraphqlRequest {
        &self.payload
    }

    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
    }

    /// Deliver a result frame (or error) to the user handler.
    pub(crate) fn deliver(&self, event: Result<Vec<u8>>) {
        (self.handler)(event);
    }

    /// Copy for a new session: same key, payload and handler, fresh wire id,
    /// status reset to waiting.
    pub(crate) fn renewed(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            handler: Arc::clone(&self.handler),
            status: SubscriptionStatus::Waiting,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> SubscriptionHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn renewed_keeps_key_and_payload() {
        let sub = Subscription::new(
            "stable".to_owned(),
            GraphqlRequest::new("subscription { tick }", None, None),
            noop_handler(),
        );
        let mut running = sub.clone();
        running.set_status(SubscriptionStatus::Running);

        let renewed = running.renewed();
        assert_eq!(renewed.key(), "stable");
        assert_ne!(renewed.id(), "stable");
        assert_eq!(renewed.status(), SubscriptionStatus::Waiting);
        assert_eq!(renewed.payload().query, "subscription { tick }");
    }

    #[test]
    fn new_subscription_starts_waiting_with_key_equal_to_id() {
        let sub = Subscription::new(
            "abc".to_owned(),
            GraphqlRequest::new("subscription { tick }", None, None),
            noop_handler(),
        );
        assert_eq!(sub.id(), sub.key());
        assert_eq!(sub.status(), SubscriptionStatus::Waiting);
    }

    #[test]
    fn deliver_invokes_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sub = Subscription::new(
            "abc".to_owned(),
            GraphqlRequest::new("subscription { tick }", None, None),
            Arc::new(move |event| {
                assert!(event.is_ok());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sub.deliver(Ok(b"{}".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
