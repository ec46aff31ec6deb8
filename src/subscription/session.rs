//! Per-connection state and the tasks that service it.
//!
//! A [`Session`] owns everything tied to one underlying websocket: the
//! connection handle, the per-session subscription map (with ids refreshed
//! for this session), the acknowledgement flag and a cancellation scope.
//! [`SubscriptionContext`] pairs a session with its client and is the handle
//! protocol implementations drive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::client::SubscriptionClient;
use super::protocol::OperationMessage;
use super::{Subscription, SubscriptionStatus};
use crate::Result;
use crate::error::Error;
use crate::ws::WebsocketConn;
use crate::ws::connection::is_disconnect;

/// Close statuses the read loop always retries on.
const STATUS_NO_STATUS_RECEIVED: i32 = 1005;
const STATUS_BAD_GATEWAY: i32 = 1014;
/// Close statuses that end the session without supervisor involvement.
const STATUS_NORMAL_CLOSURE: i32 = 1000;
const STATUS_ABNORMAL_CLOSURE: i32 = 1006;
/// Close statuses surfaced to the supervisor as session-level errors.
const STATUS_INTERNAL_ERROR: i32 = 1011;
const STATUS_INVALID_MESSAGE: i32 = 4400;
const STATUS_UNAUTHORIZED: i32 = 4401;
pub(crate) const STATUS_CONNECTION_INITIALISATION_TIMEOUT: i32 = 4408;
const STATUS_SUBSCRIBER_ALREADY_EXISTS: i32 = 4409;
const STATUS_TOO_MANY_INITIALISATION_REQUESTS: i32 = 4429;

/// All state tied to one websocket connection attempt cycle.
pub(crate) struct Session {
    conn: Mutex<Option<Arc<dyn WebsocketConn>>>,
    subscriptions: DashMap<String, Subscription>,
    connection_init_at: Mutex<Option<Instant>>,
    acknowledged: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            conn: Mutex::new(None),
            subscriptions: DashMap::new(),
            connection_init_at: Mutex::new(None),
            acknowledged: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn conn(&self) -> Option<Arc<dyn WebsocketConn>> {
        self.lock_conn().clone()
    }

    pub(crate) fn set_conn(&self, conn: Arc<dyn WebsocketConn>) {
        *self.lock_conn() = Some(conn);
    }

    pub(crate) fn take_conn(&self) -> Option<Arc<dyn WebsocketConn>> {
        self.lock_conn().take()
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn WebsocketConn>>> {
        // The handle is a plain Option; a poisoned lock cannot leave it
        // half-written.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub(crate) fn set_acknowledged(&self, value: bool) {
        self.acknowledged.store(value, Ordering::SeqCst);
    }

    pub(crate) fn mark_connection_init(&self) {
        *self
            .connection_init_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Time since `connection_init` was sent on this session, if it was.
    pub(crate) fn connection_init_elapsed(&self) -> Option<Duration> {
        self.connection_init_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
    }

    pub(crate) fn insert_subscription(&self, sub: Subscription) {
        self.subscriptions.insert(sub.key().to_owned(), sub);
    }

    pub(crate) fn remove_subscription(&self, key: &str) {
        self.subscriptions.remove(key);
    }

    /// Look up by stable key first, then by per-session id.
    pub(crate) fn subscription(&self, id: &str) -> Option<Subscription> {
        if let Some(sub) = self.subscriptions.get(id) {
            return Some(sub.clone());
        }
        self.subscriptions
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of all subscriptions in this session.
    pub(crate) fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drain the subscription map, returning what it held.
    pub(crate) fn take_subscriptions(&self) -> Vec<Subscription> {
        let keys: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.subscriptions.remove(key).map(|(_, sub)| sub))
            .collect()
    }

    pub(crate) fn set_subscription_status(&self, key: &str, status: SubscriptionStatus) {
        if let Some(mut entry) = self.subscriptions.get_mut(key) {
            entry.set_status(status);
        }
    }

    pub(crate) fn count_by_status(&self, statuses: &[SubscriptionStatus]) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| statuses.contains(&entry.value().status()))
            .count()
    }

    /// Close the websocket (if still open), fire the disconnect callback and
    /// cancel every task scoped to this session.
    pub(crate) async fn close(&self, client: &SubscriptionClient) -> Result<()> {
        let mut result = Ok(());
        if let Some(conn) = self.take_conn() {
            client.fire_disconnected();
            result = conn.close().await;
        }
        self.cancel.cancel();

        match result {
            Err(e) if is_disconnect(&e) => Ok(()),
            other => other,
        }
    }
}

/// Shared context handed to protocol implementations: the current session
/// plus its supervising client.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub(crate) session: Arc<Session>,
    pub(crate) client: SubscriptionClient,
}

impl SubscriptionContext {
    /// Emit a message to the GraphQL server. A session whose connection is
    /// already gone swallows the message, so teardown paths stay idempotent.
    pub async fn send(&self, message: &OperationMessage) -> Result<()> {
        let Some(conn) = self.session.conn() else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(%message, "sending operation message");

        conn.send(message).await
    }

    /// Whether the server acknowledged connection initialisation.
    #[must_use]
    pub fn acknowledged(&self) -> bool {
        self.session.acknowledged()
    }

    /// Record the server's acknowledgement. Monotonic within a session.
    pub fn set_acknowledged(&self) {
        self.session.set_acknowledged(true);
    }

    /// Subscription lookup by stable key or per-session id.
    #[must_use]
    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.session.subscription(id)
    }

    /// Snapshot of this session's subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.session.subscriptions()
    }

    /// Insert or replace a subscription in the session map.
    pub fn set_subscription(&self, sub: Subscription) {
        self.session.insert_subscription(sub);
    }

    /// Remove a completed subscription from the session and the client's
    /// registry.
    pub fn remove_subscription(&self, key: &str) {
        self.session.remove_subscription(key);
        self.client.remove_from_registry(key);
    }

    pub fn on_connected(&self) {
        self.client.fire_connected();
    }

    pub fn on_connection_alive(&self) {
        self.client.fire_connection_alive();
    }

    pub fn on_subscription_complete(&self, sub: &Subscription) {
        self.client.fire_subscription_complete(sub);
    }

    /// Dial the server and run protocol initialisation, retrying every
    /// `retry_delay` until `retry_timeout` elapses (forever when unlimited).
    pub(crate) async fn initialize(&self) -> Result<()> {
        let config = self.client.config();
        let started = Instant::now();

        let mut options = config.websocket_options.clone();
        if options.subprotocols.is_empty() {
            options.subprotocols = config.protocol.subprotocols();
        }

        loop {
            let last_error = match (config.connect)(
                config.url.clone(),
                options.clone(),
                config.read_limit,
            )
            .await
            {
                Ok(conn) => {
                    conn.set_read_limit(config.read_limit);
                    self.session.set_conn(conn);
                    self.session.mark_connection_init();

                    let params = config
                        .connection_params_fn
                        .as_ref()
                        .map_or_else(|| config.connection_params.clone(), |producer| producer());

                    match config.protocol.connection_init(self, params).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            if let Some(conn) = self.session.take_conn() {
                                let _ = conn.close().await;
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            if self.session.cancel.is_cancelled() {
                return Err(last_error);
            }

            if let Some(retry_timeout) = config.retry_timeout
                && started.elapsed() > retry_timeout
            {
                self.client.fire_disconnected();
                return Err(last_error);
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                error = %last_error,
                retry_in = ?config.retry_delay,
                "websocket connect failed, retrying"
            );

            tokio::time::sleep(config.retry_delay).await;
        }
    }

    /// The session's read loop: decode inbound frames and dispatch them, or
    /// classify the failure and decide between retry, session end, and
    /// surfacing the error to the supervisor.
    pub(crate) async fn read_loop(self) {
        loop {
            let Some(conn) = self.session.conn() else {
                return;
            };

            let received = tokio::select! {
                () = self.session.cancel.cancelled() => return,
                received = conn.receive() => received,
            };

            let error = match received {
                Ok(message) => {
                    self.dispatch(message).await;
                    continue;
                }
                Err(e) => e,
            };

            // Transport gone: rebuild the session.
            if is_disconnect(&error) {
                self.client.send_error(Error::retry());
                return;
            }

            if self.session.cancel.is_cancelled() {
                return;
            }

            let close_status = conn.close_status(&error).await;

            if self
                .client
                .config()
                .retry_status_codes
                .iter()
                .any(|range| range.contains(close_status))
            {
                self.client.send_error(Error::retry());
                return;
            }

            match close_status {
                STATUS_BAD_GATEWAY | STATUS_NO_STATUS_RECEIVED => {
                    self.client.send_error(Error::retry());
                    return;
                }
                // Close event from the websocket client itself, exiting.
                STATUS_NORMAL_CLOSURE | STATUS_ABNORMAL_CLOSURE => {
                    self.session.cancel.cancel();
                    return;
                }
                STATUS_INTERNAL_ERROR
                | STATUS_INVALID_MESSAGE
                | STATUS_CONNECTION_INITIALISATION_TIMEOUT
                | STATUS_TOO_MANY_INITIALISATION_REQUESTS
                | STATUS_SUBSCRIBER_ALREADY_EXISTS
                | STATUS_UNAUTHORIZED => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(close_status, error = %error, "server closed the connection");
                    self.client.send_error(error);
                    return;
                }
                _ => {}
            }

            if let Some(on_error) = &self.client.config().on_error
                && on_error(&error).is_some()
            {
                // The callback deemed the error fatal for this session.
                self.session.cancel.cancel();
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(error = %error, "ignoring websocket read error");
        }
    }

    /// Hand one inbound message to the protocol, inline or on its own task
    /// depending on the dispatch mode.
    async fn dispatch(&self, message: OperationMessage) {
        let sub = message
            .id
            .as_deref()
            .and_then(|id| self.session.subscription(id));

        let ctx = self.clone();
        let run = async move {
            let protocol = Arc::clone(&ctx.client.config().protocol);
            if let Err(e) = protocol.on_message(&ctx, sub, message).await {
                ctx.client.send_error(e);
            }
            ctx.client.check_subscription_statuses(&ctx.session).await;
        };

        if self.client.config().sync_mode {
            run.await;
        } else {
            tokio::spawn(run);
        }
    }

    /// Websocket-level keep-alive: ping on the configured interval; a failed
    /// ping asks the supervisor for a fresh session. This is the keep-alive
    /// of the websocket transport, not the subscription protocol.
    pub(crate) async fn keep_alive(self, interval: Duration) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                () = self.session.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let Some(conn) = self.session.conn() else {
                        return;
                    };
                    if conn.ping().await.is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("keep-alive ping failed, requesting session restart");
                        self.client.send_error(Error::retry());
                        return;
                    }
                }
            }
        }
    }
}
