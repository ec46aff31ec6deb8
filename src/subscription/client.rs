//! The subscription supervisor: owns the registry of logical subscriptions,
//! runs sessions, reacts to session-level errors and reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_stream::try_stream;
use dashmap::DashMap;
use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{SubscriptionProtocol, SubscriptionProtocolType};
use super::session::{
    STATUS_CONNECTION_INITIALISATION_TIMEOUT, Session, SubscriptionContext,
};
use super::{Subscription, SubscriptionHandler, SubscriptionStatus};
use crate::Result;
use crate::error::{Error, ShutdownError};
use crate::ops::{OperationOption, OperationShape, construct_subscription};
use crate::types::GraphqlRequest;
use crate::ws::config::{DEFAULT_READ_LIMIT, StatusRange, parse_status_ranges};
use crate::ws::connection::{default_connect, is_disconnect};
use crate::ws::{ConnectFn, WebsocketOptions};

const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Cadence of the initialisation-timeout watchdog in the run loop.
const WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// Client-wide state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Initializing,
    Running,
    Closing,
}

impl ClientStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Initializing,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Running => 1,
            Self::Closing => 2,
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) -> Option<Error> + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&Subscription) + Send + Sync>;
type ConnectionParamsFn = Arc<dyn Fn() -> Option<Map<String, Value>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct ClientConfig {
    pub(crate) url: String,
    pub(crate) protocol: Arc<dyn SubscriptionProtocol>,
    pub(crate) websocket_options: WebsocketOptions,
    pub(crate) connect: ConnectFn,
    pub(crate) connection_params: Option<Map<String, Value>>,
    pub(crate) connection_params_fn: Option<ConnectionParamsFn>,
    pub(crate) read_limit: usize,
    /// `None` means retry connecting forever.
    pub(crate) retry_timeout: Option<Duration>,
    pub(crate) retry_delay: Duration,
    pub(crate) connection_init_timeout: Option<Duration>,
    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) retry_status_codes: Vec<StatusRange>,
    pub(crate) exit_when_no_subscription: bool,
    pub(crate) sync_mode: bool,
    pub(crate) on_connected: Option<Callback>,
    pub(crate) on_disconnected: Option<Callback>,
    pub(crate) on_connection_alive: Option<Callback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_subscription_complete: Option<CompleteCallback>,
}

struct Shared {
    registry: DashMap<String, Subscription>,
    current_session: Mutex<Option<Arc<Session>>>,
    status: AtomicU8,
    error_tx: mpsc::UnboundedSender<Error>,
    error_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Error>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// A GraphQL subscription client.
///
/// Cloning is cheap and clones share the registry, the current session and
/// the run loop; configure with the `with_*` methods before spawning
/// [`run`](Self::run).
#[derive(Clone)]
pub struct SubscriptionClient {
    config: Arc<ClientConfig>,
    shared: Arc<Shared>,
}

impl SubscriptionClient {
    /// Create a client for the given websocket URL, speaking the legacy
    /// `subscriptions-transport-ws` protocol until told otherwise.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Self {
            config: Arc::new(ClientConfig {
                url: url.into(),
                protocol: SubscriptionProtocolType::SubscriptionsTransportWS.instantiate(),
                websocket_options: WebsocketOptions::default(),
                connect: default_connect(),
                connection_params: None,
                connection_params_fn: None,
                read_limit: DEFAULT_READ_LIMIT,
                retry_timeout: Some(DEFAULT_RETRY_TIMEOUT),
                retry_delay: DEFAULT_RETRY_DELAY,
                connection_init_timeout: None,
                keep_alive_interval: None,
                retry_status_codes: Vec::new(),
                exit_when_no_subscription: true,
                sync_mode: false,
                on_connected: None,
                on_disconnected: None,
                on_connection_alive: None,
                on_error: None,
                on_subscription_complete: None,
            }),
            shared: Arc::new(Shared {
                registry: DashMap::new(),
                current_session: Mutex::new(None),
                status: AtomicU8::new(ClientStatus::Initializing.as_u8()),
                error_tx,
                error_rx: tokio::sync::Mutex::new(error_rx),
                cancel: Mutex::new(None),
            }),
        }
    }

    fn config_mut(&mut self) -> &mut ClientConfig {
        Arc::make_mut(&mut self.config)
    }

    /// Select one of the built-in wire protocols.
    #[must_use]
    pub fn with_protocol(mut self, protocol: SubscriptionProtocolType) -> Self {
        self.config_mut().protocol = protocol.instantiate();
        self
    }

    /// Use a custom protocol implementation.
    #[must_use]
    pub fn with_custom_protocol(mut self, protocol: Arc<dyn SubscriptionProtocol>) -> Self {
        self.config_mut().protocol = protocol;
        self
    }

    /// Replace the websocket constructor, e.g. for a custom transport.
    #[must_use]
    pub fn with_connect_fn(mut self, connect: ConnectFn) -> Self {
        self.config_mut().connect = connect;
        self
    }

    /// Provide options for the websocket connection. Unset subprotocols and
    /// zero timeouts keep their current values.
    #[must_use]
    pub fn with_websocket_options(mut self, options: WebsocketOptions) -> Self {
        let config = self.config_mut();
        config.websocket_options = options.merged_with(&config.websocket_options);
        self
    }

    /// Static connection params sent with the `connection_init` event,
    /// usually an authentication handshake.
    #[must_use]
    pub fn with_connection_params(mut self, params: Map<String, Value>) -> Self {
        self.config_mut().connection_params = Some(params);
        self
    }

    /// Produce connection params at session start, for short-lived tokens
    /// that need refreshing between reconnects.
    #[must_use]
    pub fn with_connection_params_fn<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Option<Map<String, Value>> + Send + Sync + 'static,
    {
        self.config_mut().connection_params_fn = Some(Arc::new(producer));
        self
    }

    /// Maximum size in bytes of a single inbound message.
    #[must_use]
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.config_mut().read_limit = limit;
        self
    }

    /// Total time to keep retrying a failed connect before giving up.
    /// Zero means retry forever.
    #[must_use]
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.config_mut().retry_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Delay between connection attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config_mut().retry_delay = delay;
        self
    }

    /// Fail the session with close status 4408 when the server does not
    /// acknowledge initialisation within `timeout`.
    #[must_use]
    pub fn with_connection_initialisation_timeout(mut self, timeout: Duration) -> Self {
        self.config_mut().connection_init_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Ping the websocket on this interval. A failed ping restarts the
    /// session. Disabled by default.
    #[must_use]
    pub fn with_websocket_keep_alive(mut self, interval: Duration) -> Self {
        self.config_mut().keep_alive_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Close statuses to reconnect on instead of surfacing an error. Each
    /// entry is a code (`"4400"`) or an inclusive range (`"4000-4500"`).
    pub fn with_retry_status_codes<I, S>(mut self, codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config_mut().retry_status_codes = parse_status_ranges(codes)?;
        Ok(self)
    }

    /// Shut the client down once no subscription is waiting or running.
    /// Enabled by default.
    #[must_use]
    pub fn with_exit_when_no_subscription(mut self, value: bool) -> Self {
        self.config_mut().exit_when_no_subscription = value;
        self
    }

    /// Dispatch inbound messages inline on the read loop instead of on a
    /// task per message. Guarantees per-subscription ordering.
    #[must_use]
    pub fn with_sync_mode(mut self, value: bool) -> Self {
        self.config_mut().sync_mode = value;
        self
    }

    /// Called when the server acknowledges the connection.
    #[must_use]
    pub fn on_connected<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.config_mut().on_connected = Some(Arc::new(callback));
        self
    }

    /// Called when the websocket disconnects.
    #[must_use]
    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.config_mut().on_disconnected = Some(Arc::new(callback));
        self
    }

    /// Called on protocol-level liveness signals (keep-alive, ping/pong).
    #[must_use]
    pub fn on_connection_alive<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.config_mut().on_connection_alive = Some(Arc::new(callback));
        self
    }

    /// Bottom-level error handler. Returning `None` lets the client restart
    /// the connection; returning `Some(error)` terminates it with that
    /// error.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Error) -> Option<Error> + Send + Sync + 'static,
    {
        self.config_mut().on_error = Some(Arc::new(callback));
        self
    }

    /// Called when the server completes a subscription.
    #[must_use]
    pub fn on_subscription_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Subscription) + Send + Sync + 'static,
    {
        self.config_mut().on_subscription_complete = Some(Arc::new(callback));
        self
    }

    /// The GraphQL server URL this client connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// The websocket options connections are dialed with.
    #[must_use]
    pub fn websocket_options(&self) -> &WebsocketOptions {
        &self.config.websocket_options
    }

    /// Current client-wide status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ClientStatus) {
        self.shared.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn swap_status(&self, status: ClientStatus) -> ClientStatus {
        ClientStatus::from_u8(self.shared.status.swap(status.as_u8(), Ordering::SeqCst))
    }

    /// Register a subscription built from a shape descriptor; delegates the
    /// document construction to [`construct_subscription`].
    ///
    /// The handler receives the raw `data` bytes of every result frame, or
    /// the error that ended the subscription. An error returned from the
    /// handler is surfaced to the supervisor; return
    /// [`Error::subscription_stopped`] to shut the whole client down.
    ///
    /// Returns the subscription id, usable with
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe<F>(
        &self,
        shape: &OperationShape,
        variables: Option<Map<String, Value>>,
        handler: F,
        options: &[OperationOption],
    ) -> Result<String>
    where
        F: Fn(Result<Vec<u8>>) -> Result<()> + Send + Sync + 'static,
    {
        let (query, operation_name) = construct_subscription(shape, variables.as_ref(), options)?;
        self.exec(query, variables, operation_name, handler).await
    }

    /// Register a subscription with a raw GraphQL document.
    ///
    /// If a session is currently running and acknowledged the subscribe
    /// message is sent immediately; otherwise registration is durable and
    /// flushed when the next session is acknowledged.
    pub async fn exec<F>(
        &self,
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
        handler: F,
    ) -> Result<String>
    where
        F: Fn(Result<Vec<u8>>) -> Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let payload = GraphqlRequest::new(query, variables, operation_name);
        let sub = Subscription::new(id.clone(), payload, self.wrap_handler(handler));

        self.shared.registry.insert(id.clone(), sub.clone());

        if let Some(session) = self.current_session() {
            session.insert_subscription(sub.clone());
            if self.status() == ClientStatus::Running && session.acknowledged() {
                let ctx = SubscriptionContext {
                    session,
                    client: self.clone(),
                };
                // Registration stays durable even when the immediate
                // subscribe fails; the next acknowledged session flushes it.
                self.config.protocol.subscribe(&ctx, &sub).await?;
            }
        }

        Ok(id)
    }

    /// Like [`exec`](Self::exec), but yields result frames on a stream
    /// instead of invoking a handler. Frames arriving while the stream is
    /// not polled are buffered; dropping the stream discards further frames
    /// without unsubscribing, so pair it with
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn exec_stream(
        &self,
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
    ) -> Result<(String, impl Stream<Item = Result<Vec<u8>>>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Vec<u8>>>();

        let id = self
            .exec(query, variables, operation_name, move |event| {
                let _ = tx.send(event);
                Ok(())
            })
            .await?;

        let stream = try_stream! {
            while let Some(event) = rx.recv().await {
                let data = event?;
                yield data;
            }
        };

        Ok((id, stream))
    }

    fn wrap_handler<F>(&self, handler: F) -> SubscriptionHandler
    where
        F: Fn(Result<Vec<u8>>) -> Result<()> + Send + Sync + 'static,
    {
        let error_tx = self.shared.error_tx.clone();
        Arc::new(move |event| {
            if let Err(e) = handler(event) {
                // The run loop may already be gone; a closed channel is not
                // an error here.
                let _ = error_tx.send(e);
            }
        })
    }

    /// Stop a subscription by the id [`exec`](Self::exec) returned.
    ///
    /// Unknown ids return a not-exists error. A subscription that was
    /// registered but never started (or was already unsubscribed) is
    /// removed without a stop frame.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        if self.shared.registry.remove(id).is_none() {
            return Err(Error::subscription_not_exists(id));
        }

        let Some(session) = self.current_session() else {
            return Ok(());
        };
        let Some(sub) = session.subscription(id) else {
            return Ok(());
        };
        if sub.status() == SubscriptionStatus::Unsubscribed {
            return Ok(());
        }

        let mut result = Ok(());
        if sub.status() == SubscriptionStatus::Running {
            let ctx = SubscriptionContext {
                session: Arc::clone(&session),
                client: self.clone(),
            };
            result = self.config.protocol.unsubscribe(&ctx, &sub).await;
        }

        session.set_subscription_status(sub.key(), SubscriptionStatus::Unsubscribed);
        self.check_subscription_statuses(&session).await;

        result
    }

    /// Subscription lookup by id: the current session's view when one
    /// exists, the registry otherwise.
    #[must_use]
    pub fn get_subscription(&self, id: &str) -> Option<Subscription> {
        if let Some(session) = self.current_session() {
            return session.subscription(id);
        }
        self.shared.registry.get(id).map(|entry| entry.clone())
    }

    /// Snapshot of the known subscriptions, keyed by their stable key.
    #[must_use]
    pub fn subscriptions(&self) -> HashMap<String, Subscription> {
        if let Some(session) = self.current_session() {
            return session
                .subscriptions()
                .into_iter()
                .map(|sub| (sub.key().to_owned(), sub))
                .collect();
        }
        self.shared
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Start the websocket client and serve subscriptions until shutdown.
    ///
    /// Returns `Ok(())` on graceful shutdown ([`close`](Self::close), a
    /// handler returning the stop sentinel, or cancellation) and the fatal
    /// error otherwise.
    pub async fn run(&self) -> Result<()> {
        self.run_with_token(CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), stoppable through the given token.
    pub async fn run_with_token(&self, token: CancellationToken) -> Result<()> {
        if self.status() == ClientStatus::Running {
            let _ = self.shutdown(self.current_session()).await;
        }

        let token = token.child_token();
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        // One run loop at a time; the receiver guard enforces it.
        let mut error_rx = self.shared.error_rx.lock().await;
        while error_rx.try_recv().is_ok() {}

        let mut session = self.start_session(&token).await?;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    return self.shutdown(Some(session)).await;
                }
                received = error_rx.recv() => {
                    let Some(error) = received else {
                        return Ok(());
                    };
                    if self.status() == ClientStatus::Closing {
                        return Ok(());
                    }
                    if error.is_subscription_stopped() {
                        return self.shutdown(Some(session)).await;
                    }

                    if !error.is_retry()
                        && let Some(on_error) = &self.config.on_error
                        && let Some(fatal) = on_error(&error)
                    {
                        let _ = self.shutdown(Some(session)).await;
                        return Err(fatal);
                    }

                    // Retry sentinel, or an error the callback absorbed:
                    // rebuild the session.
                    session = self.start_session(&token).await?;
                }
                () = tokio::time::sleep(WATCHDOG_TICK) => {
                    if let Some(timeout) = self.config.connection_init_timeout
                        && !session.acknowledged()
                        && session
                            .connection_init_elapsed()
                            .is_some_and(|elapsed| elapsed > timeout)
                    {
                        self.send_error(Error::close_status(
                            STATUS_CONNECTION_INITIALISATION_TIMEOUT,
                            "Connection initialisation timeout",
                        ));
                    }
                }
            }
        }
    }

    /// Remove every subscription and close the current session. Idempotent
    /// and safe from any task.
    pub async fn close(&self) -> Result<()> {
        self.shared.registry.clear();
        self.shutdown(self.current_session()).await
    }

    /// Create a session for a new connection attempt cycle, seeded with a
    /// renewed copy of every registry entry, and spawn its tasks.
    async fn start_session(&self, token: &CancellationToken) -> Result<Arc<Session>> {
        if let Some(previous) = self.current_session() {
            let _ = previous.close(self).await;
        }

        let session = Arc::new(Session::new(token.child_token()));
        for entry in self.shared.registry.iter() {
            session.insert_subscription(entry.value().renewed());
        }

        let ctx = SubscriptionContext {
            session: Arc::clone(&session),
            client: self.clone(),
        };
        ctx.initialize().await?;

        if let Some(interval) = self.config.keep_alive_interval {
            let keep_alive_ctx = ctx.clone();
            tokio::spawn(keep_alive_ctx.keep_alive(interval));
        }

        *self
            .shared
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        self.set_status(ClientStatus::Running);

        tokio::spawn(ctx.read_loop());

        Ok(session)
    }

    /// Orderly teardown of the client: unsubscribe everything, send the
    /// protocol's terminate frame, close the websocket. Only the first call
    /// does work.
    async fn shutdown(&self, session: Option<Arc<Session>>) -> Result<()> {
        if self.swap_status(ClientStatus::Closing) == ClientStatus::Closing {
            return Ok(());
        }

        if let Some(token) = self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }

        let Some(session) = session else {
            return Ok(());
        };

        if session.conn().is_none() {
            session.cancel_token().cancel();
            self.clear_current_session(&session);
            return Ok(());
        }

        let ctx = SubscriptionContext {
            session: Arc::clone(&session),
            client: self.clone(),
        };

        let mut aggregate = ShutdownError::default();
        for sub in session.take_subscriptions() {
            if sub.status() == SubscriptionStatus::Running
                && let Err(e) = self.config.protocol.unsubscribe(&ctx, &sub).await
                && !is_disconnect(&e)
            {
                aggregate.unsubscribe.push((sub.key().to_owned(), e));
            }
        }

        aggregate.protocol = self.config.protocol.close(&ctx).await.err();
        aggregate.session = session.close(self).await.err();
        self.clear_current_session(&session);

        if aggregate.unsubscribe.is_empty() {
            Ok(())
        } else {
            Err(aggregate.into())
        }
    }

    fn clear_current_session(&self, session: &Arc<Session>) {
        let mut current = self
            .shared
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, session))
        {
            *current = None;
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.shared
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn send_error(&self, error: Error) {
        let _ = self.shared.error_tx.send(error);
    }

    pub(crate) fn remove_from_registry(&self, key: &str) {
        self.shared.registry.remove(key);
    }

    /// Shut the client down when the last subscription is gone and the
    /// exit-when-empty policy asks for it.
    pub(crate) async fn check_subscription_statuses(&self, session: &Arc<Session>) {
        if !self.config.exit_when_no_subscription {
            return;
        }
        if session.count_by_status(&[SubscriptionStatus::Waiting, SubscriptionStatus::Running])
            == 0
        {
            #[cfg(feature = "tracing")]
            tracing::debug!("no running subscription, exiting");
            let _ = self.shutdown(Some(Arc::clone(session))).await;
        }
    }

    pub(crate) fn fire_connected(&self) {
        if let Some(callback) = &self.config.on_connected {
            callback();
        }
    }

    pub(crate) fn fire_disconnected(&self) {
        if let Some(callback) = &self.config.on_disconnected {
            callback();
        }
    }

    pub(crate) fn fire_connection_alive(&self) {
        if let Some(callback) = &self.config.on_connection_alive {
            callback();
        }
    }

    pub(crate) fn fire_subscription_complete(&self, sub: &Subscription) {
        if let Some(callback) = &self.config.on_subscription_complete {
            callback(sub);
        }
    }
}
