use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

/// HTTP method type, re-exported for use with error inspection.
pub use reqwest::Method;
/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to a non-successful HTTP call
    Status,
    /// GraphQL errors returned by the server alongside (or instead of) data
    GraphQL,
    /// Error related to invalid input or client configuration
    Validation,
    /// Internal error from dependencies
    Internal,
    /// Error related to websocket transport
    WebSocket,
    /// Error related to the subscription lifecycle
    Subscription,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(
        status_code: StatusCode,
        method: Method,
        path: String,
        message: S,
    ) -> Self {
        Status {
            status_code,
            method,
            path,
            message: message.into(),
        }
        .into()
    }

    /// A sentinel returned from a subscription handler to request an orderly
    /// shutdown of the whole subscription client.
    #[must_use]
    pub fn subscription_stopped() -> Self {
        SubscriptionStopped.into()
    }

    #[must_use]
    pub fn subscription_not_exists<S: Into<String>>(id: S) -> Self {
        SubscriptionNotExists { id: id.into() }.into()
    }

    /// Internal sentinel: tear the current session down and open a new one
    /// without consulting the user-level error callback.
    #[must_use]
    pub(crate) fn retry() -> Self {
        RetrySubscription.into()
    }

    #[must_use]
    pub fn close_status<S: Into<String>>(code: i32, reason: S) -> Self {
        CloseStatus {
            code,
            reason: reason.into(),
        }
        .into()
    }

    #[must_use]
    pub fn is_subscription_stopped(&self) -> bool {
        self.downcast_ref::<SubscriptionStopped>().is_some()
    }

    #[must_use]
    pub fn is_subscription_not_exists(&self) -> bool {
        self.downcast_ref::<SubscriptionNotExists>().is_some()
    }

    #[must_use]
    pub(crate) fn is_retry(&self) -> bool {
        self.downcast_ref::<RetrySubscription>().is_some()
    }

    /// Returns the websocket close status carried by this error, if any.
    #[must_use]
    pub fn as_close_status(&self) -> Option<&CloseStatus> {
        self.downcast_ref::<CloseStatus>()
    }

    /// Returns the GraphQL errors returned by the server, if this error
    /// carries any.
    #[must_use]
    pub fn graphql_errors(&self) -> Option<&[GraphqlError]> {
        self.downcast_ref::<GraphqlErrors>().map(|e| e.0.as_slice())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub method: Method,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} with {}",
            self.status_code, self.method, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// A single error entry from a GraphQL response's `errors` list.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphqlError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphqlErrorLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(loc) = self.locations.first() {
            write!(f, " (line {}, column {})", loc.line, loc.column)?;
        }
        Ok(())
    }
}

impl StdError for GraphqlError {}

/// The full `errors` list of a GraphQL response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphqlErrors(pub Vec<GraphqlError>);

impl fmt::Display for GraphqlErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl StdError for GraphqlErrors {}

/// A websocket close status, either received from the peer or synthesized by
/// the client (initialisation timeout).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CloseStatus {
    pub code: i32,
    pub reason: String,
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "websocket closed with status {}", self.code)
        } else {
            write!(
                f,
                "websocket closed with status {}: {}",
                self.code, self.reason
            )
        }
    }
}

impl StdError for CloseStatus {}

impl From<CloseStatus> for Error {
    fn from(err: CloseStatus) -> Self {
        Error::with_source(Kind::WebSocket, err)
    }
}

/// Sentinel requesting an orderly shutdown of the subscription client.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionStopped;

impl fmt::Display for SubscriptionStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription stopped")
    }
}

impl StdError for SubscriptionStopped {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscriptionNotExists {
    pub id: String,
}

impl fmt::Display for SubscriptionNotExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: subscription does not exist", self.id)
    }
}

impl StdError for SubscriptionNotExists {}

/// Internal sentinel: rebuild the current session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetrySubscription;

impl fmt::Display for RetrySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry subscription client")
    }
}

impl StdError for RetrySubscription {}

/// Aggregate of the errors collected while closing the subscription client:
/// per-subscription unsubscribe failures, the protocol-level close error and
/// the websocket close error.
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct ShutdownError {
    pub unsubscribe: Vec<(String, Error)>,
    pub protocol: Option<Error>,
    pub session: Option<Error>,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close the subscription client")?;
        if !self.unsubscribe.is_empty() {
            let ids: Vec<&str> = self.unsubscribe.iter().map(|(id, _)| id.as_str()).collect();
            write!(f, "; unsubscribe failed for [{}]", ids.join(", "))?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, "; protocol close: {protocol}")?;
        }
        if let Some(session) = &self.session {
            write!(f, "; session close: {session}")?;
        }
        Ok(())
    }
}

impl StdError for ShutdownError {}

impl From<ShutdownError> for Error {
    fn from(err: ShutdownError) -> Self {
        Error::with_source(Kind::Subscription, err)
    }
}

impl From<SubscriptionStopped> for Error {
    fn from(err: SubscriptionStopped) -> Self {
        Error::with_source(Kind::Subscription, err)
    }
}

impl From<SubscriptionNotExists> for Error {
    fn from(err: SubscriptionNotExists) -> Self {
        Error::with_source(Kind::Subscription, err)
    }
}

impl From<RetrySubscription> for Error {
    fn from(err: RetrySubscription) -> Self {
        Error::with_source(Kind::Subscription, err)
    }
}

impl From<GraphqlErrors> for Error {
    fn from(err: GraphqlErrors) -> Self {
        Error::with_source(Kind::GraphQL, err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Status, err)
    }
}
