#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Error as TungsteniteError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use super::config::WebsocketOptions;
use super::error::WsError;
use super::stats;
use crate::Result;
use crate::error::Error;
use crate::subscription::protocol::OperationMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control pings carry a fixed deadline regardless of the write timeout.
const PING_DEADLINE: Duration = Duration::from_secs(5);

/// Close status when the peer reported none.
pub const STATUS_NO_STATUS_RECEIVED: i32 = 1005;
/// Normal closure.
pub const STATUS_NORMAL_CLOSURE: i32 = 1000;
/// The message was too big for the configured read limit.
const STATUS_MESSAGE_TOO_BIG: i32 = 1009;

/// Capability abstraction over a concrete websocket implementation.
///
/// Concurrency contract: `receive` is called from a single task (the
/// session's read loop); `send`, `ping` and `close` may be called from many
/// tasks and are serialized internally.
#[async_trait]
pub trait WebsocketConn: Send + Sync {
    /// Read one JSON frame and decode it into an operation message.
    async fn receive(&self) -> Result<OperationMessage>;

    /// Encode and write one operation message as a JSON text frame.
    async fn send(&self, message: &OperationMessage) -> Result<()>;

    /// Send a control ping with a short bounded deadline.
    async fn ping(&self) -> Result<()>;

    /// Close the connection with a normal-closure status. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Update the maximum size in bytes of a single inbound message.
    fn set_read_limit(&self, limit: usize);

    /// Classify an error into a websocket close status, `-1` when unknown.
    ///
    /// May probe the peer with a ping to distinguish an idle read deadline
    /// from a dead connection.
    async fn close_status(&self, error: &Error) -> i32;
}

/// Constructor for websocket connections, replaceable for custom transports.
pub type ConnectFn = Arc<
    dyn Fn(String, WebsocketOptions, usize) -> BoxFuture<'static, Result<Arc<dyn WebsocketConn>>>
        + Send
        + Sync,
>;

/// The default [`ConnectFn`], dialing with [`tokio_tungstenite`].
pub(crate) fn default_connect() -> ConnectFn {
    Arc::new(|url, options, read_limit| {
        Box::pin(async move {
            let conn = TungsteniteConn::connect(&url, &options, read_limit).await?;
            Ok(Arc::new(conn) as Arc<dyn WebsocketConn>)
        })
    })
}

/// Default websocket adapter over [`tokio_tungstenite`].
pub struct TungsteniteConn {
    id: Uuid,
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    reader: tokio::sync::Mutex<SplitStream<WsStream>>,
    read_timeout: Duration,
    write_timeout: Duration,
    read_limit: AtomicUsize,
    closed: AtomicBool,
}

impl TungsteniteConn {
    /// Dial `url`, offering the configured subprotocols and headers.
    pub async fn connect(
        url: &str,
        options: &WebsocketOptions,
        read_limit: usize,
    ) -> Result<Self> {
        let mut request = url.into_client_request()?;
        for (name, value) in &options.headers {
            request.headers_mut().insert(name, value.clone());
        }
        if !options.subprotocols.is_empty() {
            let offered = options.subprotocols.join(", ");
            let value = HeaderValue::from_str(&offered).map_err(|_| {
                Error::validation(format!("invalid subprotocol header value: {offered}"))
            })?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (stream, _response) = connect_async(request).await?;
        let (writer, reader) = stream.split();

        let id = Uuid::new_v4();
        stats::add_active_connection(id);

        Ok(Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(reader),
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            read_limit: AtomicUsize::new(read_limit),
            closed: AtomicBool::new(false),
        })
    }

    /// The connection id reported to the statistics module.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn send_close_frame(&self, code: CloseCode, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.send(Message::Close(Some(frame)))).await {
            Err(_) => Err(WsError::Timeout.into()),
            Ok(Err(
                TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed,
            )) => Ok(()),
            Ok(result) => {
                result?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WebsocketConn for TungsteniteConn {
    async fn receive(&self) -> Result<OperationMessage> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = timeout(self.read_timeout, reader.next())
                .await
                .map_err(|_| WsError::Timeout)?;
            let Some(frame) = frame else {
                return Err(WsError::ConnectionClosed.into());
            };

            match frame.map_err(WsError::Connection)? {
                Message::Text(text) => {
                    let limit = self.read_limit.load(Ordering::Relaxed);
                    if limit > 0 && text.len() > limit {
                        drop(reader);
                        let _ = self.send_close_frame(CloseCode::Size, "message too big").await;
                        return Err(WsError::ReadLimitExceeded {
                            size: text.len(),
                            limit,
                        }
                        .into());
                    }
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| WsError::MessageParse(e).into());
                }
                Message::Binary(bytes) => {
                    let limit = self.read_limit.load(Ordering::Relaxed);
                    if limit > 0 && bytes.len() > limit {
                        drop(reader);
                        let _ = self.send_close_frame(CloseCode::Size, "message too big").await;
                        return Err(WsError::ReadLimitExceeded {
                            size: bytes.len(),
                            limit,
                        }
                        .into());
                    }
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| WsError::MessageParse(e).into());
                }
                Message::Close(close) => {
                    let (code, reason) = close.map_or_else(
                        || (STATUS_NO_STATUS_RECEIVED, String::new()),
                        |frame| (i32::from(u16::from(frame.code)), frame.reason.to_string()),
                    );
                    return Err(Error::close_status(code, reason));
                }
                // Control frames are not operation messages. Pong replies to
                // inbound pings are queued by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn send(&self, message: &OperationMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.send(Message::Text(text.into()))).await {
            Err(_) => Err(WsError::Timeout.into()),
            Ok(result) => {
                result?;
                Ok(())
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(PING_DEADLINE, writer.send(Message::Ping(Bytes::new()))).await {
            Err(_) => Err(WsError::Timeout.into()),
            Ok(result) => {
                result?;
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.send_close_frame(CloseCode::Normal, "close websocket").await;
        stats::add_closed_connection(self.id);
        result
    }

    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    async fn close_status(&self, error: &Error) -> i32 {
        if let Some(status) = error.as_close_status() {
            return status.code;
        }

        match error.downcast_ref::<WsError>() {
            // A read deadline on an idle stream is not a failure by itself;
            // probe the peer to tell the two apart.
            Some(WsError::Timeout) => {
                if self.ping().await.is_err() {
                    STATUS_NO_STATUS_RECEIVED
                } else {
                    -1
                }
            }
            Some(WsError::ReadLimitExceeded { .. }) => STATUS_MESSAGE_TOO_BIG,
            Some(WsError::Connection(e)) => classify_tungstenite(e),
            _ => -1,
        }
    }
}

fn classify_tungstenite(error: &TungsteniteError) -> i32 {
    match error {
        // Some servers set reserved bits on their closing frame; treat that
        // specific framing quirk as a normal closure.
        TungsteniteError::Protocol(ProtocolError::NonZeroReservedBits) => STATUS_NORMAL_CLOSURE,
        _ => -1,
    }
}

/// Whether this error means the underlying transport is gone (EOF, reset,
/// already closed) rather than carrying protocol information.
pub(crate) fn is_disconnect(error: &Error) -> bool {
    match error.downcast_ref::<WsError>() {
        Some(WsError::ConnectionClosed) => true,
        Some(WsError::Connection(e)) => match e {
            TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed => true,
            TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
            TungsteniteError::Io(io) => matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        },
        _ => false,
    }
}
