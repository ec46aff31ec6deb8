#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// How the mock server reacts to protocol traffic.
#[derive(Debug, Clone, Default)]
pub struct ServerBehavior {
    /// Reply `connection_ack` to every `connection_init`
    pub ack: bool,
    /// Reply `complete` to every legacy `stop` frame
    pub complete_on_stop: bool,
    /// Close each connection with this status right after the handshake
    pub close_on_connect: Option<u16>,
}

impl ServerBehavior {
    pub fn acking() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }
}

/// Mock GraphQL websocket server.
///
/// Accepts any subprotocol, forwards every inbound frame to the test, and
/// optionally handles the initialisation handshake so tests only script the
/// interesting frames.
pub struct MockGraphqlServer {
    addr: SocketAddr,
    /// Broadcast raw frames to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Inbound frames from clients, decoded as JSON
    inbound_rx: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl MockGraphqlServer {
    /// Start the server on a random port.
    pub async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let connection_count = Arc::clone(&connections);
        let ping_count = Arc::clone(&pings);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let callback = |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                                mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", protocol.clone());
                    }
                    Ok(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                connection_count.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let inbound = inbound_tx.clone();
                let mut outbound = broadcast_tx.subscribe();
                let behavior = behavior.clone();
                let pings = Arc::clone(&ping_count);

                tokio::spawn(async move {
                    if let Some(code) = behavior.close_on_connect {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "scripted close".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        // Drain the client until it hangs up so its writes
                        // do not hit a reset socket.
                        while let Some(Ok(_)) = read.next().await {}
                        return;
                    }

                    loop {
                        tokio::select! {
                            frame = read.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                            continue;
                                        };
                                        let reply = behavior.reply_for(&value);
                                        drop(inbound.send(value));
                                        if let Some(reply) = reply
                                            && write
                                                .send(Message::Text(reply.to_string().into()))
                                                .await
                                                .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        pings.fetch_add(1, Ordering::SeqCst);
                                        let _ = write.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            frame = outbound.recv() => {
                                match frame {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            inbound_rx,
            connections,
            pings,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a JSON frame to every connected client.
    pub fn send(&self, frame: &Value) {
        drop(self.message_tx.send(frame.to_string()));
    }

    /// Send a legacy `data` frame for the given subscription id.
    pub fn send_data(&self, id: &str, data: &Value) {
        self.send(&json!({"id": id, "type": "data", "payload": {"data": data}}));
    }

    /// Send a modern `next` frame for the given subscription id.
    pub fn send_next(&self, id: &str, data: &Value) {
        self.send(&json!({"id": id, "type": "next", "payload": {"data": data}}));
    }

    /// Send a `complete` frame for the given subscription id.
    pub fn send_complete(&self, id: &str) {
        self.send(&json!({"id": id, "type": "complete"}));
    }

    /// Receive the next inbound frame of the given type, skipping others.
    pub async fn expect_message(&mut self, message_type: &str) -> Value {
        let deadline = Duration::from_secs(5);
        loop {
            let frame = timeout(deadline, self.inbound_rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for a {message_type} frame"))
                .expect("server inbound channel closed");
            if frame["type"] == message_type {
                return frame;
            }
        }
    }

    /// Number of websocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of websocket-level ping frames received so far.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

impl ServerBehavior {
    fn reply_for(&self, frame: &Value) -> Option<Value> {
        match frame["type"].as_str() {
            Some("connection_init") if self.ack => Some(json!({"type": "connection_ack"})),
            Some("stop") if self.complete_on_stop => {
                Some(json!({"id": frame["id"], "type": "complete"}))
            }
            _ => None,
        }
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, deadline: Duration) -> bool {
    let result = timeout(deadline, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.is_ok()
}
