//! Core WebSocket infrastructure.
//!
//! This module provides the transport pieces the subscription client is
//! built on: a capability trait over a concrete websocket implementation,
//! a default [`tokio_tungstenite`] adapter, configuration, and process-wide
//! connection statistics.
//!
//! # Architecture
//!
//! - [`WebsocketConn`]: capability trait (send, receive, ping, close,
//!   close-status classification)
//! - [`connection::TungsteniteConn`]: the default adapter
//! - [`stats`]: counters of active and closed connections

pub mod config;
pub mod connection;
pub mod error;
pub mod stats;

pub use config::WebsocketOptions;
pub use connection::{ConnectFn, WebsocketConn};
pub use error::WsError;
