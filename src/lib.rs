//! GraphQL client with two transports: a unary HTTP client for queries and
//! mutations, and a multiplexing websocket client for subscriptions.
//!
//! The subscription client speaks both wire protocols in common use:
//! Apollo's legacy `subscriptions-transport-ws` and the modern `graphql-ws`
//! (`graphql-transport-ws` subprotocol). Many logical subscriptions share a
//! single websocket; the client reconnects on transport failures and resumes
//! every registered subscription on the new connection.
//!
//! # Example
//!
//! ```no_run
//! use graphql_client_sdk::subscription::{SubscriptionClient, SubscriptionProtocolType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = SubscriptionClient::new("wss://example.com/graphql")
//!         .with_protocol(SubscriptionProtocolType::GraphQLWS);
//!
//!     client
//!         .exec(
//!             "subscription { messageAdded { id text } }",
//!             None,
//!             None,
//!             |event| {
//!                 let data = event?;
//!                 println!("{}", String::from_utf8_lossy(&data));
//!                 Ok(())
//!             },
//!         )
//!         .await?;
//!
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod http;
pub mod ops;
pub mod subscription;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
