//! The unary transport: GraphQL queries and mutations over HTTP POST.

pub mod client;
pub mod retry;

pub use client::Client;
pub use retry::RetryPolicy;
