//! filter_stream - many subscribers, one shared stream connection
//!
//! Each subscriber registers a filter document and a callback. The client
//! keeps one WebSocket open whose URL encodes every registered filter, reopens
//! it whenever the set changes, and routes each inbound batch to the one
//! subscriber whose id it carries. Unplanned disconnects are retried a bounded
//! number of times with a fixed delay.
//!
//! # Example
//!
//! ```no_run
//! use filter_stream::{ClientConfig, StreamClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = StreamClient::connect(ClientConfig::default());
//!     let handle = client.handle();
//!
//!     let registration = handle
//!         .register(r#"{"data_type":"article","options":{"preload":true}}"#, |batch| {
//!             println!("{} articles", batch.data.len());
//!         })
//!         .unwrap();
//!     let id = registration.id().clone();
//!     registration.await.unwrap();
//!
//!     // ...later, when the widget goes away
//!     handle.unregister(&id);
//!     client.shutdown().await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
mod error;
pub mod filter;
pub mod registry;
pub mod retry;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_helpers;

pub use client::{ConnectionStatus, Registration, StreamClient, StreamClientHandle};
pub use config::{ClientConfig, ServerAddress};
pub use dispatch::InboundBatch;
pub use error::{Result, StreamError};
pub use filter::{Filter, ROUTING_KEY, SubscriberId};
pub use registry::FilterRegistry;
pub use retry::RetryPolicy;
pub use transport::{Transport, TransportConnection, WsTransport};
