//! # Propaganda
//!
//! Topic-based pub/sub utilities over an abstract message broker.
//!
//! ## Features
//!
//! - **Envelopes**: Every message carries a topic, content type, message id,
//!   timestamp and headers
//! - **Topic Patterns**: AMQP-style wildcard matching (`*` one segment,
//!   `#` zero or more)
//! - **Pluggable Serialization**: Content-type keyed serializer registry,
//!   JSON and plain text built in
//! - **Auto-Recovery**: Lazily-established connection with bounded jittered
//!   backoff and topology re-declaration
//! - **Redelivery Policy**: Failing handlers get a bounded number of
//!   redeliveries, then dead-lettering or a logged drop
//! - **Observability**: Structured tracing and built-in counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use propaganda::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let client = Propaganda::new(broker)?;
//!
//!     let subscriber = client.subscriber("billing");
//!     subscriber.subscribe_fn("orders.*", |envelope, payload| {
//!         println!("{} -> {}", envelope.topic, payload);
//!         Ok(())
//!     })?;
//!     subscriber.start().await?;
//!
//!     client
//!         .publisher()
//!         .publish("orders.created", &json!({"id": 7}))
//!         .await?;
//!
//!     subscriber.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod publisher;
pub mod serializer;
pub mod subscriber;
pub mod topic;

pub use broker::{
    BrokerChannel, BrokerClient, ExchangeKind, ExchangeOptions, PublishProperties, QueueOptions,
};
pub use client::Propaganda;
pub use config::{ClientConfig, ClientConfigBuilder, RetryConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use envelope::{Delivery, Envelope, EnvelopeBuilder};
pub use error::PropagandaError;
pub use memory::InMemoryBroker;
pub use metrics::{global_metrics, ClientMetrics, MetricsSnapshot};
pub use publisher::{PublishOptions, PublishReceipt, Publisher};
pub use serializer::{JsonSerializer, PlainSerializer, Serializer, SerializerRegistry};
pub use subscriber::{BindingId, FnHandler, Handler, Subscriber, SubscriberState};
pub use topic::TopicPattern;

/// Library result type
pub type Result<T> = std::result::Result<T, PropagandaError>;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
