//! Broker client collaborator traits.
//!
//! The actual transport (TCP framing, AMQP encoding) lives behind these
//! traits; the core only needs to open channels, declare topology, publish
//! envelopes and register consumers. [`crate::memory::InMemoryBroker`]
//! provides an in-process implementation for tests and local development.

use crate::envelope::Delivery;
use crate::error::PropagandaError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Exchange kinds supported by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
    Direct,
}

/// Options for exchange declaration
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    /// A durable topic exchange, the default topology for pub/sub
    pub fn topic() -> Self {
        Self {
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Options for queue declaration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    // transient subscription queues, gone when the subscriber goes away
    fn default() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Per-publish properties handed to the broker client
#[derive(Debug, Clone)]
pub struct PublishProperties {
    pub content_type: String,
    pub message_id: String,
    pub timestamp: u64,
    pub headers: HashMap<String, String>,
    /// Ask the broker to persist the message
    pub persistent: bool,
    /// Wait for broker acceptance before returning
    pub confirm: bool,
}

/// Connection factory for a message broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish a connection and open a channel on it
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, PropagandaError>;
}

/// A single broker channel.
///
/// With `confirm` set in the properties, `publish` returning `Ok` means the
/// broker acknowledged acceptance; otherwise it is fire-and-forget.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), PropagandaError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<(), PropagandaError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PropagandaError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), PropagandaError>;

    /// Begin consuming from a queue; deliveries arrive on the receiver
    /// until the channel closes
    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, PropagandaError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), PropagandaError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), PropagandaError>;

    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), PropagandaError>;
}
