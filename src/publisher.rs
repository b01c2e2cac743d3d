//! Publisher: serialize, wrap in an envelope, hand to the broker

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::error::PropagandaError;
use crate::metrics;
use crate::serializer::SerializerRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-publish options; unset fields fall back to the client config
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target exchange, defaulting to the configured one
    pub exchange: Option<String>,
    /// Override the envelope topic as the routing key
    pub routing_key: Option<String>,
    /// Ask the broker to persist the message
    pub persistent: bool,
    /// Wait for broker acknowledgement, defaulting to `confirm_publish`
    pub confirm: Option<bool>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange<S: Into<String>>(mut self, exchange: S) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key<S: Into<String>>(mut self, routing_key: S) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn confirm(mut self, confirm: bool) -> Self {
        self.confirm = Some(confirm);
        self
    }
}

/// What a successful publish reports back
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub message_id: String,
    pub topic: String,
    /// True when the broker acknowledged acceptance
    pub confirmed: bool,
}

/// High-level publisher over the shared connection
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    serializers: Arc<SerializerRegistry>,
    config: ClientConfig,
}

impl Publisher {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        serializers: Arc<SerializerRegistry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            connection,
            serializers,
            config,
        }
    }

    /// Publish a value to a topic with default options
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<PublishReceipt, PropagandaError> {
        self.publish_with(topic, value, PublishOptions::default()).await
    }

    /// Publish a value to a topic.
    ///
    /// The value is serialized with the configured content type, wrapped in
    /// an envelope with a fresh message id, and handed to an acquired
    /// channel. Serialization failures are never retried; transient channel
    /// failures are retried per the retry policy.
    pub async fn publish_with<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<PublishReceipt, PropagandaError> {
        if topic.is_empty() {
            return Err(PropagandaError::publish("topic must not be empty"));
        }

        let json = serde_json::to_value(value)
            .map_err(|e| PropagandaError::serialization(e.to_string()))?;
        let serializer = self.serializers.require(&self.config.content_type)?;
        let payload = serializer.serialize(&json)?;

        let envelope = Envelope::new(topic, payload, serializer.content_type())?;
        self.publish_envelope(envelope, options).await
    }

    /// Publish a pre-built envelope
    pub async fn publish_envelope(
        &self,
        mut envelope: Envelope,
        options: PublishOptions,
    ) -> Result<PublishReceipt, PropagandaError> {
        let exchange = options
            .exchange
            .as_deref()
            .unwrap_or(&self.config.exchange_name)
            .to_string();
        let routing_key = self
            .config
            .prefixed(options.routing_key.as_deref().unwrap_or(&envelope.topic));
        let confirm = options.confirm.unwrap_or(self.config.confirm_publish);

        // configured base headers, never overriding per-message ones
        for (key, value) in &self.config.base_headers {
            envelope
                .headers
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let properties = crate::broker::PublishProperties {
            content_type: envelope.content_type.clone(),
            message_id: envelope.message_id.clone(),
            timestamp: envelope.timestamp,
            headers: envelope.headers.clone(),
            persistent: options.persistent,
            confirm,
        };

        // the connection manager already retries connecting; this budget
        // covers channels that die between acquire and publish
        let max_attempts = self.config.retry.max_attempts.unwrap_or(3);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let channel = self.connection.acquire_channel().await?;
            match channel
                .publish(&exchange, &routing_key, envelope.payload.clone(), &properties)
                .await
            {
                Ok(()) => {
                    metrics::global_metrics().record_publish(envelope.payload.len() as u64);
                    debug!(topic = %routing_key, message_id = %envelope.message_id, "published");
                    return Ok(PublishReceipt {
                        message_id: envelope.message_id,
                        topic: routing_key,
                        confirmed: confirm,
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        topic = %routing_key,
                        attempt,
                        error = %e,
                        "transient publish failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    metrics::global_metrics().record_publish_error();
                    return Err(PropagandaError::publish(format!(
                        "publish to '{}' failed: {}",
                        routing_key, e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerChannel, BrokerClient, QueueOptions};
    use crate::memory::InMemoryBroker;
    use serde_json::json;

    fn setup(broker: &InMemoryBroker) -> Publisher {
        let config = ClientConfig::builder().exchange_name("events").build();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            config.clone(),
        ));
        Publisher::new(connection, Arc::new(SerializerRegistry::new()), config)
    }

    async fn bind_queue(broker: &InMemoryBroker, pattern: &str) -> Arc<dyn BrokerChannel> {
        let ch = broker.connect().await.unwrap();
        ch.declare_exchange("events", &crate::broker::ExchangeOptions::topic())
            .await
            .unwrap();
        ch.declare_queue("sink", &QueueOptions::default()).await.unwrap();
        ch.bind_queue("sink", "events", pattern).await.unwrap();
        ch
    }

    #[tokio::test]
    async fn test_publish_serializes_and_routes() {
        let broker = InMemoryBroker::new();
        let ch = bind_queue(&broker, "metrics.*").await;
        let mut rx = ch.consume("sink").await.unwrap();

        let publisher = setup(&broker);
        let receipt = publisher
            .publish("metrics.cpu", &json!({"value": 42}))
            .await
            .unwrap();
        assert_eq!(receipt.topic, "metrics.cpu");
        assert!(!receipt.confirmed);

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.message_id, receipt.message_id);
        assert_eq!(delivery.envelope.content_type, "application/json");
        let decoded: serde_json::Value =
            serde_json::from_slice(&delivery.envelope.payload).unwrap();
        assert_eq!(decoded, json!({"value": 42}));
    }

    #[tokio::test]
    async fn test_empty_topic_is_a_publish_error() {
        let broker = InMemoryBroker::new();
        let publisher = setup(&broker);
        let result = publisher.publish("", &json!({})).await;
        assert!(matches!(result, Err(PropagandaError::Publish { .. })));
    }

    #[tokio::test]
    async fn test_routing_key_override() {
        let broker = InMemoryBroker::new();
        let ch = bind_queue(&broker, "audit.#").await;
        let mut rx = ch.consume("sink").await.unwrap();

        let publisher = setup(&broker);
        publisher
            .publish_with(
                "orders.created",
                &json!({"id": 7}),
                PublishOptions::new().routing_key("audit.orders.created"),
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.topic, "audit.orders.created");
    }

    #[tokio::test]
    async fn test_key_prefix_applied() {
        let broker = InMemoryBroker::new();
        let ch = bind_queue(&broker, "svc.metrics.*").await;
        let mut rx = ch.consume("sink").await.unwrap();

        let config = ClientConfig::builder()
            .exchange_name("events")
            .key_prefix("svc.")
            .build();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            config.clone(),
        ));
        let publisher = Publisher::new(connection, Arc::new(SerializerRegistry::new()), config);

        let receipt = publisher.publish("metrics.cpu", &json!(1)).await.unwrap();
        assert_eq!(receipt.topic, "svc.metrics.cpu");
        assert_eq!(rx.recv().await.unwrap().envelope.topic, "svc.metrics.cpu");
    }

    #[tokio::test]
    async fn test_base_headers_merged_without_overriding() {
        let broker = InMemoryBroker::new();
        let ch = bind_queue(&broker, "#").await;
        let mut rx = ch.consume("sink").await.unwrap();

        let config = ClientConfig::builder()
            .exchange_name("events")
            .base_header("origin", "billing")
            .base_header("region", "eu")
            .build();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            config.clone(),
        ));
        let publisher = Publisher::new(connection, Arc::new(SerializerRegistry::new()), config);

        let envelope = Envelope::builder()
            .topic("orders.created")
            .payload("{}")
            .header("region", "us")
            .build()
            .unwrap();
        publisher
            .publish_envelope(envelope, PublishOptions::default())
            .await
            .unwrap();

        let headers = rx.recv().await.unwrap().envelope.headers;
        assert_eq!(headers.get("origin").map(String::as_str), Some("billing"));
        assert_eq!(headers.get("region").map(String::as_str), Some("us"));
    }
}
