//! Top-level client tying configuration, connection, publisher and
//! subscribers together

use crate::broker::BrokerClient;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::PropagandaError;
use crate::publisher::Publisher;
use crate::serializer::{Serializer, SerializerRegistry};
use crate::subscriber::Subscriber;
use std::sync::Arc;
use tracing::info;

/// Entry point for the pub/sub client.
///
/// Owns the shared connection manager and serializer registry. Publishers
/// and subscribers created from the same client share both, so a single
/// broker connection serves the whole process.
pub struct Propaganda {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    serializers: Arc<SerializerRegistry>,
}

impl Propaganda {
    /// Create a client over a broker with the default configuration
    pub fn new(broker: Arc<dyn BrokerClient>) -> Result<Self, PropagandaError> {
        Self::with_config(broker, ClientConfig::default())
    }

    /// Create a client over a broker, validating the configuration up front
    pub fn with_config(
        broker: Arc<dyn BrokerClient>,
        config: ClientConfig,
    ) -> Result<Self, PropagandaError> {
        config.validate()?;
        info!(
            exchange = %config.exchange_name,
            url = %config.broker_url,
            "pub/sub client created"
        );
        Ok(Self {
            connection: Arc::new(ConnectionManager::new(broker, config.clone())),
            serializers: Arc::new(SerializerRegistry::new()),
            config,
        })
    }

    /// Client configuration in effect
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connectivity state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Register a custom serializer under its content-type tag
    pub fn register_serializer(&self, serializer: Arc<dyn Serializer>) {
        self.serializers.register(serializer);
    }

    /// Create a publisher sharing this client's connection
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.connection.clone(),
            self.serializers.clone(),
            self.config.clone(),
        )
    }

    /// Create a subscriber consuming from `queue`
    pub fn subscriber<S: Into<String>>(&self, queue: S) -> Subscriber {
        Subscriber::new(
            self.connection.clone(),
            self.serializers.clone(),
            self.config.clone(),
            queue.into(),
        )
    }

    /// Close the shared connection; running subscribers should be stopped
    /// first
    pub async fn close(&self) -> Result<(), PropagandaError> {
        self.connection.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::serializer::PlainSerializer;
    use serde_json::json;

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let config = ClientConfig::builder().worker_concurrency(0).build();
        let result = Propaganda::with_config(Arc::new(InMemoryBroker::new()), config);
        assert!(matches!(result, Err(PropagandaError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_publisher_and_subscriber_share_the_connection() {
        let client = Propaganda::new(Arc::new(InMemoryBroker::new())).unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let subscriber = client.subscriber("shared-queue");
        subscriber.subscribe_fn("events.*", |_, _| Ok(())).unwrap();
        subscriber.start().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        let publisher = client.publisher();
        let (matched, _) = tokio::join!(
            subscriber.wait("events.*", Some(std::time::Duration::from_secs(2))),
            async {
                publisher.publish("events.ping", &json!(1)).await.unwrap();
            }
        );
        assert!(matched.unwrap());

        subscriber.stop().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_custom_serializer_registration() {
        let config = ClientConfig::builder().content_type("text/plain").build();
        let client = Propaganda::with_config(Arc::new(InMemoryBroker::new()), config).unwrap();
        client.register_serializer(Arc::new(PlainSerializer));

        let receipt = client
            .publisher()
            .publish("notes.added", &json!("hello"))
            .await
            .unwrap();
        assert_eq!(receipt.topic, "notes.added");
    }
}
