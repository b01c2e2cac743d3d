//! The unit of transmission: payload plus routing metadata

use crate::error::PropagandaError;
use crate::serializer::SerializerRegistry;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

/// An immutable message envelope.
///
/// Created once per publish, handed to the broker client and discarded;
/// the payload is opaque to routing logic.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Routing key the message was published with (never empty)
    pub topic: String,
    /// Serialized payload bytes
    pub payload: Bytes,
    /// Content-type tag naming the serializer that produced the payload
    pub content_type: String,
    /// Unique id generated per publish
    pub message_id: String,
    /// Publish time, milliseconds since the unix epoch
    pub timestamp: u64,
    /// Application headers
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a fresh message id and a now-timestamp
    pub fn new<T, C>(topic: T, payload: Bytes, content_type: C) -> Result<Self, PropagandaError>
    where
        T: Into<String>,
        C: Into<String>,
    {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(PropagandaError::publish("topic must not be empty"));
        }

        Ok(Self {
            topic,
            payload,
            content_type: content_type.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            headers: HashMap::new(),
        })
    }

    /// Create an envelope builder
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    /// Decode the payload into a typed value, resolving the serializer for
    /// this envelope's content type through the registry
    pub fn decode<T: DeserializeOwned>(
        &self,
        serializers: &SerializerRegistry,
    ) -> Result<T, PropagandaError> {
        let serializer = serializers.require(&self.content_type)?;
        let value = serializer.deserialize(&self.payload)?;
        serde_json::from_value(value)
            .map_err(|e| PropagandaError::deserialization(e.to_string()))
    }
}

/// Builder for [`Envelope`]
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    topic: Option<String>,
    payload: Option<Bytes>,
    content_type: Option<String>,
    message_id: Option<String>,
    timestamp: Option<u64>,
    headers: HashMap<String, String>,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<T: Into<String>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn payload<P: Into<Bytes>>(mut self, payload: P) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn content_type<C: Into<String>>(mut self, content_type: C) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn message_id<M: Into<String>>(mut self, message_id: M) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Envelope, PropagandaError> {
        let topic = self
            .topic
            .ok_or_else(|| PropagandaError::publish("topic is required"))?;
        if topic.is_empty() {
            return Err(PropagandaError::publish("topic must not be empty"));
        }

        Ok(Envelope {
            topic,
            payload: self.payload.unwrap_or_default(),
            content_type: self
                .content_type
                .unwrap_or_else(|| "application/json".to_string()),
            message_id: self
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            headers: self.headers,
        })
    }
}

/// A consumer-side delivery: an envelope plus broker bookkeeping
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Broker-assigned tag used for ack/nack
    pub delivery_tag: u64,
    /// How many times this message has been redelivered
    pub redelivered: u32,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_gets_unique_id_and_timestamp() {
        let a = Envelope::new("orders.created", Bytes::from_static(b"{}"), "application/json")
            .unwrap();
        let b = Envelope::new("orders.created", Bytes::from_static(b"{}"), "application/json")
            .unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn test_empty_topic_rejected() {
        let result = Envelope::new("", Bytes::new(), "application/json");
        assert!(matches!(result, Err(PropagandaError::Publish { .. })));

        let result = Envelope::builder().topic("").payload("x").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_resolves_serializer_by_content_type() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Reading {
            value: u32,
        }

        let registry = SerializerRegistry::new();
        let envelope = Envelope::builder()
            .topic("metrics.cpu")
            .payload(r#"{"value":42}"#)
            .build()
            .unwrap();
        let reading: Reading = envelope.decode(&registry).unwrap();
        assert_eq!(reading, Reading { value: 42 });

        let unknown = Envelope::builder()
            .topic("metrics.cpu")
            .payload("x")
            .content_type("application/msgpack")
            .build()
            .unwrap();
        assert!(unknown.decode::<Reading>(&registry).is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let envelope = Envelope::builder()
            .topic("metrics.cpu")
            .payload(r#"{"value":42}"#)
            .header("origin", "test")
            .build()
            .unwrap();

        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.headers.get("origin").map(String::as_str), Some("test"));
        assert!(!envelope.message_id.is_empty());
    }
}
