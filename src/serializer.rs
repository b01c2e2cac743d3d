//! Payload serializers and the content-type registry

use crate::error::PropagandaError;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Converts application values to and from wire payloads.
///
/// Implementations must satisfy the round-trip law:
/// `deserialize(serialize(v)) == v` for every value they accept.
pub trait Serializer: Send + Sync {
    /// Content-type tag written into outgoing envelopes
    fn content_type(&self) -> &str;

    /// Encode a value into payload bytes
    fn serialize(&self, value: &Value) -> Result<Bytes, PropagandaError>;

    /// Decode payload bytes back into a value
    fn deserialize(&self, payload: &[u8]) -> Result<Value, PropagandaError>;
}

/// JSON serializer, the default content type
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, PropagandaError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| PropagandaError::serialization(e.to_string()))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Value, PropagandaError> {
        serde_json::from_slice(payload)
            .map_err(|e| PropagandaError::deserialization(e.to_string()))
    }
}

/// Plain-text serializer for string payloads.
///
/// Only accepts `Value::String`; anything else is a serialization error so
/// the round-trip law holds.
#[derive(Debug, Default)]
pub struct PlainSerializer;

impl Serializer for PlainSerializer {
    fn content_type(&self) -> &str {
        "text/plain"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, PropagandaError> {
        match value {
            Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
            other => Err(PropagandaError::serialization(format!(
                "text/plain only encodes strings, got {}",
                value_kind(other)
            ))),
        }
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Value, PropagandaError> {
        std::str::from_utf8(payload)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| PropagandaError::deserialization(e.to_string()))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Registry mapping content-type tags to serializers
pub struct SerializerRegistry {
    by_tag: RwLock<HashMap<String, Arc<dyn Serializer>>>,
}

impl SerializerRegistry {
    /// Create a registry with the built-in serializers registered
    pub fn new() -> Self {
        let registry = Self {
            by_tag: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(PlainSerializer));
        registry
    }

    /// Register a serializer under its content-type tag, replacing any
    /// existing registration for that tag
    pub fn register(&self, serializer: Arc<dyn Serializer>) {
        self.by_tag
            .write()
            .insert(serializer.content_type().to_string(), serializer);
    }

    /// Look up the serializer for a content-type tag
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Serializer>> {
        self.by_tag.read().get(content_type).cloned()
    }

    /// Look up a serializer, mapping a miss to a serialization error
    pub fn require(&self, content_type: &str) -> Result<Arc<dyn Serializer>, PropagandaError> {
        self.get(content_type).ok_or_else(|| {
            PropagandaError::serialization(format!(
                "no serializer registered for content type '{}'",
                content_type
            ))
        })
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
