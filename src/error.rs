//! Error types for the propaganda pub/sub library

/// Main error type for pub/sub operations
#[derive(Debug, thiserror::Error)]
pub enum PropagandaError {
    /// Broker transport unreachable or lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Payload could not be encoded
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Payload could not be decoded
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    /// Broker rejected a publish or the channel stayed unavailable
    #[error("Publish error: {message}")]
    Publish { message: String },

    /// A subscriber handler failed
    #[error("Handler error: {message}")]
    Handler { message: String },

    /// Invalid option combination, reported at startup
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The channel was closed underneath an in-flight call
    #[error("Channel closed")]
    ChannelClosed,

    /// Generic client error
    #[error("{message}")]
    Generic { message: String },
}

impl PropagandaError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error
    pub fn deserialization<S: Into<String>>(message: S) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish<S: Into<String>>(message: S) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::ChannelClosed => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ChannelClosed | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
