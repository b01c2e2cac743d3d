//! Configuration types for the pub/sub client

use crate::error::PropagandaError;
use std::collections::HashMap;
use std::time::Duration;

/// Client configuration shared by publishers and subscribers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker connection string
    pub broker_url: String,
    /// Default exchange messages are published to and queues are bound on
    pub exchange_name: String,
    /// Default serializer tag for outgoing payloads
    pub content_type: String,
    /// Prefix applied to every routing key and binding key
    pub key_prefix: String,
    /// Headers merged into every outgoing envelope
    pub base_headers: HashMap<String, String>,
    /// How many redeliveries a failing message gets before dead-lettering
    pub max_redelivery: u32,
    /// Wait for broker acknowledgement of each publish
    pub confirm_publish: bool,
    /// Number of handler invocations allowed in flight at once
    pub worker_concurrency: usize,
    /// Exchange that exhausted messages are routed to, if any
    pub dead_letter_exchange: Option<String>,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Reconnect and publish retry policy
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "amqp://localhost:5672".to_string(),
            exchange_name: "propaganda".to_string(),
            content_type: "application/json".to_string(),
            key_prefix: String::new(),
            base_headers: HashMap::new(),
            max_redelivery: 3,
            confirm_publish: false,
            worker_concurrency: 1,
            dead_letter_exchange: None,
            connect_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Apply the configured key prefix to a routing or binding key
    pub fn prefixed(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.key_prefix, key)
        }
    }

    /// Validate option combinations, failing fast at startup
    pub fn validate(&self) -> Result<(), PropagandaError> {
        if self.broker_url.is_empty() {
            return Err(PropagandaError::invalid_config("broker_url must not be empty"));
        }
        if self.exchange_name.is_empty() {
            return Err(PropagandaError::invalid_config(
                "exchange_name must not be empty",
            ));
        }
        if self.content_type.is_empty() {
            return Err(PropagandaError::invalid_config(
                "content_type must not be empty",
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(PropagandaError::invalid_config(
                "worker_concurrency must be at least 1",
            ));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            if dlx == &self.exchange_name {
                return Err(PropagandaError::invalid_config(
                    "dead_letter_exchange must differ from exchange_name",
                ));
            }
        }
        self.retry.validate()
    }
}

/// Retry policy with bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, `None` for unlimited
    pub max_attempts: Option<usize>,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Backoff multiplier per attempt
    pub multiplier: f64,
    /// Randomize delays to avoid reconnect storms
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Compute the backoff delay after `attempt` failed tries (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            // full delay down to half of it, spread out reconnecting clients
            capped * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }

    /// True when another attempt is allowed after `attempt` failures
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    fn validate(&self) -> Result<(), PropagandaError> {
        if self.initial_delay.is_zero() {
            return Err(PropagandaError::invalid_config(
                "retry initial_delay must be non-zero",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(PropagandaError::invalid_config(
                "retry multiplier must be at least 1.0",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(PropagandaError::invalid_config(
                "retry max_delay must not be below initial_delay",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(PropagandaError::invalid_config(
                "retry max_attempts must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn broker_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn exchange_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.exchange_name = name.into();
        self
    }

    pub fn content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.config.content_type = content_type.into();
        self
    }

    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn base_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.base_headers.insert(key.into(), value.into());
        self
    }

    pub fn max_redelivery(mut self, count: u32) -> Self {
        self.config.max_redelivery = count;
        self
    }

    pub fn confirm_publish(mut self, confirm: bool) -> Self {
        self.config.confirm_publish = confirm;
        self
    }

    pub fn worker_concurrency(mut self, workers: usize) -> Self {
        self.config.worker_concurrency = workers;
        self
    }

    pub fn dead_letter_exchange<S: Into<String>>(mut self, exchange: S) -> Self {
        self.config.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .broker_url("amqp://broker:5672")
            .exchange_name("events")
            .key_prefix("svc.")
            .max_redelivery(5)
            .confirm_publish(true)
            .worker_concurrency(4)
            .build();

        assert_eq!(config.broker_url, "amqp://broker:5672");
        assert_eq!(config.exchange_name, "events");
        assert_eq!(config.max_redelivery, 5);
        assert!(config.confirm_publish);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.prefixed("orders.created"), "svc.orders.created");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_fails_fast() {
        let mut config = ClientConfig::default();
        config.worker_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(PropagandaError::InvalidConfig { .. })
        ));

        let mut config = ClientConfig::default();
        config.exchange_name.clear();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.dead_letter_exchange = Some(config.exchange_name.clone());
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = RetryConfig {
            max_attempts: Some(10),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(5), Duration::from_secs(16));
        // capped past the sixth attempt
        assert_eq!(retry.delay_for(7), Duration::from_secs(30));
        assert_eq!(retry.delay_for(100), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_backoff_stays_in_range() {
        let retry = RetryConfig::default();
        for attempt in 1..=8 {
            let delay = retry.delay_for(attempt);
            assert!(delay <= retry.max_delay);
            assert!(delay >= retry.initial_delay / 2);
        }
    }

    #[test]
    fn test_attempt_budget() {
        let unlimited = RetryConfig::default();
        assert!(unlimited.allows_attempt(10_000));

        let bounded = RetryConfig {
            max_attempts: Some(3),
            ..RetryConfig::default()
        };
        assert!(bounded.allows_attempt(2));
        assert!(!bounded.allows_attempt(3));
    }
}
