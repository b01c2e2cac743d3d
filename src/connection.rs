//! Connection management: a lazily-established, auto-recovering channel

use crate::broker::{BrokerChannel, BrokerClient, ExchangeOptions};
use crate::config::ClientConfig;
use crate::error::PropagandaError;
use crate::metrics;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Connectivity state, owned exclusively by the [`ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

/// Owns the single shared broker channel.
///
/// The channel is established lazily on the first
/// [`acquire_channel`](ConnectionManager::acquire_channel) and re-established
/// automatically when the broker client reports it closed. Connection
/// attempts are serialized: concurrent acquirers wait on the same attempt
/// instead of piling up reconnects.
pub struct ConnectionManager {
    broker: Arc<dyn BrokerClient>,
    config: ClientConfig,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn BrokerClient>, config: ClientConfig) -> Self {
        Self {
            broker,
            config,
            channel: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Current connectivity state snapshot
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Return a usable channel, connecting or recovering as needed.
    ///
    /// Retries with bounded, jittered exponential backoff; fails with a
    /// `Connection` error once the configured attempt budget is exhausted.
    pub async fn acquire_channel(&self) -> Result<Arc<dyn BrokerChannel>, PropagandaError> {
        let mut slot = self.channel.lock().await;

        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            warn!("broker channel lost, recovering");
            metrics::global_metrics().record_reconnection();
            self.set_state(ConnectionState::Recovering);
            *slot = None;
        } else if self.state() != ConnectionState::Recovering {
            self.set_state(ConnectionState::Connecting);
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(channel) => {
                    self.set_state(ConnectionState::Connected);
                    metrics::global_metrics().record_connection_established();
                    info!(url = %self.config.broker_url, "connected to broker");
                    *slot = Some(channel.clone());
                    return Ok(channel);
                }
                Err(e) => {
                    metrics::global_metrics().record_connection_failure();
                    if !self.config.retry.allows_attempt(attempt) {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(PropagandaError::connection(format!(
                            "broker unreachable after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Arc<dyn BrokerChannel>, PropagandaError> {
        let channel = timeout(self.config.connect_timeout, self.broker.connect())
            .await
            .map_err(|_| {
                PropagandaError::timeout(self.config.connect_timeout.as_millis() as u64)
            })??;

        // topology is declared once per (re)connect so recovery restores it
        channel
            .declare_exchange(&self.config.exchange_name, &ExchangeOptions::topic())
            .await?;
        if let Some(dlx) = &self.config.dead_letter_exchange {
            channel.declare_exchange(dlx, &ExchangeOptions::topic()).await?;
        }

        debug!(exchange = %self.config.exchange_name, "declared exchange topology");
        Ok(channel)
    }

    /// Drop the channel and return to `Disconnected`
    pub async fn close(&self) -> Result<(), PropagandaError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.take() {
            channel.close().await?;
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use std::time::Duration;

    fn fast_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.retry.initial_delay = Duration::from_millis(5);
        config.retry.max_delay = Duration::from_millis(20);
        config.retry.jitter = false;
        config
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reuse() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker), fast_config());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let a = manager.acquire_channel().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        let b = manager.acquire_channel().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_retries_until_broker_accepts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let manager = ConnectionManager::new(Arc::new(broker), fast_config());

        let channel = manager.acquire_channel().await.unwrap();
        assert!(channel.is_open());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_bounded_retries_surface_connection_error() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(10);
        let mut config = fast_config();
        config.retry.max_attempts = Some(3);
        let manager = ConnectionManager::new(Arc::new(broker), config);

        let result = manager.acquire_channel().await;
        assert!(matches!(result, Err(PropagandaError::Connection { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_recovers_after_channel_drop() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_config());

        let first = manager.acquire_channel().await.unwrap();
        broker.drop_channels();
        assert!(!first.is_open());

        let second = manager.acquire_channel().await.unwrap();
        assert!(second.is_open());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_returns_to_disconnected() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker), fast_config());

        manager.acquire_channel().await.unwrap();
        manager.close().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
