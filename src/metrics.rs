//! Client-side counters for the pub/sub layer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pub/sub metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Publisher side
    pub messages_published: AtomicU64,
    pub bytes_published: AtomicU64,
    pub publish_errors: AtomicU64,

    // Subscriber side
    pub messages_delivered: AtomicU64,
    pub handler_errors: AtomicU64,
    pub redeliveries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub messages_dropped: AtomicU64,

    // Connection side
    pub connections_established: AtomicU64,
    pub connection_failures: AtomicU64,
    pub reconnections: AtomicU64,
}

impl ClientMetrics {
    pub fn record_publish(&self, byte_count: u64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redelivery(&self) {
        self.redeliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub bytes_published: u64,
    pub publish_errors: u64,
    pub messages_delivered: u64,
    pub handler_errors: u64,
    pub redeliveries: u64,
    pub dead_lettered: u64,
    pub messages_dropped: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnections: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ClientMetrics::default();
        metrics.record_publish(128);
        metrics.record_publish(64);
        metrics.record_delivery();
        metrics.record_handler_error();
        metrics.record_redelivery();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 192);
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.handler_errors, 1);
        assert_eq!(snapshot.redeliveries, 1);
    }

    #[test]
    fn test_global_metrics_is_shared() {
        let a = global_metrics();
        let b = global_metrics();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
