//! In-process broker implementation.
//!
//! Backs the integration tests and lets host applications run the pub/sub
//! layer without an external broker. Topic-exchange routing only, no
//! persistence and no network; it is a collaborator stand-in, not a broker.

use crate::broker::{
    BrokerChannel, BrokerClient, ExchangeOptions, PublishProperties, QueueOptions,
};
use crate::envelope::{Delivery, Envelope};
use crate::error::PropagandaError;
use crate::topic::TopicPattern;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// An in-memory broker shared by every channel it hands out
#[derive(Clone)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
}

struct BrokerCore {
    exchanges: DashMap<String, ExchangeOptions>,
    queues: DashMap<String, Arc<QueueState>>,
    bindings: RwLock<Vec<QueueBinding>>,
    unacked: DashMap<u64, Unacked>,
    delivery_seq: AtomicU64,
    /// Bumped by [`InMemoryBroker::drop_channels`]; channels from older
    /// generations report closed
    generation: AtomicU64,
    fail_connects: AtomicU32,
}

struct QueueBinding {
    exchange: String,
    queue: String,
    pattern: TopicPattern,
}

struct QueueState {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    backlog: Mutex<VecDeque<Delivery>>,
}

struct Unacked {
    queue: String,
    delivery: Delivery,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                unacked: DashMap::new(),
                delivery_seq: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                fail_connects: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` connection attempts fail, for testing the
    /// reconnect path
    pub fn fail_next_connects(&self, count: u32) {
        self.core.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Simulate a transport-level disconnect: every outstanding channel
    /// reports closed and consumer streams end
    pub fn drop_channels(&self) {
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        for queue in self.core.queues.iter() {
            queue.value().sender.lock().take();
        }
    }

    /// Number of undelivered messages sitting in a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .queues
            .get(queue)
            .map(|q| q.backlog.lock().len())
            .unwrap_or(0)
    }

    /// Number of deliveries handed out but not yet acked
    pub fn unacked_count(&self) -> usize {
        self.core.unacked.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, PropagandaError> {
        let pending = self.core.fail_connects.load(Ordering::SeqCst);
        if pending > 0 {
            self.core.fail_connects.store(pending - 1, Ordering::SeqCst);
            return Err(PropagandaError::connection(
                "in-memory broker refused the connection",
            ));
        }

        Ok(Arc::new(MemoryChannel {
            core: self.core.clone(),
            generation: self.core.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    core: Arc<BrokerCore>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), PropagandaError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PropagandaError::ChannelClosed)
        }
    }
}

impl BrokerCore {
    fn deliver(&self, queue: &Arc<QueueState>, delivery: Delivery) {
        let mut sender = queue.sender.lock();
        if let Some(tx) = sender.as_ref() {
            // track before sending so an immediate ack always finds the tag
            let tag = delivery.delivery_tag;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue.name.clone(),
                    delivery: delivery.clone(),
                },
            );
            if tx.send(delivery).is_ok() {
                return;
            }
            // consumer went away, fall back to the backlog
            if let Some((_, unacked)) = self.unacked.remove(&tag) {
                queue.backlog.lock().push_back(unacked.delivery);
            }
            *sender = None;
        } else {
            queue.backlog.lock().push_back(delivery);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), PropagandaError> {
        self.ensure_open()?;
        self.core
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| options.clone());
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: &QueueOptions,
    ) -> Result<(), PropagandaError> {
        self.ensure_open()?;
        self.core
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    sender: Mutex::new(None),
                    backlog: Mutex::new(VecDeque::new()),
                })
            });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PropagandaError> {
        self.ensure_open()?;
        if !self.core.exchanges.contains_key(exchange) {
            return Err(PropagandaError::publish(format!(
                "exchange '{}' is not declared",
                exchange
            )));
        }
        if !self.core.queues.contains_key(queue) {
            return Err(PropagandaError::publish(format!(
                "queue '{}' is not declared",
                queue
            )));
        }

        let pattern = TopicPattern::new(routing_key)?;
        let mut bindings = self.core.bindings.write();
        let exists = bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.pattern.as_str() == routing_key
        });
        if !exists {
            bindings.push(QueueBinding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), PropagandaError> {
        self.ensure_open()?;
        if !self.core.exchanges.contains_key(exchange) {
            return Err(PropagandaError::publish(format!(
                "exchange '{}' is not declared",
                exchange
            )));
        }

        // one delivery per queue, even when several bindings match
        let mut target_queues: Vec<String> = Vec::new();
        {
            let bindings = self.core.bindings.read();
            for binding in bindings.iter() {
                if binding.exchange == exchange
                    && binding.pattern.matches(routing_key)
                    && !target_queues.contains(&binding.queue)
                {
                    target_queues.push(binding.queue.clone());
                }
            }
        }

        if target_queues.is_empty() {
            debug!(exchange, routing_key, "message is unroutable, dropping");
            return Ok(());
        }

        let envelope = Envelope {
            topic: routing_key.to_string(),
            payload,
            content_type: properties.content_type.clone(),
            message_id: properties.message_id.clone(),
            timestamp: properties.timestamp,
            headers: properties.headers.clone(),
        };

        for queue_name in target_queues {
            if let Some(queue) = self.core.queues.get(&queue_name) {
                let delivery = Delivery {
                    envelope: envelope.clone(),
                    delivery_tag: self.core.delivery_seq.fetch_add(1, Ordering::SeqCst),
                    redelivered: 0,
                };
                self.core.deliver(queue.value(), delivery);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, PropagandaError> {
        self.ensure_open()?;
        let state = self
            .core
            .queues
            .get(queue)
            .map(|q| q.value().clone())
            .ok_or_else(|| {
                PropagandaError::generic(format!("queue '{}' is not declared", queue))
            })?;

        let (tx, rx) = mpsc::unbounded_channel();

        // redeliver what the previous consumer never acked, oldest first
        let mut orphaned: Vec<u64> = self
            .core
            .unacked
            .iter()
            .filter(|entry| entry.value().queue == queue)
            .map(|entry| *entry.key())
            .collect();
        orphaned.sort_unstable();
        for tag in orphaned {
            if let Some((_, unacked)) = self.core.unacked.remove(&tag) {
                let mut delivery = unacked.delivery;
                delivery.redelivered += 1;
                self.core.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        delivery: delivery.clone(),
                    },
                );
                let _ = tx.send(delivery);
            }
        }

        // drain the backlog and install the sender under the sender lock,
        // so a concurrent deliver() cannot slip a message into the backlog
        // after the drain but before the consumer is visible
        {
            let mut sender = state.sender.lock();
            let mut backlog = state.backlog.lock();
            while let Some(delivery) = backlog.pop_front() {
                self.core.unacked.insert(
                    delivery.delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        delivery: delivery.clone(),
                    },
                );
                let _ = tx.send(delivery);
            }
            *sender = Some(tx);
        }

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PropagandaError> {
        // acking an already-settled tag is harmless
        self.core.unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), PropagandaError> {
        if let Some((_, unacked)) = self.core.unacked.remove(&delivery_tag) {
            if requeue {
                let mut delivery = unacked.delivery;
                delivery.redelivered += 1;
                if let Some(queue) = self.core.queues.get(&unacked.queue) {
                    self.core.deliver(queue.value(), delivery);
                }
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.core.generation.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PropagandaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
