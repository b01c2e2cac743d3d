//! Subscriber: consumer registry, dispatcher loop and redelivery policy

use crate::broker::{BrokerChannel, PublishProperties, QueueOptions};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{Delivery, Envelope};
use crate::error::PropagandaError;
use crate::metrics;
use crate::serializer::SerializerRegistry;
use crate::topic::TopicPattern;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A message handler bound to a topic pattern.
///
/// Returning `Err` triggers the redelivery policy; it never crashes the
/// dispatcher loop.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, payload: &Value) -> Result<(), PropagandaError>;
}

type ErrorHook = Box<dyn Fn(&PropagandaError) + Send + Sync>;

/// Adapts a plain closure into a [`Handler`]
pub struct FnHandler<F> {
    callback: F,
    on_error: Option<ErrorHook>,
}

impl<F> FnHandler<F>
where
    F: Fn(&Envelope, &Value) -> Result<(), PropagandaError> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            on_error: None,
        }
    }

    /// Observe handler failures without changing the redelivery policy
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(&PropagandaError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Envelope, &Value) -> Result<(), PropagandaError> + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope, payload: &Value) -> Result<(), PropagandaError> {
        let result = (self.callback)(envelope, payload);
        if let (Err(e), Some(hook)) = (&result, &self.on_error) {
            hook(e);
        }
        result
    }
}

/// Identifies a registered binding for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

/// Subscriber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Running,
    Draining,
}

struct Binding {
    id: u64,
    pattern: TopicPattern,
    handler: Arc<dyn Handler>,
}

struct CatchAll {
    id: u64,
    handler: Arc<dyn Handler>,
}

/// Pattern-to-handler registry; insertion order decides dispatch order
struct Registry {
    bindings: RwLock<Vec<Binding>>,
    catch_all: RwLock<Vec<CatchAll>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
            catch_all: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        let mut handlers: Vec<Arc<dyn Handler>> = self
            .bindings
            .read()
            .iter()
            .filter(|b| b.pattern.matches(topic))
            .map(|b| b.handler.clone())
            .collect();
        handlers.extend(self.catch_all.read().iter().map(|c| c.handler.clone()));
        handlers
    }

    fn binding_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for binding in self.bindings.read().iter() {
            let pattern = binding.pattern.as_str().to_string();
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        if !self.catch_all.read().is_empty() {
            patterns.push("#".to_string());
        }
        patterns
    }

    fn remove(&self, id: u64) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| b.id != id);
        if bindings.len() != before {
            return true;
        }
        drop(bindings);

        let mut catch_all = self.catch_all.write();
        let before = catch_all.len();
        catch_all.retain(|c| c.id != id);
        catch_all.len() != before
    }
}

/// Wakes tasks blocked on the next matching message
struct Waiters {
    by_pattern: Mutex<Vec<(TopicPattern, Arc<Notify>)>>,
    any: Arc<Notify>,
}

impl Waiters {
    fn new() -> Self {
        Self {
            by_pattern: Mutex::new(Vec::new()),
            any: Arc::new(Notify::new()),
        }
    }

    fn register(&self, pattern: TopicPattern) -> Arc<Notify> {
        let mut guard = self.by_pattern.lock();
        if let Some((_, notify)) = guard.iter().find(|(p, _)| *p == pattern) {
            return notify.clone();
        }
        let notify = Arc::new(Notify::new());
        guard.push((pattern, notify.clone()));
        notify
    }

    fn notify(&self, topic: &str) {
        self.any.notify_waiters();
        for (pattern, notify) in self.by_pattern.lock().iter() {
            if pattern.matches(topic) {
                notify.notify_waiters();
            }
        }
    }

    async fn await_notify(notify: Arc<Notify>, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, notify.notified())
                .await
                .is_ok(),
            None => {
                notify.notified().await;
                true
            }
        }
    }
}

/// Binds handlers to topic patterns on a queue and drives the dispatcher
/// loop that feeds them.
///
/// State machine: Idle -> Running on [`start`](Subscriber::start), Running
/// -> Draining -> Idle on [`stop`](Subscriber::stop). Stopping waits for
/// in-flight handlers to return.
pub struct Subscriber {
    queue: String,
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    serializers: Arc<SerializerRegistry>,
    registry: Arc<Registry>,
    waiters: Arc<Waiters>,
    state: Arc<RwLock<SubscriberState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        serializers: Arc<SerializerRegistry>,
        config: ClientConfig,
        queue: String,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            config,
            connection,
            serializers,
            registry: Arc::new(Registry::new()),
            waiters: Arc::new(Waiters::new()),
            state: Arc::new(RwLock::new(SubscriberState::Idle)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriberState {
        *self.state.read()
    }

    /// Queue this subscriber consumes from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Register a handler for a topic pattern.
    ///
    /// Register bindings before `start`; the queue is bound to each pattern
    /// when the dispatcher starts (and again after recovery).
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<BindingId, PropagandaError> {
        let pattern = TopicPattern::new(&self.config.prefixed(pattern))?;
        let id = self.registry.allocate_id();
        self.registry.bindings.write().push(Binding {
            id,
            pattern,
            handler,
        });
        Ok(BindingId(id))
    }

    /// Register a closure for a topic pattern
    pub fn subscribe_fn<F>(&self, pattern: &str, callback: F) -> Result<BindingId, PropagandaError>
    where
        F: Fn(&Envelope, &Value) -> Result<(), PropagandaError> + Send + Sync + 'static,
    {
        self.subscribe(pattern, Arc::new(FnHandler::new(callback)))
    }

    /// Register a handler invoked for every delivery regardless of topic
    pub fn subscribe_all(&self, handler: Arc<dyn Handler>) -> BindingId {
        let id = self.registry.allocate_id();
        self.registry.catch_all.write().push(CatchAll { id, handler });
        BindingId(id)
    }

    /// Remove a binding; returns false (no-op) when it was never registered
    pub fn unsubscribe(&self, id: BindingId) -> bool {
        self.registry.remove(id.0)
    }

    /// Block until the next message matching `pattern` is dispatched.
    ///
    /// Returns `Ok(false)` on timeout.
    pub async fn wait(
        &self,
        pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, PropagandaError> {
        let pattern = TopicPattern::new(&self.config.prefixed(pattern))?;
        let notify = self.waiters.register(pattern);
        Ok(Waiters::await_notify(notify, timeout).await)
    }

    /// Block until any message is dispatched; false on timeout
    pub async fn wait_any(&self, timeout: Option<Duration>) -> bool {
        Waiters::await_notify(self.waiters.any.clone(), timeout).await
    }

    /// Begin the dispatcher loop.
    ///
    /// Errors if the subscriber is not idle, or if the queue cannot be
    /// declared and bound.
    pub async fn start(&self) -> Result<(), PropagandaError> {
        {
            let mut state = self.state.write();
            if *state != SubscriberState::Idle {
                return Err(PropagandaError::generic("subscriber is not idle"));
            }
            *state = SubscriberState::Running;
        }

        let ctx = Arc::new(DispatchCtx {
            queue: self.queue.clone(),
            config: self.config.clone(),
            connection: self.connection.clone(),
            serializers: self.serializers.clone(),
            registry: self.registry.clone(),
            waiters: self.waiters.clone(),
            state: self.state.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.worker_concurrency)),
        });

        let (channel, receiver) = match attach(&ctx).await {
            Ok(attached) => attached,
            Err(e) => {
                *self.state.write() = SubscriberState::Idle;
                return Err(e);
            }
        };

        let _ = self.shutdown.send(false);
        let shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(ctx, channel, receiver, shutdown_rx));
        *self.task.lock() = Some(handle);

        info!(queue = %self.queue, "subscriber started");
        Ok(())
    }

    /// Request graceful shutdown and wait for in-flight handlers to finish
    pub async fn stop(&self) -> Result<(), PropagandaError> {
        self.stop_with_timeout(None).await
    }

    /// Like [`stop`](Subscriber::stop), but abandon the drain after
    /// `drain_timeout` and abort whatever is still running
    pub async fn stop_with_timeout(
        &self,
        drain_timeout: Option<Duration>,
    ) -> Result<(), PropagandaError> {
        {
            let mut state = self.state.write();
            match *state {
                SubscriberState::Running => *state = SubscriberState::Draining,
                // stop on an idle or already-draining subscriber is a no-op
                _ => return Ok(()),
            }
        }

        let _ = self.shutdown.send(true);
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            match drain_timeout {
                None => {
                    let _ = (&mut handle).await;
                }
                Some(duration) => {
                    if tokio::time::timeout(duration, &mut handle).await.is_err() {
                        warn!(queue = %self.queue, "drain timeout expired, aborting dispatcher");
                        handle.abort();
                    }
                }
            }
        }

        *self.state.write() = SubscriberState::Idle;
        info!(queue = %self.queue, "subscriber stopped");
        Ok(())
    }
}

struct DispatchCtx {
    queue: String,
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    serializers: Arc<SerializerRegistry>,
    registry: Arc<Registry>,
    waiters: Arc<Waiters>,
    state: Arc<RwLock<SubscriberState>>,
    semaphore: Arc<Semaphore>,
}

/// Declare the queue, bind every registered pattern, start consuming
async fn attach(
    ctx: &Arc<DispatchCtx>,
) -> Result<(Arc<dyn BrokerChannel>, mpsc::UnboundedReceiver<Delivery>), PropagandaError> {
    let channel = ctx.connection.acquire_channel().await?;
    channel
        .declare_queue(&ctx.queue, &QueueOptions::default())
        .await?;
    for pattern in ctx.registry.binding_patterns() {
        channel
            .bind_queue(&ctx.queue, &ctx.config.exchange_name, &pattern)
            .await?;
    }
    let receiver = channel.consume(&ctx.queue).await?;
    Ok((channel, receiver))
}

async fn run_loop(
    ctx: Arc<DispatchCtx>,
    mut channel: Arc<dyn BrokerChannel>,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dispatcher_failed = false;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = receiver.recv() => match delivery {
                Some(delivery) => dispatch(&ctx, &channel, delivery).await,
                None => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(queue = %ctx.queue, "consume stream ended, re-attaching");
                    match attach(&ctx).await {
                        Ok((new_channel, new_receiver)) => {
                            channel = new_channel;
                            receiver = new_receiver;
                        }
                        Err(e) => {
                            error!(queue = %ctx.queue, error = %e, "could not re-attach consumer, stopping");
                            dispatcher_failed = true;
                            break;
                        }
                    }
                }
            }
        }
    }

    // wait for every in-flight handler before reporting the loop done
    let permits = ctx.config.worker_concurrency as u32;
    let _ = ctx.semaphore.acquire_many(permits).await;
    debug!(queue = %ctx.queue, "dispatcher loop drained");

    // a loop that died on its own must not leave the subscriber claiming
    // Running; stop() owns the transition when it initiated the exit
    if dispatcher_failed {
        let mut state = ctx.state.write();
        if *state == SubscriberState::Running {
            *state = SubscriberState::Idle;
        }
    }
}

/// Run one delivery inline, or on a bounded worker when concurrency is on
async fn dispatch(ctx: &Arc<DispatchCtx>, channel: &Arc<dyn BrokerChannel>, delivery: Delivery) {
    if ctx.config.worker_concurrency > 1 {
        let permit = match ctx.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let ctx = ctx.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_delivery(&ctx, channel.as_ref(), delivery).await;
        });
    } else {
        process_delivery(ctx, channel.as_ref(), delivery).await;
    }
}

async fn process_delivery(ctx: &DispatchCtx, channel: &dyn BrokerChannel, delivery: Delivery) {
    let client_metrics = metrics::global_metrics();
    client_metrics.record_delivery();

    let envelope = &delivery.envelope;
    ctx.waiters.notify(&envelope.topic);

    let payload = match ctx
        .serializers
        .require(&envelope.content_type)
        .and_then(|s| s.deserialize(&envelope.payload))
    {
        Ok(payload) => payload,
        Err(e) => {
            // decoding is deterministic, redelivery would fail identically
            error!(
                topic = %envelope.topic,
                message_id = %envelope.message_id,
                error = %e,
                "payload decode failed"
            );
            dead_letter_or_drop(ctx, channel, &delivery, &e).await;
            return;
        }
    };

    let handlers = ctx.registry.matching_handlers(&envelope.topic);
    if handlers.is_empty() {
        debug!(topic = %envelope.topic, "no binding matches, acknowledging");
        ack(channel, delivery.delivery_tag).await;
        return;
    }

    let mut failure: Option<PropagandaError> = None;
    for handler in handlers {
        if let Err(e) = handler.handle(envelope, &payload).await {
            client_metrics.record_handler_error();
            error!(
                topic = %envelope.topic,
                message_id = %envelope.message_id,
                error = %e,
                "handler failed"
            );
            failure = Some(e);
        }
    }

    match failure {
        None => ack(channel, delivery.delivery_tag).await,
        Some(e) => {
            if delivery.redelivered < ctx.config.max_redelivery {
                client_metrics.record_redelivery();
                debug!(
                    topic = %envelope.topic,
                    redelivered = delivery.redelivered,
                    "requeueing failed delivery"
                );
                if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                    warn!(error = %err, "nack failed");
                }
            } else {
                dead_letter_or_drop(ctx, channel, &delivery, &e).await;
            }
        }
    }
}

async fn ack(channel: &dyn BrokerChannel, delivery_tag: u64) {
    if let Err(e) = channel.ack(delivery_tag).await {
        warn!(error = %e, "ack failed");
    }
}

/// Terminal path for a delivery that exhausted its redeliveries (or can
/// never be decoded): route to the dead-letter exchange when configured,
/// otherwise drop with an error signal. Either way the original is acked
/// so the broker stops redelivering it.
async fn dead_letter_or_drop(
    ctx: &DispatchCtx,
    channel: &dyn BrokerChannel,
    delivery: &Delivery,
    cause: &PropagandaError,
) {
    let client_metrics = metrics::global_metrics();
    let envelope = &delivery.envelope;

    match &ctx.config.dead_letter_exchange {
        Some(dlx) => {
            let mut headers = envelope.headers.clone();
            headers.insert(
                "x-death-count".to_string(),
                (delivery.redelivered + 1).to_string(),
            );
            headers.insert("x-death-reason".to_string(), cause.to_string());

            let properties = PublishProperties {
                content_type: envelope.content_type.clone(),
                message_id: envelope.message_id.clone(),
                timestamp: envelope.timestamp,
                headers,
                persistent: true,
                confirm: false,
            };
            match channel
                .publish(dlx, &envelope.topic, envelope.payload.clone(), &properties)
                .await
            {
                Ok(()) => {
                    client_metrics.record_dead_letter();
                    info!(
                        topic = %envelope.topic,
                        message_id = %envelope.message_id,
                        exchange = %dlx,
                        "message dead-lettered"
                    );
                }
                Err(e) => {
                    client_metrics.record_drop();
                    error!(
                        topic = %envelope.topic,
                        message_id = %envelope.message_id,
                        error = %e,
                        "dead-letter publish failed, dropping message"
                    );
                }
            }
        }
        None => {
            client_metrics.record_drop();
            error!(
                topic = %envelope.topic,
                message_id = %envelope.message_id,
                error = %cause,
                "redelivery limit reached, dropping message"
            );
        }
    }

    ack(channel, delivery.delivery_tag).await;
}
