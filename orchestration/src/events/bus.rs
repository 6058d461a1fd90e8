//! Event bus for orchestration
//!
//! A single bounded queue feeds one dispatch loop. Producers only ever
//! enqueue (`emit` never blocks); the loop is the only consumer and fans
//! each event out to every matching handler concurrently.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{Event, Payload};

/// Default queue capacity before `emit` reports backpressure.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event queue full ({capacity} events), rejected event: {topic}")]
    QueueFull { topic: String, capacity: usize },

    #[error("Event bus stopped, rejected event: {topic}")]
    Stopped { topic: String },
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Queue capacity; `emit` fails fast once it is reached.
    pub max_queue_size: usize,
    /// Per-handler time budget for one event.
    pub handler_timeout_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            handler_timeout_secs: 30,
        }
    }
}

/// Subscriber callback.
///
/// Errors are logged by the dispatch loop and never reach the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Topic → handlers table. Patterns ending in `.*` live in `wildcard`
/// keyed by their prefix (including the trailing dot).
#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Subscription>>,
    wildcard: HashMap<String, Vec<Subscription>>,
}

impl Registry {
    fn slot(&mut self, pattern: &str) -> &mut Vec<Subscription> {
        match wildcard_prefix(pattern) {
            Some(prefix) => self.wildcard.entry(prefix.to_string()).or_default(),
            None => self.exact.entry(pattern.to_string()).or_default(),
        }
    }

    fn remove(&mut self, pattern: &str, id: SubscriptionId) -> bool {
        let (map, key) = match wildcard_prefix(pattern) {
            Some(prefix) => (&mut self.wildcard, prefix),
            None => (&mut self.exact, pattern),
        };
        let Some(subs) = map.get_mut(key) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            map.remove(key);
        }
        removed
    }

    fn matching(&self, topic: &str) -> Vec<(SubscriptionId, Arc<dyn EventHandler>)> {
        let exact = self.exact.get(topic).into_iter().flatten();
        let wildcard = self
            .wildcard
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .flat_map(|(_, subs)| subs);
        exact
            .chain(wildcard)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect()
    }

    fn counts(&self) -> BTreeMap<String, usize> {
        let exact = self.exact.iter().map(|(t, s)| (t.clone(), s.len()));
        let wildcard = self
            .wildcard
            .iter()
            .map(|(p, s)| (format!("{p}*"), s.len()));
        exact.chain(wildcard).collect()
    }
}

fn wildcard_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*').filter(|p| p.ends_with('.'))
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub running: bool,
    pub subscribers: BTreeMap<String, usize>,
}

/// Bounded publish/subscribe bus with an isolated dispatch loop.
pub struct EventBus {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    handler_timeout: Duration,
}

impl EventBus {
    /// Create a bus with the given queue capacity and default handler timeout.
    pub fn new(max_queue_size: usize) -> Self {
        Self::with_config(&EventBusConfig {
            max_queue_size,
            ..EventBusConfig::default()
        })
    }

    /// Create a bus from configuration.
    pub fn with_config(config: &EventBusConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            handler_timeout: Duration::from_secs(config.handler_timeout_secs.max(1)),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Enqueue an event without blocking.
    ///
    /// Fails with [`EventBusError::QueueFull`] when the queue is saturated;
    /// the caller owns any backoff.
    pub fn emit(&self, topic: impl Into<String>, payload: Payload) -> EventBusResult<()> {
        let topic = topic.into();
        if self.stopped.load(Ordering::Acquire) {
            return Err(EventBusError::Stopped { topic });
        }
        match self.sender.try_send(Event::new(topic, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                error!(topic = %event.topic, "Event queue full, rejecting event");
                Err(EventBusError::QueueFull {
                    topic: event.topic,
                    capacity: self.sender.max_capacity(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                Err(EventBusError::Stopped { topic: event.topic })
            }
        }
    }

    /// Register a handler for a topic, or for a `prefix.*` pattern.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(topic)
            .push(Subscription { id, handler });
        info!(topic, subscription = %id, "Handler subscribed");
        id
    }

    /// Remove one handler. Returns false if it was not registered on `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic, id);
        if removed {
            info!(topic, subscription = %id, "Handler unsubscribed");
        }
        removed
    }

    /// Spawn the dispatch loop. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            warn!("Event bus already running or stopped");
            return;
        };

        self.running.store(true, Ordering::Release);
        let handle = tokio::spawn(dispatch_loop(
            receiver,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.handler_timeout,
            Arc::clone(&self.running),
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Event bus started");
    }

    /// Stop the dispatch loop.
    ///
    /// The event being dispatched finishes; events still queued are dropped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        // Never started: drop the queue directly.
        let idle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut receiver) = idle {
            receiver.close();
        }

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Event dispatch loop terminated abnormally");
            }
        }
        self.running.store(false, Ordering::Release);
        info!("Event bus stopped");
    }

    /// Whether the dispatch loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue depth, capacity, and subscriber counts.
    pub fn stats(&self) -> BusStats {
        let max_queue_size = self.sender.max_capacity();
        BusStats {
            queue_size: max_queue_size - self.sender.capacity(),
            max_queue_size,
            running: self.is_running(),
            subscribers: self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .counts(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<Event>,
    registry: Arc<RwLock<Registry>>,
    shutdown: CancellationToken,
    handler_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            next = receiver.recv() => match next {
                Some(event) => dispatch(&registry, event, handler_timeout).await,
                None => break,
            },
        }
    }

    receiver.close();
    let mut dropped = 0usize;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped, "Dropped queued events on shutdown");
    }
    running.store(false, Ordering::Release);
}

async fn dispatch(registry: &RwLock<Registry>, event: Event, handler_timeout: Duration) {
    let handlers = registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .matching(&event.topic);

    if handlers.is_empty() {
        debug!(topic = %event.topic, "No subscribers for event");
        return;
    }

    debug!(topic = %event.topic, handlers = handlers.len(), "Dispatching event");
    let calls = handlers
        .iter()
        .map(|(id, handler)| invoke(*id, handler.as_ref(), &event, handler_timeout));
    join_all(calls).await;
}

async fn invoke(id: SubscriptionId, handler: &dyn EventHandler, event: &Event, limit: Duration) {
    let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            error!(topic = %event.topic, subscription = %id, error = %e, "Handler failed");
        }
        Ok(Err(_)) => {
            error!(topic = %event.topic, subscription = %id, "Handler panicked");
        }
        Err(_) => {
            warn!(
                topic = %event.topic,
                subscription = %id,
                timeout_ms = limit.as_millis() as u64,
                "Handler timed out"
            );
        }
    }
}
