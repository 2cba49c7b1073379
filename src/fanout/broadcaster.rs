//! Tenant-scoped fan-out to live subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use uuid::Uuid;

use crate::fanout::frame::{FrameSink, LiveEvent, SinkError, StreamFrame};
use crate::fanout::subscriber::{Subscriber, SubscriptionFilter, SubscriptionHandle};
use crate::task::TaskRegistry;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Interval between heartbeats on an otherwise idle connection.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Upper bound for one transport send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_send_timeout() -> Duration {
    DEFAULT_SEND_TIMEOUT
}

/// Broadcaster settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

type Registry = HashMap<String, HashMap<Uuid, Arc<Subscriber>>>;

struct Inner {
    config: FanoutConfig,
    registry: Mutex<Registry>,
    tasks: TaskRegistry,
    closed: AtomicBool,
}

impl Inner {
    /// Remove a subscriber from the registry without touching its task.
    fn detach(&self, tenant_id: &str, id: Uuid) -> Option<Arc<Subscriber>> {
        let mut registry = self.registry.lock().ok()?;
        let tenant = registry.get_mut(tenant_id)?;
        let removed = tenant.remove(&id);
        if tenant.is_empty() {
            registry.remove(tenant_id);
        }
        removed
    }
}

/// Fans published events out to per-subscriber bounded queues.
///
/// Each subscriber gets a dedicated sender loop that drains its queue into
/// a [`FrameSink`] and emits heartbeats. A failed or timed-out send tears
/// the subscriber down.
#[derive(Clone)]
pub struct FanoutBroadcaster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FanoutBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutBroadcaster")
            .field("config", &self.inner.config)
            .field("subscribers", &self.total_subscribers())
            .finish_non_exhaustive()
    }
}

impl Default for FanoutBroadcaster {
    fn default() -> Self {
        Self::new(FanoutConfig::default())
    }
}

impl FanoutBroadcaster {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                tasks: TaskRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    /// Register a subscriber and start its sender loop.
    pub fn subscribe(
        &self,
        tenant_id: &str,
        filter: SubscriptionFilter,
        sink: Arc<dyn FrameSink>,
    ) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let subscriber = Arc::new(Subscriber::new(filter, self.inner.config.queue_capacity));

        if !self.inner.closed.load(Ordering::Acquire) {
            if let Ok(mut registry) = self.inner.registry.lock() {
                registry
                    .entry(tenant_id.to_string())
                    .or_default()
                    .insert(id, Arc::clone(&subscriber));
            }

            let sender = run_sender(
                Arc::downgrade(&self.inner),
                tenant_id.to_string(),
                id,
                Arc::clone(&subscriber),
                sink,
                self.inner.config.heartbeat_interval,
                self.inner.config.send_timeout,
            );
            if let Some(handle) = self.inner.tasks.spawn("fanout-sender", sender) {
                subscriber.set_task(handle);
            }
            tracing::debug!(tenant_id, subscription = %id, "Subscriber registered");
        }

        SubscriptionHandle {
            id,
            tenant_id: tenant_id.to_string(),
            subscriber,
        }
    }

    /// Enqueue an event for every matching subscriber of `tenant_id`.
    ///
    /// Never blocks. Returns the number of subscribers the event was
    /// queued for.
    pub fn publish(&self, tenant_id: &str, event: &LiveEvent) -> usize {
        let targets: Vec<(Uuid, Arc<Subscriber>)> = match self.inner.registry.lock() {
            Ok(registry) => match registry.get(tenant_id) {
                Some(subs) => subs
                    .iter()
                    .filter(|(_, sub)| sub.filter.matches(event))
                    .map(|(id, sub)| (*id, Arc::clone(sub)))
                    .collect(),
                None => return 0,
            },
            Err(_) => return 0,
        };

        for (id, subscriber) in &targets {
            if subscriber.push(event.frame.clone()) {
                tracing::warn!(
                    tenant_id,
                    subscription = %id,
                    dropped = subscriber.dropped(),
                    "Subscriber queue full, dropped oldest frame"
                );
            }
        }
        targets.len()
    }

    /// Remove a subscriber and cancel its sender loop. Idempotent.
    pub fn unsubscribe(&self, tenant_id: &str, id: Uuid) -> bool {
        match self.inner.detach(tenant_id, id) {
            Some(subscriber) => {
                subscriber.abort();
                tracing::debug!(tenant_id, subscription = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, tenant_id: &str) -> usize {
        self.inner
            .registry
            .lock()
            .map(|r| r.get(tenant_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner
            .registry
            .lock()
            .map(|r| r.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    /// Tear down every subscriber and cancel all sender loops.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let subscribers: Vec<Arc<Subscriber>> = match self.inner.registry.lock() {
            Ok(mut registry) => registry
                .drain()
                .flat_map(|(_, subs)| subs.into_values())
                .collect(),
            Err(_) => Vec::new(),
        };
        let count = subscribers.len();
        for subscriber in subscribers {
            subscriber.abort();
        }
        self.inner.tasks.shutdown(Duration::ZERO).await;
        tracing::info!(subscribers = count, "Fanout broadcaster shutdown complete");
    }
}

async fn send_frame(
    sink: &dyn FrameSink,
    frame: &StreamFrame,
    send_timeout: Duration,
) -> Result<(), SinkError> {
    timeout(send_timeout, sink.send(frame))
        .await
        .map_err(|_| SinkError::Timeout)?
}

async fn run_sender(
    broadcaster: Weak<Inner>,
    tenant_id: String,
    id: Uuid,
    subscriber: Arc<Subscriber>,
    sink: Arc<dyn FrameSink>,
    heartbeat: Duration,
    send_timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let error = 'outer: loop {
        while let Some(frame) = subscriber.pop() {
            if let Err(e) = send_frame(sink.as_ref(), &frame, send_timeout).await {
                break 'outer e;
            }
        }

        tokio::select! {
            _ = subscriber.notified() => {}
            _ = ticker.tick() => {
                if let Err(e) = send_frame(sink.as_ref(), &StreamFrame::heartbeat(), send_timeout).await {
                    break 'outer e;
                }
            }
        }
    };

    tracing::info!(
        tenant_id = %tenant_id,
        subscription = %id,
        error = %error,
        "Subscriber send failed, tearing down"
    );
    if let Some(inner) = broadcaster.upgrade() {
        inner.detach(&tenant_id, id);
    }
    if timeout(send_timeout, sink.close()).await.is_err() {
        tracing::debug!(tenant_id = %tenant_id, subscription = %id, "Subscriber close timed out");
    }
}
