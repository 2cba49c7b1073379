//! Per-subscriber bounded queue and filter.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::fanout::frame::{LiveEvent, StreamFrame};
use crate::storage::stringify;

/// What a subscriber wants to see.
///
/// Keys other than `node` and `incident_only` are equality checks against
/// the published event's attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub incident_only: bool,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl SubscriptionFilter {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            node: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn incidents() -> Self {
        Self {
            incident_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &LiveEvent) -> bool {
        if self.incident_only && !event.is_incident {
            return false;
        }
        if let Some(node) = &self.node
            && event.node.as_deref() != Some(node.as_str())
        {
            return false;
        }
        self.fields.iter().all(|(key, expected)| {
            event
                .attributes
                .get(key)
                .is_some_and(|actual| stringify(actual) == stringify(expected))
        })
    }
}

/// Bounded outbound queue of one subscriber.
///
/// When full, the oldest frame is dropped to make room.
pub(crate) struct Subscriber {
    pub(crate) filter: SubscriptionFilter,
    queue: Mutex<VecDeque<StreamFrame>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    task: Mutex<Option<AbortHandle>>,
}

impl Subscriber {
    pub(crate) fn new(filter: SubscriptionFilter, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            filter,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Enqueue a frame. Returns `true` if an older frame was evicted.
    pub(crate) fn push(&self, frame: StreamFrame) -> bool {
        let evicted = match self.queue.lock() {
            Ok(mut queue) => {
                let evicted = if queue.len() >= self.capacity {
                    queue.pop_front().is_some()
                } else {
                    false
                };
                queue.push_back(frame);
                evicted
            }
            Err(_) => return false,
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub(crate) fn pop(&self) -> Option<StreamFrame> {
        self.queue.lock().ok()?.pop_front()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub(crate) fn snapshot(&self) -> Vec<StreamFrame> {
        self.queue
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn set_task(&self, handle: AbortHandle) {
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Cancel the sender loop, if it is still running.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.task.lock().ok().and_then(|mut t| t.take()) {
            handle.abort();
        }
    }
}

/// Handle returned by `subscribe`.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub tenant_id: String,
    pub(crate) subscriber: Arc<Subscriber>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// Frames waiting to be sent.
    pub fn queue_len(&self) -> usize {
        self.subscriber.len()
    }

    /// Frames evicted by backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped()
    }

    /// Copy of the queued frames, oldest first.
    pub fn queued(&self) -> Vec<StreamFrame> {
        self.subscriber.snapshot()
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.subscriber.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::frame::FrameType;
    use serde_json::{Map, json};

    fn frame(n: u64) -> StreamFrame {
        StreamFrame::new(FrameType::ExecutionGraph, json!({ "n": n }))
    }

    fn live(node: Option<&str>, incident: bool, attrs: Value) -> LiveEvent {
        LiveEvent {
            frame: frame(0),
            node: node.map(str::to_string),
            is_incident: incident,
            attributes: attrs.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let sub = Subscriber::new(SubscriptionFilter::default(), 3);
        for n in 0..5 {
            sub.push(frame(n));
        }
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.dropped(), 2);
        let kept: Vec<_> = sub.snapshot().iter().map(|f| f.payload["n"].clone()).collect();
        assert_eq!(kept, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(sub.pop().unwrap().payload["n"], 2);
    }

    #[test]
    fn test_filter_node_and_incident_only() {
        let by_node = SubscriptionFilter::node("X");
        assert!(by_node.matches(&live(Some("X"), false, json!({}))));
        assert!(!by_node.matches(&live(Some("Y"), false, json!({}))));
        assert!(!by_node.matches(&live(None, false, json!({}))));

        let incidents = SubscriptionFilter::incidents();
        assert!(incidents.matches(&live(None, true, json!({}))));
        assert!(!incidents.matches(&live(None, false, json!({}))));
    }

    #[test]
    fn test_filter_arbitrary_fields_from_json() {
        let filter: SubscriptionFilter =
            serde_json::from_value(json!({"node": "X", "status": "FAILED", "retries": 2})).unwrap();
        assert_eq!(filter.node.as_deref(), Some("X"));
        assert_eq!(filter.fields.len(), 2);
        assert!(filter.matches(&live(Some("X"), false, json!({"status": "FAILED", "retries": 2}))));
        assert!(!filter.matches(&live(Some("X"), false, json!({"status": "OK", "retries": 2}))));
        assert!(!filter.matches(&live(Some("X"), false, json!({"status": "FAILED"}))));
    }
}
