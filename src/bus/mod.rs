//! TopicBus - Partitioned In-Process Pub/Sub
//!
//! ## Responsibilities
//!
//! - Named topics, optionally partitioned per camera (`"frames:cam-1"`)
//! - Non-blocking fan-out: a slow subscriber loses its oldest item,
//!   never stalls the publisher
//! - `fifo` and `latest` delivery modes
//! - Merged subscription over several topics
//!
//! One coarse mutex guards only the topic -> subscriber map; it is
//! never held across a suspension point. Receiving suspends on a
//! per-subscriber `Notify`.

use crate::model::{Detection, Frame, IncidentEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

/// Topic bases used by the pipeline
pub mod topics {
    /// Every decoded frame, native rate
    pub const FRAMES_RAW: &str = "frames_raw";
    /// Equal-time sampled frames
    pub const FRAMES: &str = "frames";
    /// Per-frame scoring results
    pub const DETECTION: &str = "detection";
    /// Incident open events
    pub const INCIDENT_OPEN: &str = "incident.open";
    /// Incident close events
    pub const INCIDENT_CLOSE: &str = "incident.close";
}

/// Partitioned topic name, e.g. `"frames_raw:cam-1"`
pub fn topic_for(base: &str, camera_id: &str) -> String {
    format!("{}:{}", base, camera_id)
}

/// Subscription delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Bounded queue; a full queue evicts its oldest entry
    Fifo,
    /// Capacity 1; every publish supersedes the previous unread item
    Latest,
}

/// Item carried on the bus
#[derive(Debug, Clone)]
pub enum BusMessage {
    Frame(Frame),
    Detection(Detection),
    Incident(IncidentEvent),
}

impl BusMessage {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_detection(self) -> Option<Detection> {
        match self {
            Self::Detection(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_incident(self) -> Option<IncidentEvent> {
        match self {
            Self::Incident(e) => Some(e),
            _ => None,
        }
    }
}

/// One subscriber's bounded queue
struct SubscriberQueue {
    mode: DeliveryMode,
    capacity: usize,
    items: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(mode: DeliveryMode, capacity: usize) -> Self {
        let capacity = match mode {
            DeliveryMode::Latest => 1,
            DeliveryMode::Fifo => capacity.max(1),
        };
        Self {
            mode,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    // A poisoned queue mutex cannot leave the deque inconsistent;
    // recover the guard instead of propagating the panic.
    fn lock(&self) -> MutexGuard<'_, VecDeque<BusMessage>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit an item, evicting as the mode requires. Never blocks.
    fn deliver(&self, item: BusMessage) {
        {
            let mut items = self.lock();
            match self.mode {
                DeliveryMode::Latest => {
                    items.clear();
                    items.push_back(item);
                }
                DeliveryMode::Fifo => {
                    if items.len() >= self.capacity {
                        items.pop_front();
                    }
                    items.push_back(item);
                }
            }
        }
        self.notify.notify_one();
    }

    async fn recv(&self) -> BusMessage {
        loop {
            // Register interest before checking so a concurrent
            // deliver cannot slip between check and await.
            let notified = self.notify.notified();
            if let Some(item) = self.lock().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    fn try_recv(&self) -> Option<BusMessage> {
        self.lock().pop_front()
    }
}

struct BusInner {
    topics: Mutex<HashMap<String, Vec<(u64, Arc<SubscriberQueue>)>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Arc<SubscriberQueue>)>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process pub/sub substrate. Cheap to clone; all clones share one
/// topic map.
#[derive(Clone)]
pub struct TopicBus {
    inner: Arc<BusInner>,
}

impl TopicBus {
    /// Create a new, empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an item to a topic. Never blocks, never fails; with no
    /// subscribers this is a no-op.
    pub fn publish(&self, topic: &str, item: BusMessage) {
        let subs: Vec<Arc<SubscriberQueue>> = {
            let topics = self.inner.lock_topics();
            match topics.get(topic) {
                Some(list) => list.iter().map(|(_, q)| q.clone()).collect(),
                None => return,
            }
        };
        let last = subs.len().saturating_sub(1);
        for (i, sub) in subs.iter().enumerate() {
            if i == last {
                // Hand the original to the final subscriber
                sub.deliver(item);
                return;
            }
            sub.deliver(item.clone());
        }
    }

    /// Publish to `"<base>:<camera_id>"`
    pub fn publish_partitioned(&self, base: &str, camera_id: &str, item: BusMessage) {
        self.publish(&topic_for(base, camera_id), item);
    }

    /// Subscribe to a single topic. Dropping the returned handle
    /// unsubscribes.
    pub fn subscribe(&self, topic: &str, mode: DeliveryMode, capacity: usize) -> Subscription {
        self.register(std::slice::from_ref(&topic.to_string()), mode, capacity)
    }

    /// Subscribe to several topics through one merged receive handle.
    /// One shared queue is registered under every topic, so the handle
    /// observes the union of their publishes.
    pub fn subscribe_many(
        &self,
        topics: &[String],
        mode: DeliveryMode,
        capacity: usize,
    ) -> Subscription {
        self.register(topics, mode, capacity)
    }

    fn register(&self, topics: &[String], mode: DeliveryMode, capacity: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(mode, capacity));
        {
            let mut map = self.inner.lock_topics();
            for topic in topics {
                map.entry(topic.clone())
                    .or_default()
                    .push((id, queue.clone()));
            }
        }
        tracing::debug!(id = id, topics = ?topics, "bus subscribe");
        Subscription {
            id,
            topics: topics.to_vec(),
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of subscribers currently attached to a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock_topics()
            .get(topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped receive handle; unsubscribes on drop
pub struct Subscription {
    id: u64,
    topics: Vec<String>,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Receive the next item, suspending until one is available
    pub async fn recv(&mut self) -> BusMessage {
        self.queue.recv().await
    }

    /// Take the next item if one is already queued
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.queue.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut map = inner.lock_topics();
        for topic in &self.topics {
            if let Some(list) = map.get_mut(topic) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    map.remove(topic);
                }
            }
        }
        tracing::debug!(id = self.id, topics = ?self.topics, "bus unsubscribe");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CloseReason, Incident};

    fn incident_msg(id: &str) -> BusMessage {
        let incident = Incident {
            id: id.to_string(),
            camera_id: "cam-1".into(),
            start_ts: 0.0,
            end_ts: 1.0,
            start_idx: 0,
            end_idx: 10,
            peak_confidence: 0.9,
            positive_frame_count: 5,
        };
        BusMessage::Incident(IncidentEvent::close(&incident, CloseReason::FlushOpen))
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = TopicBus::new();
        bus.publish("detection:cam-1", incident_msg("a"));
        assert_eq!(bus.subscriber_count("detection:cam-1"), 0);
    }

    #[tokio::test]
    async fn test_fifo_delivery_preserves_publish_order() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("t", DeliveryMode::Fifo, 8);
        for id in ["a", "b", "c"] {
            bus.publish("t", incident_msg(id));
        }
        for expected in ["a", "b", "c"] {
            let ev = sub.recv().await.into_incident().unwrap();
            assert_eq!(ev.incident_id(), expected);
        }
    }

    #[tokio::test]
    async fn test_full_fifo_evicts_oldest() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("t", DeliveryMode::Fifo, 2);
        for id in ["a", "b", "c", "d"] {
            bus.publish("t", incident_msg(id));
        }
        assert_eq!(
            sub.recv().await.into_incident().unwrap().incident_id(),
            "c"
        );
        assert_eq!(
            sub.recv().await.into_incident().unwrap().incident_id(),
            "d"
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_latest_mode_supersedes_unread_item() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("t", DeliveryMode::Latest, 64);
        for id in ["a", "b", "c"] {
            bus.publish("t", incident_msg(id));
        }
        assert_eq!(
            sub.recv().await.into_incident().unwrap().incident_id(),
            "c"
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_many_merges_topics() {
        let bus = TopicBus::new();
        let topics = vec!["a:cam-1".to_string(), "b:cam-1".to_string()];
        let mut sub = bus.subscribe_many(&topics, DeliveryMode::Fifo, 8);
        bus.publish("a:cam-1", incident_msg("x"));
        bus.publish("b:cam-1", incident_msg("y"));
        let mut seen = vec![
            sub.recv().await.into_incident().unwrap().incident_id().to_string(),
            sub.recv().await.into_incident().unwrap().incident_id().to_string(),
        ];
        seen.sort();
        assert_eq!(seen, ["x", "y"]);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = TopicBus::new();
        let sub = bus.subscribe("t", DeliveryMode::Fifo, 8);
        assert_eq!(bus.subscriber_count("t"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_later_publish() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("t", DeliveryMode::Fifo, 8);
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            publisher.publish("t", incident_msg("late"));
        });
        let ev = sub.recv().await.into_incident().unwrap();
        assert_eq!(ev.incident_id(), "late");
        handle.await.unwrap();
    }
}
