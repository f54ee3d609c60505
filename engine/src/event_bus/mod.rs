//! Event bus for in-project agent coordination
//!
//! Each project owns one `EventBus`. Publishing appends to a fixed-capacity
//! ring buffer (oldest evicted first) and fans the event out to callback
//! subscribers and to bounded watcher channels used by front-ends. Nothing
//! here touches the disk; the audit log is the durable record.
//!
//! Subscriber callbacks run synchronously inside `publish`, after the buffer
//! lock has been released but under a delivery lock, so every subscriber and
//! watcher sees events in `seq` order even with concurrent publishers. A
//! callback must not publish on the bus that invoked it. A panicking
//! callback is logged and isolated, the publisher never sees it.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sdk::types::Recipient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default ring buffer capacity
pub const DEFAULT_CAPACITY: usize = 100;

/// Buffer size of each watcher channel
const WATCH_BUFFER_SIZE: usize = 100;

/// Well-known event types.
pub mod kinds {
    pub const FEEDBACK: &str = "feedback";
    pub const CRITIQUE: &str = "critique";
    pub const HANDOFF: &str = "handoff";
    pub const CANON_UPDATE: &str = "canon_update";
    pub const PIPELINE_STATUS: &str = "pipeline_status";
}

/// Immutable coordination message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Position in this bus instance's publish order
    pub seq: u64,
    pub project: String,
    pub sender: String,
    pub recipient: Recipient,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Convenience accessor for string payload fields.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Callback invoked for each event addressed to the subscribing agent
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-project publish/subscribe channel with bounded history
pub struct EventBus {
    /// Identifies this instance; sequence numbers restart with every new bus
    instance: Uuid,
    project: String,
    capacity: usize,
    next_seq: AtomicU64,
    /// Held from seq assignment until dispatch finishes
    delivery: Mutex<()>,
    buffer: Mutex<VecDeque<Event>>,
    subscribers: Mutex<HashMap<String, Vec<Callback>>>,
    watchers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    /// Create a bus with the default capacity of 100 events
    pub fn new(project: impl Into<String>) -> Self {
        Self::with_capacity(project, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(project: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            instance: Uuid::new_v4(),
            project: project.into(),
            capacity,
            next_seq: AtomicU64::new(0),
            delivery: Mutex::new(()),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            subscribers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event and return it.
    ///
    /// Never blocks on I/O. Watchers whose channel is full miss the event;
    /// closed watchers are dropped.
    pub fn publish(
        &self,
        sender: &str,
        recipient: Recipient,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Event {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let event = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let event = Event {
                id: Uuid::new_v4(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                project: self.project.clone(),
                sender: sender.to_string(),
                recipient,
                event_type: event_type.to_string(),
                payload,
                timestamp: Utc::now(),
            };
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
            event
        };

        debug!(
            project = %self.project,
            sender = %event.sender,
            recipient = %event.recipient,
            event_type = %event.event_type,
            seq = event.seq,
            "Event published"
        );

        self.dispatch(&event);
        event
    }

    fn dispatch(&self, event: &Event) {
        let callbacks: Vec<Callback> = {
            let subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|(agent, _)| event.recipient.reaches(agent))
                .flat_map(|(_, list)| list.iter().map(Arc::clone))
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    project = %self.project,
                    event_type = %event.event_type,
                    seq = event.seq,
                    "Event subscriber panicked; continuing"
                );
            }
        }

        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Register a callback for events addressed to `agent` or broadcast.
    ///
    /// Any number of callbacks may be registered under the same name.
    pub fn subscribe(&self, agent: &str, callback: Callback) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers
            .entry(agent.to_string())
            .or_default()
            .push(callback);
    }

    /// Bounded live feed of every event, for UI polling loops.
    pub fn watch(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER_SIZE);
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Up to `limit` most recent events addressed to `agent` or broadcast,
    /// oldest first.
    pub fn get_recent(&self, agent: &str, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut recent: Vec<Event> = buffer
            .iter()
            .rev()
            .filter(|e| e.recipient.reaches(agent))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Up to `limit` most recent events regardless of recipient, oldest first.
    pub fn recent_all(&self, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = buffer.len().saturating_sub(limit);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Buffered events with `seq` strictly greater than `after`, oldest first.
    pub fn events_after(&self, after: Option<u64>) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer
            .iter()
            .filter(|e| after.map_or(true, |s| e.seq > s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_returns_event() {
        let bus = EventBus::new("demo");
        let event = bus.publish(
            "plot_architect",
            Recipient::agent("worldbuilder"),
            kinds::HANDOFF,
            json!({"outline": "..."}),
        );
        assert_eq!(event.project, "demo");
        assert_eq!(event.seq, 0);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let bus = EventBus::with_capacity("demo", 3);
        for i in 0..5 {
            bus.publish("ui", Recipient::Broadcast, "tick", json!({ "i": i }));
        }
        let recent = bus.get_recent("anyone", 10);
        let seqs: Vec<u64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_get_recent_filters_by_recipient() {
        let bus = EventBus::new("demo");
        bus.publish("ui", Recipient::agent("editor_agent"), "feedback", json!({}));
        bus.publish("ui", Recipient::agent("scene_generator"), "feedback", json!({"n": 1}));
        bus.publish("ui", Recipient::Broadcast, "notice", json!({}));
        bus.publish("ui", Recipient::agent("scene_generator"), "feedback", json!({"n": 2}));

        let recent = bus.get_recent("scene_generator", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "notice");
        assert_eq!(recent[1].payload, json!({"n": 2}));
    }

    #[test]
    fn test_subscriber_panic_is_isolated() {
        let bus = EventBus::new("demo");
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("editor_agent", Arc::new(|_| panic!("boom")));
        let counter = Arc::clone(&hits);
        bus.subscribe(
            "editor_agent",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("ui", Recipient::agent("editor_agent"), "feedback", json!({}));
        bus.publish("ui", Recipient::agent("worldbuilder"), "feedback", json!({}));
        bus.publish("ui", Recipient::Broadcast, "notice", json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn test_subscriber_sees_publish_order() {
        let bus = EventBus::new("demo");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "scene_generator",
            Arc::new(move |e| sink.lock().unwrap().push(e.seq)),
        );
        for _ in 0..5 {
            bus.publish("ui", Recipient::agent("scene_generator"), "feedback", json!({}));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_concurrent_publishers_deliver_in_seq_order() {
        let bus = Arc::new(EventBus::with_capacity("demo", 16));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "scene_generator",
            Arc::new(move |e| sink.lock().unwrap().push(e.seq)),
        );

        let publishers: Vec<_> = (0..4)
            .map(|_| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        bus.publish("ui", Recipient::Broadcast, "tick", json!({}));
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_watch_receives_events() {
        let bus = EventBus::new("demo");
        let mut rx = bus.watch();
        bus.publish("ui", Recipient::Broadcast, "notice", json!({"x": 1}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload, json!({"x": 1}));
    }

    #[test]
    fn test_events_after_watermark() {
        let bus = EventBus::new("demo");
        for _ in 0..4 {
            bus.publish("a", Recipient::Broadcast, "x", json!({}));
        }
        assert_eq!(bus.events_after(None).len(), 4);
        let later = bus.events_after(Some(1));
        assert_eq!(later.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
    }
}
