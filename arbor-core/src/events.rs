//! Instance lifecycle and transition notifications.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AutomatonEvent {
    Created {
        instance: String,
    },
    Destroyed {
        instance: String,
    },
    /// `from` and `to` are persistent ids.
    Transitioned {
        instance: String,
        from: String,
        to: String,
        transition: String,
    },
    Loaded {
        instance: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Destroyed,
    Transitioned,
    Loaded,
}

impl AutomatonEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AutomatonEvent::Created { .. } => EventKind::Created,
            AutomatonEvent::Destroyed { .. } => EventKind::Destroyed,
            AutomatonEvent::Transitioned { .. } => EventKind::Transitioned,
            AutomatonEvent::Loaded { .. } => EventKind::Loaded,
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            AutomatonEvent::Created { instance }
            | AutomatonEvent::Destroyed { instance }
            | AutomatonEvent::Transitioned { instance, .. }
            | AutomatonEvent::Loaded { instance } => instance,
        }
    }
}

/// An event as delivered, with its bus sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AutomatonEvent,
}

/// Subscription filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for these instances (empty = all).
    pub instances: Vec<String>,
    /// Only these event kinds (empty = all).
    pub kinds: Vec<EventKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn instance(name: impl Into<String>) -> Self {
        Self {
            instances: vec![name.into()],
            kinds: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Returns true if the event matches this filter.
    pub fn matches(&self, event: &AutomatonEvent) -> bool {
        (self.instances.is_empty() || self.instances.iter().any(|i| i == event.instance()))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind()))
    }
}

type Registry = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    filter: EventFilter,
    receiver: broadcast::Receiver<EventRecord>,
    closed: Arc<AtomicBool>,
    registry: Registry,
}

impl Subscription {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// True once the bus has unsubscribed this subscription.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the next matching event without blocking. Events lost to a
    /// full channel are skipped with a warning. A closed subscription
    /// yields nothing, including events queued before it was closed.
    pub fn try_next(&mut self) -> Option<EventRecord> {
        if self.is_closed() {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(record) if self.filter.matches(&record.event) => return Some(record),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(subscription = %self.id, missed, "subscriber lagged; events dropped");
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains every matching event currently queued.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Broadcasts events to subscribers and keeps a bounded history.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
    history: VecDeque<EventRecord>,
    history_len: usize,
    subscriptions: Registry,
    sequence: u64,
}

impl EventBus {
    pub fn new(channel_capacity: usize, history_len: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            history: VecDeque::with_capacity(history_len.min(1024)),
            history_len,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            sequence: 0,
        }
    }

    pub fn subscribe(&mut self, filter: EventFilter) -> Subscription {
        let id = format!("sub-{}", uuid::Uuid::new_v4());
        let closed = Arc::new(AtomicBool::new(false));
        self.subscriptions.lock().insert(id.clone(), Arc::clone(&closed));
        Subscription {
            id,
            filter,
            receiver: self.sender.subscribe(),
            closed,
            registry: Arc::clone(&self.subscriptions),
        }
    }

    /// Closes the subscription so it receives nothing further. Returns true
    /// if it was found.
    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        match self.subscriptions.lock().remove(subscription_id) {
            Some(closed) => {
                closed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn publish(&mut self, event: AutomatonEvent) -> u64 {
        self.sequence += 1;
        let record = EventRecord {
            sequence: self.sequence,
            at: Utc::now(),
            event,
        };

        if self.history_len > 0 {
            while self.history.len() >= self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(record.clone());
        }

        // No receivers is not an error.
        let _ = self.sender.send(record);
        self.sequence
    }

    /// Events still in the history ring, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &EventRecord> {
        self.history.iter()
    }

    pub fn history_matching<'a>(&'a self, filter: &'a EventFilter) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.history.iter().filter(move |r| filter.matches(&r.event))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024, 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(name: &str) -> AutomatonEvent {
        AutomatonEvent::Created {
            instance: name.to_string(),
        }
    }

    #[test]
    fn test_filtered_subscription() {
        let mut bus = EventBus::default();
        let mut all = bus.subscribe(EventFilter::all());
        let mut only_b = bus.subscribe(EventFilter::instance("b").with_kind(EventKind::Destroyed));

        bus.publish(created("a"));
        bus.publish(created("b"));
        bus.publish(AutomatonEvent::Destroyed {
            instance: "b".into(),
        });

        assert_eq!(all.drain().len(), 3);
        let got = only_b.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sequence, 3);
        assert!(only_b.try_next().is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut bus = EventBus::new(16, 2);
        for name in ["a", "b", "c"] {
            bus.publish(created(name));
        }
        let names: Vec<&str> = bus.history().map(|r| r.event.instance()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_lagged_subscriber_recovers() {
        let mut bus = EventBus::new(2, 0);
        let mut sub = bus.subscribe(EventFilter::all());
        for name in ["a", "b", "c", "d"] {
            bus.publish(created(name));
        }
        let got: Vec<String> = sub.drain().into_iter().map(|r| r.event.instance().to_string()).collect();
        assert_eq!(got, vec!["c", "d"]);
    }

    #[test]
    fn test_subscription_ids() {
        let mut bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        assert!(sub.id.starts_with("sub-"));
        assert_eq!(bus.subscription_count(), 1);
        assert!(bus.unsubscribe(&sub.id));
        assert!(!bus.unsubscribe(&sub.id));
    }

    #[test]
    fn test_unsubscribed_receives_nothing() {
        let mut bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::all());
        let mut other = bus.subscribe(EventFilter::all());
        bus.publish(created("a"));

        assert!(bus.unsubscribe(&sub.id));
        assert!(sub.is_closed());
        bus.publish(created("b"));
        assert!(sub.try_next().is_none());
        assert!(sub.drain().is_empty());
        assert_eq!(other.drain().len(), 2);
        assert!(!other.is_closed());
    }

    #[test]
    fn test_dropped_subscription_is_removed() {
        let mut bus = EventBus::default();
        let kept = bus.subscribe(EventFilter::all());
        let dropped = bus.subscribe(EventFilter::all());
        let id = dropped.id.clone();
        assert_eq!(bus.subscription_count(), 2);

        drop(dropped);
        assert_eq!(bus.subscription_count(), 1);
        assert!(!bus.unsubscribe(&id));

        assert!(bus.unsubscribe(&kept.id));
        drop(kept);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(AutomatonEvent::Transitioned {
            instance: "p".into(),
            from: "S".into(),
            to: "S/A".into(),
            transition: "go".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "transitioned");
        assert_eq!(json["to"], "S/A");
    }
}
