//! Topic subscriptions
//!
//! The monitor holds a single callback per direction. [`EventBus`] fans those
//! out to any number of listeners keyed by the topic names from
//! [`DeviceEvent::topics`], e.g. `add:1256:20539`, `remove:1256` or `change`.
//!
//! A subscription topic may use `*` for one `:`-separated segment, so
//! `add:*:20539` receives additions of product 20539 from any vendor and
//! `*:1256` receives every event family for vendor 1256.

use crate::dispatcher::panic_message;
use crate::monitor::DeviceMonitor;
use protocol::DeviceEvent;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{trace, warn};

/// Listener invoked with every event published on its topic
pub type Listener = Arc<dyn Fn(&DeviceEvent) + Send + Sync + 'static>;

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    topics: RwLock<BTreeMap<String, Vec<(SubscriptionId, Listener)>>>,
}

/// Many-listener event fan-out
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `topic`
    pub fn on<F>(&self, topic: impl Into<String>, listener: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a subscription; false if it was already gone
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut removed = false;
        topics.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Number of listeners on `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener of each of its topics
    ///
    /// Listeners of the most specific topic run first; for each topic, exact
    /// subscriptions run before wildcard ones. A listener runs once per
    /// event topic it matches. Returns the number of listener invocations.
    pub fn publish(&self, event: &DeviceEvent) -> usize {
        let listeners: Vec<Listener> = {
            let topics = self
                .inner
                .topics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut matched = Vec::new();
            for topic in event.topics() {
                if let Some(exact) = topics.get(&topic) {
                    matched.extend(exact.iter().map(|(_, listener)| Arc::clone(listener)));
                }
                for (pattern, subscribed) in topics.iter() {
                    if pattern.contains('*') && topic_matches(pattern, &topic) {
                        matched.extend(subscribed.iter().map(|(_, listener)| Arc::clone(listener)));
                    }
                }
            }
            matched
        };

        trace!("Publishing {} to {} listener(s)", event, listeners.len());
        for listener in &listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                warn!("Event listener panicked: {}", panic_message(&panic));
            }
        }
        listeners.len()
    }

    /// Route a monitor's added/removed callbacks into this bus
    ///
    /// Replaces any callbacks previously registered on the monitor.
    pub fn attach(&self, monitor: &DeviceMonitor) {
        let bus = self.clone();
        monitor.register_added(move |record| {
            bus.publish(&DeviceEvent::added(record.clone()));
        });

        let bus = self.clone();
        monitor.register_removed(move |record| {
            bus.publish(&DeviceEvent::removed(record.clone()));
        });
    }
}

/// Check a topic against a subscription pattern with `*` segments
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern = pattern.split(':');
    let mut topic = topic.split(':');
    loop {
        match (pattern.next(), topic.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) if p == "*" || p == t => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DeviceRecord;
    use std::sync::Mutex;

    fn collect(bus: &EventBus, topic: &str, seen: &Arc<Mutex<Vec<String>>>) -> SubscriptionId {
        let seen = Arc::clone(seen);
        let label = topic.to_string();
        bus.on(topic, move |_| seen.lock().unwrap().push(label.clone()))
    }

    #[test]
    fn test_publish_most_specific_first() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "change", &seen);
        collect(&bus, "add", &seen);
        collect(&bus, "add:1256:20539", &seen);
        collect(&bus, "remove", &seen);

        let event = DeviceEvent::added(DeviceRecord::with_ids(0x04e8, 0x503b));
        assert_eq!(bus.publish(&event), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["add:1256:20539", "add", "change"]
        );
    }

    #[test]
    fn test_off_unsubscribes() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = collect(&bus, "remove:1", &seen);
        assert_eq!(bus.listener_count("remove:1"), 1);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count("remove:1"), 0);

        bus.publish(&DeviceEvent::removed(DeviceRecord::with_ids(1, 2)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.on("insert", |_| panic!("listener failure"));
        collect(&bus, "change", &seen);

        bus.publish(&DeviceEvent::added(DeviceRecord::with_ids(1, 2)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("add:*:20539", "add:1256:20539"));
        assert!(topic_matches("*:1256", "remove:1256"));
        assert!(topic_matches("*", "change"));
        assert!(!topic_matches("add:*:20539", "add:1256:1"));
        assert!(!topic_matches("add:*", "add:1256:20539"));
        assert!(!topic_matches("add:*:*", "add:1256"));
    }

    #[test]
    fn test_wildcard_subscriptions() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "add:*:20539", &seen);
        collect(&bus, "*:1256", &seen);
        collect(&bus, "remove:*", &seen);

        let event = DeviceEvent::added(DeviceRecord::with_ids(0x04e8, 0x503b));
        assert_eq!(bus.publish(&event), 4);
        // add:1256, insert:1256 and change:1256 each match "*:1256"
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["add:*:20539", "*:1256", "*:1256", "*:1256"]
        );
    }
}
