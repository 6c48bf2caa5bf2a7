//! Event history and internal fan-out.
//!
//! [`EventBus`] keeps a bounded buffer of recent events and delivers each
//! published event to the subscribers of its category. A failing or
//! panicking subscriber is logged and skipped; it never affects other
//! subscribers or the publisher.
//!
//! # Buffer bounds
//!
//! The buffer is allowed to grow past `hard_cap` by up to `margin` entries.
//! Once it exceeds `hard_cap + margin` the oldest entries are dropped until
//! `soft_cap` remain, so trimming happens in batches instead of on every
//! append.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::error::BoxError;
use crate::event::Event;

/// Subscriber callback.
pub type SubscriberFn = Arc<dyn Fn(&Arc<Event>) -> Result<(), BoxError> + Send + Sync>;

type SubscriberTable = RwLock<HashMap<String, Vec<(u64, SubscriberFn)>>>;

/// History buffer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Size the buffer is compacted back to.
    #[serde(default = "default_soft_cap")]
    pub soft_cap: usize,
    /// Nominal upper bound.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    /// How far past `hard_cap` the buffer may grow before compaction.
    #[serde(default = "default_margin")]
    pub margin: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            soft_cap: default_soft_cap(),
            hard_cap: default_hard_cap(),
            margin: default_margin(),
        }
    }
}

fn default_soft_cap() -> usize {
    500
}

fn default_hard_cap() -> usize {
    1000
}

fn default_margin() -> usize {
    100
}

struct Record {
    category: String,
    event: Arc<Event>,
}

/// Recent-event recorder with per-category subscribers.
pub struct EventBus {
    config: HistoryConfig,
    history: Mutex<VecDeque<Record>>,
    subscribers: Arc<SubscriberTable>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl EventBus {
    /// Creates a bus with the given history bounds.
    ///
    /// `soft_cap` is clamped to `hard_cap`.
    pub fn new(mut config: HistoryConfig) -> Self {
        config.soft_cap = config.soft_cap.min(config.hard_cap);
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends an event to the history buffer.
    pub fn record(&self, category: &str, event: Arc<Event>) {
        let mut history = self.history.lock();
        history.push_back(Record {
            category: category.to_string(),
            event,
        });
        if history.len() > self.config.hard_cap + self.config.margin {
            let excess = history.len() - self.config.soft_cap;
            history.drain(..excess);
            trace!(dropped = excess, "History compacted");
        }
    }

    /// Returns up to `limit` recorded events, newest first.
    ///
    /// `None` reads across every category.
    pub fn recent(&self, category: Option<&str>, limit: usize) -> Vec<Arc<Event>> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|r| category.is_none_or(|c| r.category == c))
            .take(limit)
            .map(|r| Arc::clone(&r.event))
            .collect()
    }

    /// Number of events currently held.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Registers a subscriber for `category`.
    pub fn subscribe<F>(&self, category: &str, callback: F) -> Subscription
    where
        F: Fn(&Arc<Event>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(category.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            table: Arc::downgrade(&self.subscribers),
            category: category.to_string(),
            id,
        }
    }

    /// Delivers `event` to every subscriber of `category`.
    ///
    /// Returns the number of subscribers that completed without error.
    pub fn publish(&self, category: &str, event: &Arc<Event>) -> usize {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<SubscriberFn> = self
            .subscribers
            .read()
            .get(category)
            .map(|subs| subs.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(category, event_id = %event.id, error = %e, "Subscriber failed");
                }
                Err(_) => {
                    error!(category, event_id = %event.id, "Subscriber panicked");
                }
            }
        }
        delivered
    }

    /// Records and publishes in one step.
    pub fn emit(&self, category: &str, event: Arc<Event>) -> usize {
        self.record(category, Arc::clone(&event));
        self.publish(category, &event)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("history_len", &self.history_len())
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    table: Weak<SubscriberTable>,
    category: String,
    id: u64,
}

impl Subscription {
    /// Removes the subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = table.write();
        let Some(subs) = table.get_mut(&self.category) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(id, _)| *id != self.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            table.remove(&self.category);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Category;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn event(id: &str) -> Arc<Event> {
        let mut e = Event::empty(Category::Message, Value::Null);
        e.id = id.to_string();
        Arc::new(e)
    }

    #[test]
    fn test_soft_cap_above_hard_cap_is_clamped() {
        let bus = EventBus::new(HistoryConfig {
            soft_cap: 10,
            hard_cap: 2,
            margin: 0,
        });
        for i in 0..3 {
            bus.record("message", event(&i.to_string()));
        }
        assert_eq!(bus.history_len(), 2);
        assert_eq!(bus.recent(None, 1)[0].id, "2");
    }

    #[test]
    fn test_compacts_to_soft_cap() {
        let bus = EventBus::new(HistoryConfig {
            soft_cap: 3,
            hard_cap: 5,
            margin: 2,
        });
        for i in 0..7 {
            bus.record("message", event(&i.to_string()));
        }
        assert_eq!(bus.history_len(), 7);

        bus.record("message", event("7"));
        assert_eq!(bus.history_len(), 3);
        let ids: Vec<String> = bus
            .recent(None, 10)
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["7", "6", "5"]);
    }

    #[test]
    fn test_recent_filters_category() {
        let bus = EventBus::default();
        bus.record("message", event("a"));
        bus.record("notice", event("b"));
        bus.record("message", event("c"));
        let ids: Vec<String> = bus
            .recent(Some("message"), 10)
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("message", |_| Err("boom".into()));
        bus.subscribe("message", |_| panic!("subscriber panic"));
        let h = Arc::clone(&hits);
        bus.subscribe("message", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish("message", &event("x")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.publish("notice", &event("y")), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.subscribe("message", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("message", event("1"));
        assert!(sub.unsubscribe());
        bus.emit("message", event("2"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history_len(), 2);
    }
}
