//! Pending multi-turn continuations.
//!
//! A handler that expects a follow-up message ("reply with a number") stores
//! a [`Continuation`] for the sender's session. On the next event from that
//! session the router hands the continuation back to the plugin before any
//! rule is tried. Continuations expire on their own TTL and are consumed
//! when taken.

use std::time::Duration;

use serde_json::Value;

use sinter_core::{Event, ExpiringMap};

/// A pending handler invocation for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    /// Plugin handler to run.
    pub handler: String,
    /// Data stored by the handler that set the continuation.
    pub data: Value,
}

/// `(plugin key, session, handler)`
type ContextKey = (String, String, String);

/// Continuations keyed by plugin and session.
#[derive(Debug, Default)]
pub struct ContextStore {
    entries: ExpiringMap<ContextKey, Continuation>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session key of `event`: `bot:group:user`, with an empty
    /// group outside groups.
    pub fn session(event: &Event) -> String {
        format!(
            "{}:{}:{}",
            event.bot_id,
            event.group_id.as_deref().unwrap_or_default(),
            event.user_id.as_deref().unwrap_or_default()
        )
    }

    /// Stores a continuation for `plugin` in the session of `event`.
    ///
    /// Replaces any pending continuation for the same handler.
    pub fn set(&self, plugin: &str, event: &Event, continuation: Continuation, ttl: Duration) {
        let key = (
            plugin.to_string(),
            Self::session(event),
            continuation.handler.clone(),
        );
        self.entries.insert(key, continuation, ttl);
    }

    /// Removes and returns every live continuation for `plugin` in the
    /// session of `event`, ordered by handler name.
    pub fn take(&self, plugin: &str, event: &Event) -> Vec<Continuation> {
        let session = Self::session(event);
        let mut live = self
            .entries
            .collect(|(p, s, _)| p == plugin && *s == session);
        live.sort_by(|a, b| a.0.2.cmp(&b.0.2));
        live.into_iter()
            .filter_map(|(key, _)| self.entries.remove(&key))
            .collect()
    }

    /// Returns `true` if `plugin` has a live continuation in the session.
    pub fn has_pending(&self, plugin: &str, event: &Event) -> bool {
        let session = Self::session(event);
        !self
            .entries
            .collect(|(p, s, _)| p == plugin && *s == session)
            .is_empty()
    }

    /// Drops the continuation for `handler`, returning whether one was live.
    pub fn clear(&self, plugin: &str, event: &Event, handler: &str) -> bool {
        let key = (
            plugin.to_string(),
            Self::session(event),
            handler.to_string(),
        );
        self.entries.remove(&key).is_some()
    }

    /// Drops every continuation owned by `plugin`.
    pub fn clear_plugin(&self, plugin: &str) -> usize {
        self.entries
            .collect(|(p, _, _)| p == plugin)
            .into_iter()
            .filter(|(key, _)| self.entries.remove(key).is_some())
            .count()
    }

    /// Sweeps expired continuations.
    pub fn compact(&self) -> usize {
        self.entries.compact()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sinter_core::Category;

    fn event(user: &str) -> Event {
        let mut e = Event::empty(Category::Message, Value::Null);
        e.bot_id = "bot".into();
        e.user_id = Some(user.into());
        e.group_id = Some("g1".into());
        e
    }

    fn cont(handler: &str) -> Continuation {
        Continuation {
            handler: handler.into(),
            data: json!({ "step": 1 }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_consumes() {
        let store = ContextStore::new();
        store.set("quiz", &event("u1"), cont("answer"), Duration::from_secs(30));
        assert!(store.has_pending("quiz", &event("u1")));
        assert!(!store.has_pending("quiz", &event("u2")));
        assert!(!store.has_pending("other", &event("u1")));

        let taken = store.take("quiz", &event("u1"));
        assert_eq!(taken, vec![cont("answer")]);
        assert!(store.take("quiz", &event("u1")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_expires() {
        let store = ContextStore::new();
        store.set("quiz", &event("u1"), cont("answer"), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.take("quiz", &event("u1")).is_empty());
        assert_eq!(store.compact(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_plugin() {
        let store = ContextStore::new();
        store.set("quiz", &event("u1"), cont("a"), Duration::from_secs(30));
        store.set("quiz", &event("u2"), cont("b"), Duration::from_secs(30));
        store.set("poll", &event("u1"), cont("c"), Duration::from_secs(30));

        assert!(store.clear("poll", &event("u1"), "c"));
        assert!(!store.clear("poll", &event("u1"), "c"));
        assert_eq!(store.clear_plugin("quiz"), 2);
        assert!(store.is_empty());
    }
}
