//! Rate limiting and duplicate suppression.
//!
//! [`Throttle`] keeps four independent scopes, each an [`ExpiringMap`]:
//!
//! ```text
//! scope     key                      installed by
//! ────────  ───────────────────────  ─────────────
//! group     bot:group                mark_sent (cooldowns.group_ms)
//! user      bot:group:user           mark_sent (cooldowns.user_ms)
//! device    bot:device               mark_sent (cooldowns.device_ms)
//! dedup     bot:user:message_id      dedup     (fixed window)
//! ```
//!
//! Special events (device/stdin) are never gated.

use std::time::Duration;

use tracing::trace;

use sinter_core::{Event, ExpiringMap};

use crate::policy::Cooldowns;

/// Default duplicate-delivery window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Cooldown and dedup gates.
#[derive(Debug)]
pub struct Throttle {
    group: ExpiringMap<String>,
    user: ExpiringMap<String>,
    device: ExpiringMap<String>,
    dedup: ExpiringMap<String>,
    dedup_window: Duration,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl Throttle {
    /// Creates a throttle with the given dedup window.
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            group: ExpiringMap::new(),
            user: ExpiringMap::new(),
            device: ExpiringMap::new(),
            dedup: ExpiringMap::new(),
            dedup_window,
        }
    }

    fn group_key(event: &Event) -> Option<String> {
        event
            .group_id
            .as_ref()
            .map(|g| format!("{}:{}", event.bot_id, g))
    }

    fn user_key(event: &Event) -> Option<String> {
        let user = event.user_id.as_ref()?;
        let group = event.group_id.as_deref().unwrap_or_default();
        Some(format!("{}:{}:{}", event.bot_id, group, user))
    }

    fn device_key(event: &Event) -> Option<String> {
        event
            .device_id
            .as_ref()
            .map(|d| format!("{}:{}", event.bot_id, d))
    }

    /// Returns `false` if any enabled scope has a live cooldown for `event`.
    pub fn allow(&self, event: &Event, cooldowns: &Cooldowns) -> bool {
        if event.is_special() {
            return true;
        }
        let gated = |map: &ExpiringMap<String>, ttl: Duration, key: Option<String>| {
            !ttl.is_zero() && key.is_some_and(|k| map.contains(&k))
        };
        if gated(&self.group, cooldowns.group(), Self::group_key(event)) {
            trace!(event_id = %event.id, scope = "group", "Cooldown active");
            return false;
        }
        if gated(&self.user, cooldowns.user(), Self::user_key(event)) {
            trace!(event_id = %event.id, scope = "user", "Cooldown active");
            return false;
        }
        if gated(&self.device, cooldowns.device(), Self::device_key(event)) {
            trace!(event_id = %event.id, scope = "device", "Cooldown active");
            return false;
        }
        true
    }

    /// Starts a cooldown in every scope with a non-zero length.
    pub fn mark_sent(&self, event: &Event, cooldowns: &Cooldowns) {
        if event.is_special() {
            return;
        }
        let scopes = [
            (&self.group, cooldowns.group(), Self::group_key(event)),
            (&self.user, cooldowns.user(), Self::user_key(event)),
            (&self.device, cooldowns.device(), Self::device_key(event)),
        ];
        for (map, ttl, key) in scopes {
            if let Some(key) = key.filter(|_| !ttl.is_zero()) {
                map.insert(key, (), ttl);
            }
        }
    }

    /// Claims the (user, message id) pair of `event`.
    ///
    /// Returns `true` on first delivery and `false` for a duplicate within the
    /// window. Events without a user or message id are never duplicates.
    pub fn dedup(&self, event: &Event) -> bool {
        if event.is_special() {
            return true;
        }
        let (Some(user), Some(message_id)) = (&event.user_id, &event.message_id) else {
            return true;
        };
        let key = format!("{}:{}:{}", event.bot_id, user, message_id);
        self.dedup.try_insert(key, (), self.dedup_window)
    }

    /// Sweeps expired entries from every scope.
    pub fn compact(&self) -> usize {
        self.group.compact() + self.user.compact() + self.device.compact() + self.dedup.compact()
    }

    /// Number of stored entries across every scope.
    pub fn len(&self) -> usize {
        self.group.len() + self.user.len() + self.device.len() + self.dedup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sinter_core::{Category, EventSource};

    fn event(user: &str, group: Option<&str>, message_id: &str) -> Event {
        let mut e = Event::empty(Category::Message, Value::Null);
        e.bot_id = "bot".into();
        e.user_id = Some(user.into());
        e.group_id = group.map(String::from);
        e.message_id = Some(message_id.into());
        e
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_allow_per_cooldown() {
        let throttle = Throttle::default();
        let cooldowns = Cooldowns {
            user_ms: 1000,
            ..Default::default()
        };

        let mut allowed = 0;
        for i in 0..5 {
            let e = event("u1", Some("g1"), &i.to_string());
            if throttle.allow(&e, &cooldowns) {
                allowed += 1;
                throttle.mark_sent(&e, &cooldowns);
            }
        }
        assert_eq!(allowed, 1);

        // A different user in the same group is unaffected.
        assert!(throttle.allow(&event("u2", Some("g1"), "9"), &cooldowns));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(throttle.allow(&event("u1", Some("g1"), "10"), &cooldowns));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_cooldown_gates_everyone() {
        let throttle = Throttle::default();
        let cooldowns = Cooldowns {
            group_ms: 500,
            ..Default::default()
        };
        throttle.mark_sent(&event("u1", Some("g1"), "1"), &cooldowns);
        assert!(!throttle.allow(&event("u2", Some("g1"), "2"), &cooldowns));
        assert!(throttle.allow(&event("u2", Some("g2"), "3"), &cooldowns));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cooldown_never_gates() {
        let throttle = Throttle::default();
        let on = Cooldowns {
            group_ms: 5000,
            ..Default::default()
        };
        throttle.mark_sent(&event("u1", Some("g1"), "1"), &on);
        // Config turned off after the entry was installed.
        assert!(throttle.allow(&event("u1", Some("g1"), "2"), &Cooldowns::default()));

        let fresh = Throttle::default();
        fresh.mark_sent(&event("u1", Some("g1"), "1"), &Cooldowns::default());
        assert!(fresh.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_special_events_bypass() {
        let throttle = Throttle::default();
        let cooldowns = Cooldowns {
            group_ms: 5000,
            user_ms: 5000,
            device_ms: 5000,
        };
        let mut e = event("u1", Some("g1"), "1");
        e.source = EventSource::Device;
        e.device_id = Some("d1".into());
        throttle.mark_sent(&e, &cooldowns);
        assert!(throttle.allow(&e, &cooldowns));
        assert!(throttle.dedup(&e));
        assert!(throttle.dedup(&e));
        assert!(throttle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window() {
        let throttle = Throttle::default();
        let e = event("u1", None, "m1");
        assert!(throttle.dedup(&e));
        assert!(!throttle.dedup(&e));

        tokio::time::advance(DEFAULT_DEDUP_WINDOW).await;
        assert!(throttle.dedup(&e));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact() {
        let throttle = Throttle::default();
        let cooldowns = Cooldowns {
            group_ms: 100,
            user_ms: 100,
            device_ms: 0,
        };
        throttle.mark_sent(&event("u1", Some("g1"), "1"), &cooldowns);
        throttle.dedup(&event("u1", Some("g1"), "1"));
        assert_eq!(throttle.len(), 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(throttle.compact(), 3);
        assert!(throttle.is_empty());
    }
}
