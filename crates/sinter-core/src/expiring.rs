//! A map whose entries expire after a per-entry TTL.
//!
//! [`ExpiringMap`] is the single TTL primitive behind every cooldown scope,
//! the message dedup window and plugin context continuations. Expiry is
//! lazy: reads drop the entry they find expired, and [`compact`] sweeps
//! everything else on a fixed interval for memory hygiene only. Correctness
//! never depends on the sweep.
//!
//! Time comes from [`tokio::time::Instant`], so tests can pause and advance
//! the clock.
//!
//! [`compact`]: ExpiringMap::compact

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) < self.ttl
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.duration_since(self.created_at))
    }
}

/// A concurrent map with self-expiring entries.
///
/// At most one live entry exists per key.
pub struct ExpiringMap<K, V = ()> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or replaces the entry for `key`.
    ///
    /// A zero `ttl` removes any existing entry instead.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        if ttl.is_zero() {
            entries.remove(&key);
            return;
        }
        entries.insert(
            key,
            Entry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Inserts only when no live entry exists for `key`.
    ///
    /// Returns `true` if the entry was installed. Check-and-insert happens
    /// under one lock, so two callers can never both claim the same key.
    pub fn try_insert(&self, key: K, value: V, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        entries.insert(
            key,
            Entry {
                value,
                created_at: now,
                ttl,
            },
        );
        true
    }

    /// Returns `true` if a live entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Returns how long the live entry for `key` has left.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.remaining(now))
    }

    /// Removes the entry for `key`, returning its value if it was live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .lock()
            .remove(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn compact(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Returns a clone of the live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Returns clones of every live `(key, value)` pair matching `filter`.
    pub fn collect<F>(&self, mut filter: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K) -> bool,
    {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(k, e)| e.is_live(now) && filter(k))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

impl<K, V> std::fmt::Debug for ExpiringMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringMap")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let map: ExpiringMap<&str> = ExpiringMap::new();
        map.insert("k", (), Duration::from_secs(2));
        assert!(map.contains(&"k"));

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(map.contains(&"k"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!map.contains(&"k"));
        // Lazy sweep removed it on read.
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_insert_single_live_entry() {
        let map: ExpiringMap<&str> = ExpiringMap::new();
        assert!(map.try_insert("k", (), Duration::from_secs(1)));
        assert!(!map.try_insert("k", (), Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(map.try_insert("k", (), Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_stores() {
        let map: ExpiringMap<&str> = ExpiringMap::new();
        assert!(map.try_insert("k", (), Duration::ZERO));
        assert!(!map.contains(&"k"));
        map.insert("k", (), Duration::ZERO);
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_sweeps_expired() {
        let map: ExpiringMap<u32, &str> = ExpiringMap::new();
        map.insert(1, "short", Duration::from_secs(1));
        map.insert(2, "long", Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(map.compact(), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&2), Some("long"));
        assert_eq!(map.remaining(&2), Some(Duration::from_secs(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_skips_expired() {
        let map: ExpiringMap<(u32, u32), u32> = ExpiringMap::new();
        map.insert((1, 1), 11, Duration::from_secs(5));
        map.insert((1, 2), 12, Duration::from_secs(1));
        map.insert((2, 1), 21, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(2)).await;
        let live = map.collect(|(a, _)| *a == 1);
        assert_eq!(live, vec![((1, 1), 11)]);
    }
}
