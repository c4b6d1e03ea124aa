//! In-process L1 cache with LRU eviction and per-entry TTL
//!
//! This module provides the first cache tier with:
//! - LRU (Least Recently Used) eviction at a fixed entry capacity
//! - Per-entry expiry, checked on read and by the background sweep
//! - Access counting, which feeds prefetch popularity
//! - Tags for group invalidation
//!
//! # Design
//!
//! Recency is a monotonically increasing tick. `order` maps tick -> key, so
//! the least recently used entry is always the first element and eviction
//! is `O(log n)`. The cache itself is not synchronized; [`ResultCache`]
//! wraps it in a mutex and supplies `now`, which keeps this type easy to
//! test with explicit instants.
//!
//! [`ResultCache`]: super::ResultCache

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::key::CacheKey;

/// A cache entry containing the serialized result and metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<[u8]>,
    pub tags: Vec<String>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed: Instant,
    /// Number of reads since the entry was (re)written
    pub access_count: u64,
    tick: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.value.len()
    }
}

/// Outcome of an L1 read
#[derive(Debug, Clone, PartialEq)]
pub enum L1Lookup {
    Hit(Arc<[u8]>),
    /// Entry existed but had expired; it has been removed
    Expired,
    Miss,
}

/// Capacity-bounded LRU cache with TTL
#[derive(Debug)]
pub struct LruTtlCache {
    entries: HashMap<CacheKey, CacheEntry>,
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    capacity: usize,
    bytes: usize,
}

impl LruTtlCache {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity: capacity.max(1),
            bytes: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate payload bytes held
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Read an entry, refreshing its recency and access count
    pub fn get(&mut self, key: &CacheKey, now: Instant) -> L1Lookup {
        let expired = match self.entries.get(key) {
            None => return L1Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.remove(key);
            return L1Lookup::Expired;
        }

        let tick = self.next_tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return L1Lookup::Miss;
        };
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.last_accessed = now;
        entry.access_count = entry.access_count.saturating_add(1);
        self.order.insert(tick, key.clone());
        L1Lookup::Hit(entry.value.clone())
    }

    /// Inspect an entry without touching recency
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace an entry, returning how many entries were evicted
    ///
    /// Replacing an entry resets its access count.
    pub fn insert(
        &mut self,
        key: CacheKey,
        value: Arc<[u8]>,
        ttl: Duration,
        tags: Vec<String>,
        now: Instant,
    ) -> usize {
        self.remove(&key);

        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            if self.evict_lru().is_none() {
                break;
            }
            evicted += 1;
        }

        let tick = self.next_tick();
        self.bytes += value.len();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                tags,
                created_at: now,
                expires_at: now + ttl,
                last_accessed: now,
                access_count: 0,
                tick,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.bytes = self.bytes.saturating_sub(entry.value.len());
                true
            }
            None => false,
        }
    }

    /// Evict the least recently used entry
    pub fn evict_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.order.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes = self.bytes.saturating_sub(entry.value.len());
        }
        Some(key)
    }

    /// Remove every entry matching `predicate`, returning the removed keys
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&CacheKey, &CacheEntry) -> bool) -> Vec<CacheKey> {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed
    }

    /// Drop every expired entry
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        self.remove_where(|_, e| e.is_expired(now)).len()
    }

    /// Popular entries that will expire within `window`, most accessed first
    #[must_use]
    pub fn hot_expiring(
        &self,
        min_access: u64,
        window: Duration,
        now: Instant,
        limit: usize,
    ) -> Vec<(CacheKey, u64)> {
        let mut hot: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.access_count >= min_access && !e.is_expired(now) && e.remaining_ttl(now) <= window
            })
            .map(|(k, e)| (k.clone(), e.access_count))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hot.truncate(limit);
        hot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from_raw(s)
    }

    fn value(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut cache = LruTtlCache::new(2);

        cache.insert(key("a"), value("1"), ttl, vec![], now);
        cache.insert(key("b"), value("2"), ttl, vec![], now);
        assert!(matches!(cache.get(&key("a"), now), L1Lookup::Hit(_)));

        // "b" is now least recently used
        let evicted = cache.insert(key("c"), value("3"), ttl, vec![], now);
        assert_eq!(evicted, 1);
        assert_eq!(cache.get(&key("b"), now), L1Lookup::Miss);
        assert!(matches!(cache.get(&key("a"), now), L1Lookup::Hit(_)));
        assert!(matches!(cache.get(&key("c"), now), L1Lookup::Hit(_)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expiry_on_read() {
        let now = Instant::now();
        let mut cache = LruTtlCache::new(4);
        cache.insert(key("a"), value("1"), Duration::from_secs(1), vec![], now);

        let later = now + Duration::from_secs(2);
        assert_eq!(cache.get(&key("a"), later), L1Lookup::Expired);
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let now = Instant::now();
        let mut cache = LruTtlCache::new(8);
        cache.insert(key("short"), value("1"), Duration::from_secs(1), vec![], now);
        cache.insert(key("long"), value("2"), Duration::from_secs(100), vec![], now);

        assert_eq!(cache.sweep_expired(now + Duration::from_secs(5)), 1);
        assert!(cache.peek(&key("long")).is_some());
    }

    #[test]
    fn test_access_count_and_reset_on_replace() {
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut cache = LruTtlCache::new(4);
        cache.insert(key("a"), value("1"), ttl, vec![], now);
        for _ in 0..3 {
            cache.get(&key("a"), now);
        }
        assert_eq!(cache.peek(&key("a")).unwrap().access_count, 3);

        cache.insert(key("a"), value("2"), ttl, vec![], now);
        assert_eq!(cache.peek(&key("a")).unwrap().access_count, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_by_tag() {
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut cache = LruTtlCache::new(8);
        cache.insert(key("a"), value("1"), ttl, vec!["business:acme".into()], now);
        cache.insert(key("b"), value("2"), ttl, vec!["business:other".into()], now);

        let removed = cache.remove_where(|_, e| e.tags.iter().any(|t| t == "business:acme"));
        assert_eq!(removed, vec![key("a")]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hot_expiring_selection() {
        let now = Instant::now();
        let mut cache = LruTtlCache::new(8);
        cache.insert(key("hot-soon"), value("1"), Duration::from_secs(10), vec![], now);
        cache.insert(key("hot-later"), value("2"), Duration::from_secs(600), vec![], now);
        cache.insert(key("cold-soon"), value("3"), Duration::from_secs(10), vec![], now);
        for _ in 0..5 {
            cache.get(&key("hot-soon"), now);
            cache.get(&key("hot-later"), now);
        }
        cache.get(&key("cold-soon"), now);

        let hot = cache.hot_expiring(3, Duration::from_secs(30), now, 10);
        assert_eq!(hot, vec![(key("hot-soon"), 5)]);
    }
}
