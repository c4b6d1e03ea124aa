//! Two-tier result cache
//!
//! ```text
//!            get                                  set
//!             │                                    │
//!             ▼                                    ▼
//!      ┌─────────────┐  miss   ┌──────────────┐   ┌─────────────┐
//!      │ L1 LRU+TTL  │ ──────► │ L2 backend   │   │ L1 insert   │
//!      │ (in-proc)   │         │ (bounded by  │   │ L2 write    │
//!      └─────────────┘         │  l2_timeout) │   │ (bounded)   │
//!             ▲     promote    └──────────────┘   └─────────────┘
//!             └──────────────────────┘
//! ```
//!
//! L2 errors and timeouts degrade to a miss (reads) or a logged warning
//! (writes); they never fail an assessment.

pub mod backend;
pub mod http;
pub mod key;
pub mod lru;
pub mod prefetch;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use backend::{glob_match, CacheBackend, CacheBackendError, InMemoryBackend, L2Entry};
pub use http::HttpKvBackend;
pub use key::{business_tag, routing_tag, CacheKey};
pub use lru::{CacheEntry, L1Lookup, LruTtlCache};
pub use prefetch::{run_cycle, PrefetchConfig, PrefetchCycle, Prefetcher, Rewarm};

use crate::metrics::EngineMetrics;
use crate::request::NormalizedRequest;

/// Cache tier label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
}

impl CacheTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum L1 entries
    pub l1_capacity: usize,
    /// Upper bound on how long an entry lives in L1
    pub l1_ttl: Duration,
    /// Bound on every L2 call
    pub l2_timeout: Duration,
    /// Key prefix
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl: Duration::from_secs(60),
            l2_timeout: Duration::from_millis(50),
            namespace: "risk".to_string(),
        }
    }
}

/// A cached payload and the tier that served it
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub bytes: Arc<[u8]>,
    pub tier: CacheTier,
}

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(CacheKey),
    /// Glob over full keys (`*`, `?`)
    Pattern(String),
    /// Entries carrying a tag; in L2 only `business:` tags can be resolved
    Tag(String),
}

/// Outcome of an invalidation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    pub l1_removed: usize,
    pub l2_removed: u64,
    /// Set when the L2 delete failed; L1 removal still happened
    pub l2_error: Option<CacheBackendError>,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_capacity: usize,
    pub l1_bytes: usize,
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    pub l1_evictions: u64,
    pub l2_errors: u64,
    pub has_l2: bool,
}

/// L1 + optional L2 with read-through and write-through
pub struct ResultCache {
    config: CacheConfig,
    l1: Mutex<LruTtlCache>,
    l2: Option<Arc<dyn CacheBackend>>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("l1_len", &self.l1_len())
            .field("l2", &self.l2.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig, l2: Option<Arc<dyn CacheBackend>>, metrics: Arc<EngineMetrics>) -> Self {
        let l1 = Mutex::new(LruTtlCache::new(config.l1_capacity));
        Self {
            config,
            l1,
            l2,
            metrics,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Key for a normalized request under this cache's namespace
    #[must_use]
    pub fn key_for(&self, request: &NormalizedRequest, routing_version: &str) -> CacheKey {
        CacheKey::for_request(&self.config.namespace, request, routing_version)
    }

    /// Read-through lookup: L1, then L2 (promoting hits into L1)
    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let lookup = self.l1.lock().get(key, Instant::now());
        match lookup {
            L1Lookup::Hit(bytes) => {
                self.metrics.record_cache_lookup(CacheTier::L1, true);
                return Some(CachedValue {
                    bytes,
                    tier: CacheTier::L1,
                });
            }
            L1Lookup::Expired => {
                self.metrics.ttl_expired.inc();
                self.metrics.record_cache_lookup(CacheTier::L1, false);
            }
            L1Lookup::Miss => self.metrics.record_cache_lookup(CacheTier::L1, false),
        }

        let l2 = self.l2.as_ref()?;
        let entry = match tokio::time::timeout(self.config.l2_timeout, l2.get(key.as_str())).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                warn!(backend = l2.name(), key = %key, error = %e, "L2 read failed, treating as miss");
                self.metrics.record_cache_error(CacheTier::L2);
                return None;
            }
            Err(_) => {
                warn!(
                    backend = l2.name(),
                    key = %key,
                    timeout_ms = self.config.l2_timeout.as_millis() as u64,
                    "L2 read timed out, treating as miss"
                );
                self.metrics.record_cache_error(CacheTier::L2);
                return None;
            }
        };

        let Some(entry) = entry else {
            self.metrics.record_cache_lookup(CacheTier::L2, false);
            return None;
        };
        self.metrics.record_cache_lookup(CacheTier::L2, true);

        let ttl = entry
            .ttl_remaining
            .map_or(self.config.l1_ttl, |remaining| remaining.min(self.config.l1_ttl));
        let bytes: Arc<[u8]> = Arc::from(entry.value);
        if !ttl.is_zero() {
            let tags = key.business_id().map(business_tag).into_iter().collect();
            self.insert_l1(key.clone(), bytes.clone(), ttl, tags);
        }
        debug!(key = %key, "promoted L2 hit into L1");
        Some(CachedValue {
            bytes,
            tier: CacheTier::L2,
        })
    }

    /// Write-through store into both tiers
    ///
    /// L1 keeps the entry for at most `l1_ttl`. An L2 failure is logged and
    /// counted; the L1 write stands.
    pub async fn set(&self, key: &CacheKey, bytes: Vec<u8>, ttl: Duration, tags: Vec<String>) {
        if ttl.is_zero() {
            return;
        }
        let bytes: Arc<[u8]> = Arc::from(bytes);
        self.insert_l1(key.clone(), bytes.clone(), ttl.min(self.config.l1_ttl), tags);

        let Some(l2) = &self.l2 else {
            return;
        };
        match tokio::time::timeout(self.config.l2_timeout, l2.set(key.as_str(), &bytes, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(backend = l2.name(), key = %key, error = %e, "L2 write failed");
                self.metrics.record_cache_error(CacheTier::L2);
            }
            Err(_) => {
                warn!(backend = l2.name(), key = %key, "L2 write timed out");
                self.metrics.record_cache_error(CacheTier::L2);
            }
        }
    }

    fn insert_l1(&self, key: CacheKey, bytes: Arc<[u8]>, ttl: Duration, tags: Vec<String>) {
        let evicted = self.l1.lock().insert(key, bytes, ttl, tags, Instant::now());
        self.metrics.record_cache_eviction(CacheTier::L1, evicted as u64);
    }

    /// Remove entries from both tiers
    pub async fn invalidate(&self, target: &Invalidation) -> InvalidationReport {
        let (l1_removed, l2_pattern) = {
            let mut l1 = self.l1.lock();
            match target {
                Invalidation::Key(key) => (usize::from(l1.remove(key)), Some(key.as_str().to_string())),
                Invalidation::Pattern(pattern) => (
                    l1.remove_where(|k, _| glob_match(pattern, k.as_str())).len(),
                    Some(pattern.clone()),
                ),
                Invalidation::Tag(tag) => {
                    let removed = l1.remove_where(|_, e| e.tags.iter().any(|t| t == tag)).len();
                    let pattern = tag
                        .strip_prefix("business:")
                        .map(|id| CacheKey::business_pattern(&self.config.namespace, id));
                    (removed, pattern)
                }
            }
        };

        let mut report = InvalidationReport {
            l1_removed,
            ..InvalidationReport::default()
        };
        if let (Some(l2), Some(pattern)) = (&self.l2, l2_pattern) {
            match tokio::time::timeout(self.config.l2_timeout, l2.delete_pattern(&pattern)).await {
                Ok(Ok(n)) => report.l2_removed = n,
                Ok(Err(e)) => {
                    warn!(backend = l2.name(), pattern = %pattern, error = %e, "L2 invalidation failed");
                    self.metrics.record_cache_error(CacheTier::L2);
                    report.l2_error = Some(e);
                }
                Err(_) => {
                    self.metrics.record_cache_error(CacheTier::L2);
                    report.l2_error = Some(CacheBackendError::Timeout {
                        backend: l2.name().to_string(),
                        timeout_ms: self.config.l2_timeout.as_millis() as u64,
                    });
                }
            }
        }
        debug!(?target, l1 = report.l1_removed, l2 = report.l2_removed, "invalidated");
        report
    }

    /// Drop expired L1 entries
    pub fn sweep_expired(&self) -> usize {
        let removed = self.l1.lock().sweep_expired(Instant::now());
        self.metrics.ttl_expired.add(removed as u64);
        removed
    }

    /// Popular L1 entries close to expiry, most accessed first
    #[must_use]
    pub fn prefetch_candidates(&self, min_access: u64, window: Duration, limit: usize) -> Vec<(CacheKey, u64)> {
        self.l1.lock().hot_expiring(min_access, window, Instant::now(), limit)
    }

    #[must_use]
    pub fn contains_l1(&self, key: &CacheKey) -> bool {
        self.l1
            .lock()
            .peek(key)
            .is_some_and(|e| !e.is_expired(Instant::now()))
    }

    /// Access count of an L1 entry
    #[must_use]
    pub fn l1_access_count(&self, key: &CacheKey) -> Option<u64> {
        self.l1.lock().peek(key).map(|e| e.access_count)
    }

    #[must_use]
    pub fn l1_len(&self) -> usize {
        self.l1.lock().len()
    }

    #[must_use]
    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    pub async fn l2_healthy(&self) -> Option<bool> {
        match &self.l2 {
            Some(l2) => Some(l2.health_check().await),
            None => None,
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1.lock();
        CacheStats {
            l1_entries: l1.len(),
            l1_capacity: l1.capacity(),
            l1_bytes: l1.size_bytes(),
            l1_hit_rate: self.metrics.l1.hit_rate(),
            l2_hit_rate: self.metrics.l2.hit_rate(),
            l1_evictions: self.metrics.l1.evictions.get(),
            l2_errors: self.metrics.l2.errors.get(),
            has_l2: self.l2.is_some(),
        }
    }
}
