//! L2 cache backends
//!
//! The shared tier sits behind [`CacheBackend`] so the engine can run against
//! a remote key-value service in production and an in-process map in tests or
//! degraded mode.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::time::Instant;

/// Errors from an L2 backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheBackendError {
    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("backend {backend} timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("backend {backend} returned a malformed response: {reason}")]
    Protocol { backend: String, reason: String },
}

/// A value read from L2
#[derive(Debug, Clone, PartialEq)]
pub struct L2Entry {
    pub value: Vec<u8>,
    /// Remaining TTL if the backend reports one
    pub ttl_remaining: Option<Duration>,
}

/// Shared cache tier
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<L2Entry>, CacheBackendError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheBackendError>;

    /// Delete every key matching a `*`/`?` glob, returning the count removed
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheBackendError>;

    async fn health_check(&self) -> bool {
        true
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local L2, used in tests and as the degraded-mode fallback
#[derive(Debug)]
pub struct InMemoryBackend {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live (unexpired) entries
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    fn check(&self) -> Result<(), CacheBackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheBackendError::Unavailable {
                backend: self.name().to_string(),
                reason: "marked unavailable".into(),
            })
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<L2Entry>, CacheBackendError> {
        self.check()?;
        let now = Instant::now();
        let live = match self.entries.get(key) {
            None => return Ok(None),
            Some(stored) if stored.expires_at > now => Some(L2Entry {
                value: stored.value.clone(),
                ttl_remaining: Some(stored.expires_at.saturating_duration_since(now)),
            }),
            Some(_) => None,
        };
        if live.is_none() {
            self.entries.remove(key);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheBackendError> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheBackendError> {
        self.check()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - self.entries.len()) as u64)
    }

    async fn health_check(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Match `text` against a glob where `*` is any run and `?` one character
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
