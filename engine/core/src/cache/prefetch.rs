//! Cache maintenance: TTL sweep and popularity-driven prefetch
//!
//! Each cycle drops expired L1 entries, then re-computes popular entries
//! that are about to expire so hot keys never fall out of the cache. The
//! task holds only a weak reference to its refresh source and exits once
//! the engine is gone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::ResultCache;
use crate::error::EngineError;

/// Prefetch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Time between maintenance cycles
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Minimum reads before an entry is worth refreshing
    pub popularity_threshold: u64,
    /// Refresh entries expiring within this window
    #[serde(with = "duration_ms")]
    pub refresh_window: Duration,
    /// Refreshes per cycle
    pub max_items: usize,
    /// Concurrent refreshes
    pub concurrency: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            popularity_threshold: 5,
            refresh_window: Duration::from_secs(30),
            max_items: 100,
            concurrency: 4,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Something that can recompute a cached entry by key
#[async_trait]
pub trait Rewarm: Send + Sync {
    /// Recompute and re-store `key`; `Ok(false)` when the key is unknown
    async fn rewarm(&self, key: &CacheKey) -> Result<bool, EngineError>;
}

/// Outcome of one maintenance cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchCycle {
    pub expired: usize,
    pub candidates: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run a single sweep + prefetch pass
pub async fn run_cycle(cache: &ResultCache, source: &dyn Rewarm, config: &PrefetchConfig) -> PrefetchCycle {
    let mut cycle = PrefetchCycle {
        expired: cache.sweep_expired(),
        ..PrefetchCycle::default()
    };

    let candidates = cache.prefetch_candidates(config.popularity_threshold, config.refresh_window, config.max_items);
    cycle.candidates = candidates.len();
    if candidates.is_empty() {
        return cycle;
    }

    let outcomes: Vec<(CacheKey, Result<bool, EngineError>)> = stream::iter(candidates)
        .map(|(key, _)| async move {
            let outcome = source.rewarm(&key).await;
            (key, outcome)
        })
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    let metrics = cache.metrics();
    for (key, outcome) in outcomes {
        match outcome {
            Ok(true) => {
                cycle.refreshed += 1;
                metrics.prefetch_refreshed.inc();
            }
            Ok(false) => cycle.skipped += 1,
            Err(e) => {
                cycle.failed += 1;
                metrics.prefetch_failed.inc();
                debug!(key = %key, error = %e, "prefetch refresh failed");
            }
        }
    }
    cycle
}

/// Background maintenance task
#[derive(Debug)]
pub struct Prefetcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Prefetcher {
    /// Spawn the maintenance loop; the first cycle runs one interval from now
    pub fn spawn(cache: Arc<ResultCache>, source: Weak<dyn Rewarm>, config: PrefetchConfig) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let period = config.interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            info!(
                interval_ms = period.as_millis() as u64,
                threshold = config.popularity_threshold,
                prefetch = config.enabled,
                "Starting cache maintenance task"
            );
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(source) = source.upgrade() else {
                    debug!("refresh source dropped, stopping maintenance");
                    break;
                };

                if config.enabled {
                    let cycle = run_cycle(&cache, source.as_ref(), &config).await;
                    if cycle.failed > 0 {
                        warn!(?cycle, "cache maintenance cycle had refresh failures");
                    } else if cycle.expired + cycle.refreshed > 0 {
                        debug!(?cycle, "cache maintenance cycle");
                    }
                } else {
                    let expired = cache.sweep_expired();
                    if expired > 0 {
                        debug!(expired, "TTL sweep");
                    }
                }
            }
            info!("Cache maintenance task stopped");
        });

        Self { shutdown, handle }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "cache maintenance task ended abnormally");
        }
    }
}
