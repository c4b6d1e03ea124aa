//! Risk Engine
//!
//! Entry point of the serving path.
//!
//! ```text
//! assess(request)
//!   │
//!   ├─ normalize + validate ─────────────── InvalidInput
//!   ├─ admission (try_acquire, no queue) ── ResourceExhausted
//!   ├─ cache get (L1 → L2) ──────────────── hit: return
//!   ├─ single-flight join ─┐
//!   │  or breaker check ───┼─────────────── CircuitOpen
//!   │                      ▼
//!   │              router.predict (deadline) ── Timeout / ModelInvocation
//!   │                      │
//!   │              breaker outcome, cache set
//!   ▼
//! EnsembleResult
//! ```
//!
//! Every stage runs under one deadline. Dropping the returned future cancels
//! the request; the shared computation stops once its last waiter is gone,
//! and a cancelled computation never counts against the breaker.

pub mod breaker;
pub mod single_flight;

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

pub use breaker::{BreakerConfig, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use single_flight::{Flight, SingleFlight};

use crate::cache::{
    business_tag, routing_tag, CacheKey, CacheStats, Invalidation, InvalidationReport, PrefetchConfig, Prefetcher,
    ResultCache, Rewarm,
};
use crate::error::{EngineError, EngineResult, Stage};
use crate::metrics::{EngineMetrics, Gauge};
use crate::prediction::EnsembleResult;
use crate::request::{normalize_business_id, NormalizedRequest, RequestLimits, RiskAssessmentRequest};
use crate::routing::{ModelEnsembleRouter, RouterHealth, WeightTable};

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Concurrent assessments admitted; excess requests are rejected
    pub max_concurrent: usize,
    /// Deadline applied by [`RiskEngine::assess`]
    pub request_timeout: Duration,
    pub limits: RequestLimits,
    /// TTL for complete, non-degraded results
    pub result_ttl: Duration,
    /// TTL for results where some horizon fell back
    pub degraded_ttl: Duration,
    pub breaker: BreakerConfig,
    pub prefetch: PrefetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            request_timeout: Duration::from_millis(500),
            limits: RequestLimits::default(),
            result_ttl: Duration::from_secs(300),
            degraded_ttl: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

/// Point-in-time engine health
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub breaker: BreakerSnapshot,
    pub short_model_healthy: bool,
    pub long_model_healthy: bool,
    pub routing_version: String,
    /// `None` when no L2 is configured
    pub l2_healthy: Option<bool>,
    pub cache: CacheStats,
    pub in_flight: u64,
    pub available_permits: usize,
}

/// Multi-horizon risk engine
///
/// Cheap to clone; clones share every piece of state.
#[derive(Clone)]
pub struct RiskEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("config", &self.inner.config)
            .field("breaker", &self.inner.pipeline.breaker.state())
            .field("in_flight", &self.inner.metrics.in_flight.get())
            .finish()
    }
}

struct EngineInner {
    config: EngineConfig,
    pipeline: Pipeline,
    metrics: Arc<EngineMetrics>,
    admission: Arc<Semaphore>,
    flights: SingleFlight<CacheKey, EngineResult<Arc<EnsembleResult>>>,
    prefetcher: Mutex<Option<Prefetcher>>,
}

/// The owned pieces a computation needs, so it can outlive any one caller
#[derive(Clone)]
struct Pipeline {
    router: Arc<ModelEnsembleRouter>,
    cache: Arc<ResultCache>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    /// Request behind each cached key, for prefetch
    origins: Arc<DashMap<CacheKey, Arc<NormalizedRequest>>>,
    result_ttl: Duration,
    degraded_ttl: Duration,
    timeout_ms: u64,
}

/// Decrements the in-flight gauge however the request ends
struct InFlight<'a>(&'a Gauge);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl RiskEngine {
    pub fn new(
        config: EngineConfig,
        router: Arc<ModelEnsembleRouter>,
        cache: Arc<ResultCache>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), metrics.clone()));
        let pipeline = Pipeline {
            router,
            cache,
            breaker,
            metrics: metrics.clone(),
            origins: Arc::new(DashMap::new()),
            result_ttl: config.result_ttl,
            degraded_ttl: config.degraded_ttl,
            timeout_ms: config.request_timeout.as_millis() as u64,
        };
        let admission = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                config,
                pipeline,
                metrics,
                admission,
                flights: SingleFlight::new(),
                prefetcher: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ModelEnsembleRouter> {
        &self.inner.pipeline.router
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.pipeline.cache
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.inner.metrics
    }

    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.inner.pipeline.breaker.state()
    }

    #[must_use]
    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.inner.pipeline.breaker.snapshot()
    }

    /// Assess with the configured request timeout
    pub async fn assess(&self, request: &RiskAssessmentRequest) -> EngineResult<EnsembleResult> {
        let deadline = Instant::now() + self.inner.config.request_timeout;
        self.assess_with_deadline(request, deadline).await
    }

    /// Assess under an explicit deadline
    pub async fn assess_with_deadline(
        &self,
        request: &RiskAssessmentRequest,
        deadline: Instant,
    ) -> EngineResult<EnsembleResult> {
        let started = Instant::now();
        let inner = &self.inner;

        let normalized = match request.normalize(&inner.config.limits) {
            Ok(normalized) => normalized,
            Err(e) => {
                debug!(business_id = %request.business_id, error = %e, "rejected invalid request");
                let error = EngineError::from(e);
                inner.metrics.record_rejection(error.kind());
                return Err(error);
            }
        };

        let Ok(_permit) = inner.admission.clone().try_acquire_owned() else {
            let error = EngineError::ResourceExhausted {
                limit: inner.config.max_concurrent,
            };
            warn!(business_id = %normalized.business_id, limit = inner.config.max_concurrent, "admission rejected");
            inner.metrics.record_rejection(error.kind());
            return Err(error);
        };
        let _in_flight = InFlight::enter(&inner.metrics.in_flight);

        let result = inner.run(normalized, request.force_refresh, deadline).await;
        inner
            .metrics
            .record_assessment(started.elapsed(), result.as_ref().err().map(EngineError::kind));
        result
    }

    /// Atomically swap blend weights; later requests use fresh cache keys
    pub fn apply_weights(&self, table: WeightTable) -> u64 {
        self.inner.pipeline.router.apply_weights(table)
    }

    pub async fn invalidate(&self, target: &Invalidation) -> InvalidationReport {
        self.inner.pipeline.cache.invalidate(target).await
    }

    /// Drop every cached result for one business
    ///
    /// The id is checked like a request's, so glob characters never reach
    /// the invalidation pattern.
    pub async fn invalidate_business(&self, business_id: &str) -> EngineResult<InvalidationReport> {
        let business_id = normalize_business_id(business_id)?;
        Ok(self.invalidate(&Invalidation::Tag(business_tag(&business_id))).await)
    }

    pub async fn health(&self) -> EngineHealth {
        let pipeline = &self.inner.pipeline;
        let RouterHealth {
            short_healthy,
            long_healthy,
            ..
        } = pipeline.router.health_check().await;
        EngineHealth {
            breaker: pipeline.breaker.snapshot(),
            short_model_healthy: short_healthy,
            long_model_healthy: long_healthy,
            routing_version: pipeline.router.routing_version(),
            l2_healthy: pipeline.cache.l2_healthy().await,
            cache: pipeline.cache.stats(),
            in_flight: self.inner.metrics.in_flight.get(),
            available_permits: self.inner.admission.available_permits(),
        }
    }

    /// Start the cache maintenance task (TTL sweep + prefetch)
    ///
    /// Idempotent. The task stops on [`shutdown`](Self::shutdown) or once
    /// every clone of the engine has been dropped.
    pub fn start_background(&self) {
        let mut slot = self.inner.prefetcher.lock();
        if slot.is_some() {
            return;
        }
        let concrete: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let source: Weak<dyn Rewarm> = concrete;
        *slot = Some(Prefetcher::spawn(
            self.inner.pipeline.cache.clone(),
            source,
            self.inner.config.prefetch.clone(),
        ));
    }

    #[must_use]
    pub fn background_running(&self) -> bool {
        self.inner
            .prefetcher
            .lock()
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        let prefetcher = self.inner.prefetcher.lock().take();
        if let Some(prefetcher) = prefetcher {
            prefetcher.shutdown().await;
        }
    }
}

impl EngineInner {
    async fn run(
        &self,
        request: NormalizedRequest,
        force_refresh: bool,
        deadline: Instant,
    ) -> EngineResult<EnsembleResult> {
        let pipeline = &self.pipeline;
        let routing_version = pipeline.router.routing_version();
        let key = pipeline.cache.key_for(&request, &routing_version);

        if !force_refresh {
            let cached = timeout_at(deadline, pipeline.cache.get(&key))
                .await
                .map_err(|_| EngineError::Timeout {
                    stage: Stage::Cache,
                    timeout_ms: pipeline.timeout_ms,
                })?;
            if let Some(hit) = cached {
                match serde_json::from_slice::<EnsembleResult>(&hit.bytes) {
                    Ok(result) => {
                        trace!(key = %key, tier = hit.tier.as_str(), "cache hit");
                        return Ok(result);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "discarding undecodable cache entry");
                        pipeline.cache.invalidate(&Invalidation::Key(key.clone())).await;
                    }
                }
            }
        }

        let flight = self.flight(key, Arc::new(request), routing_version, deadline)?;
        if !flight.leader {
            self.metrics.single_flight_joins.inc();
            trace!("joined in-flight computation");
        }

        match timeout_at(deadline, flight.future).await {
            Ok(result) => result.map(Arc::unwrap_or_clone),
            Err(_) => Err(EngineError::Timeout {
                stage: Stage::Router,
                timeout_ms: pipeline.timeout_ms,
            }),
        }
    }

    /// Join the computation for `key`, or pass the breaker and start one
    fn flight(
        &self,
        key: CacheKey,
        request: Arc<NormalizedRequest>,
        routing_version: String,
        deadline: Instant,
    ) -> EngineResult<Flight<EngineResult<Arc<EnsembleResult>>>> {
        let pipeline = self.pipeline.clone();
        self.flights.join_or_start(key.clone(), move || {
            let permit = pipeline.breaker.try_acquire()?;
            Ok(pipeline
                .compute(key, request, routing_version, permit, deadline)
                .boxed())
        })
    }
}

impl Pipeline {
    async fn compute(
        self,
        key: CacheKey,
        request: Arc<NormalizedRequest>,
        routing_version: String,
        permit: BreakerPermit,
        deadline: Instant,
    ) -> EngineResult<Arc<EnsembleResult>> {
        let outcome = match timeout_at(deadline, self.router.predict(&request, key.digest())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout {
                stage: Stage::Router,
                timeout_ms: self.timeout_ms,
            }),
        };
        permit.record(&outcome);
        let result = outcome?;

        self.store(&key, &request, &routing_version, &result).await;
        Ok(Arc::new(result))
    }

    /// Cache a result; results with failed horizons are not cached
    async fn store(&self, key: &CacheKey, request: &Arc<NormalizedRequest>, routing_version: &str, result: &EnsembleResult) {
        if result.failed_horizons() > 0 {
            debug!(key = %key, failed = result.failed_horizons(), "not caching partial result");
            return;
        }
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialize result for caching");
                return;
            }
        };
        let ttl = if result.degraded {
            self.degraded_ttl
        } else {
            self.result_ttl
        };
        let tags = vec![business_tag(&request.business_id), routing_tag(routing_version)];
        self.cache.set(key, bytes, ttl, tags).await;
        self.origins.insert(key.clone(), request.clone());
    }
}

#[async_trait::async_trait]
impl Rewarm for EngineInner {
    async fn rewarm(&self, key: &CacheKey) -> Result<bool, EngineError> {
        let pipeline = &self.pipeline;
        // Forget origins whose entries have left L1
        pipeline.origins.retain(|k, _| pipeline.cache.contains_l1(k));

        let Some(request) = pipeline.origins.get(key).map(|entry| entry.value().clone()) else {
            return Ok(false);
        };
        let routing_version = pipeline.router.routing_version();
        if pipeline.cache.key_for(&request, &routing_version) != *key {
            pipeline.origins.remove(key);
            return Ok(false);
        }

        let deadline = Instant::now() + self.config.request_timeout;
        let flight = self.flight(key.clone(), request, routing_version, deadline)?;
        let result = flight.future.await?;
        trace!(key = %key, "prefetch refreshed entry");
        Ok(result.failed_horizons() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{harness, sample_request, test_engine_config};

    #[tokio::test]
    async fn test_cache_hit_skips_models() {
        let h = harness(test_engine_config());
        let request = sample_request("acme", [3]);

        let first = h.engine.assess(&request).await.unwrap();
        let second = h.engine.assess(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.short.call_count(), 1);
        assert_eq!(h.metrics.l1.hits.get(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_recomputes() {
        let h = harness(test_engine_config());
        let request = sample_request("acme", [3]);
        h.engine.assess(&request).await.unwrap();
        h.engine
            .assess(&request.clone().with_force_refresh(true))
            .await
            .unwrap();
        assert_eq!(h.short.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_cache() {
        let h = harness(test_engine_config());
        let err = h.engine.assess(&sample_request("", [3])).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(h.metrics.l1.misses.get(), 0);
        assert_eq!(h.metrics.error_count("invalid_input"), 1);
    }

    #[tokio::test]
    async fn test_admission_ceiling_rejects_without_queueing() {
        let config = EngineConfig {
            max_concurrent: 1,
            ..test_engine_config()
        };
        let h = harness(config);
        let gate = h.short.install_gate();

        let engine = h.engine.clone();
        let blocked = tokio::spawn(async move { engine.assess(&sample_request("acme", [3])).await });
        while h.short.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        let err = h.engine.assess(&sample_request("zeta", [3])).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { limit: 1 }));

        gate.add_permits(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(h.metrics.in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_partial_results_are_not_cached() {
        let h = harness(test_engine_config());
        h.short.set_failing(true);

        // Horizon 3 is short-only and fails; horizon 12 is served by the long model
        let request = sample_request("acme", [3, 12]);
        let result = h.engine.assess(&request).await.unwrap();
        assert_eq!(result.failed_horizons(), 1);
        assert_eq!(h.engine.cache().l1_len(), 0);
    }

    #[tokio::test]
    async fn test_degraded_results_use_short_ttl() {
        let h = harness(test_engine_config());
        h.long.set_failing(true);
        let result = h.engine.assess(&sample_request("acme", [12])).await.unwrap();
        assert!(result.degraded);

        let expiring = h.engine.cache().prefetch_candidates(0, Duration::from_secs(31), 10);
        assert_eq!(expiring.len(), 1, "degraded entry expires within the degraded ttl");
    }

    #[tokio::test]
    async fn test_invalidate_business() {
        let h = harness(test_engine_config());
        h.engine.assess(&sample_request("acme", [3])).await.unwrap();
        let report = h.engine.invalidate_business("ACME").await.unwrap();
        assert_eq!(report.l1_removed, 1);
        assert_eq!(report.l2_removed, 1);

        h.engine.assess(&sample_request("acme", [3])).await.unwrap();
        assert_eq!(h.short.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_business_rejects_patterns() {
        let h = harness(test_engine_config());
        h.engine.assess(&sample_request("acme", [3])).await.unwrap();
        h.engine.assess(&sample_request("zeta", [3])).await.unwrap();

        for id in ["*", "acm?", "", "a:b"] {
            let err = h.engine.invalidate_business(id).await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{id:?} gave {err:?}");
        }
        assert_eq!(h.engine.cache().l1_len(), 2);

        h.engine.assess(&sample_request("zeta", [3])).await.unwrap();
        assert_eq!(h.short.call_count(), 2);
    }

    #[tokio::test]
    async fn test_weight_swap_changes_keys() {
        let h = harness(test_engine_config());
        let request = sample_request("acme", [6]);
        h.engine.assess(&request).await.unwrap();
        h.engine.apply_weights(WeightTable::equal().with_source("test"));
        let result = h.engine.assess(&request).await.unwrap();
        assert_eq!(result.weights_version, 1);
        assert_eq!(h.short.call_count(), 2);
    }
}
