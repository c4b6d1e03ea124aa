//! Serving Path Integration Tests
//!
//! Drives `RiskEngine` end to end over mock models: idempotence, request
//! coalescing, breaker transitions, horizon routing and the L2 tier.
//!
//! Run with: `cargo test -p risk-engine-core --test engine_tests`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use risk_engine_core::cache::{CacheBackendError, InMemoryBackend, L2Entry};
use risk_engine_core::test_utils::{harness, harness_with, sample_request, test_engine_config, MockModel};
use risk_engine_core::{
    BreakerConfig, CacheBackend, CacheConfig, CircuitState, EngineError, EngineMetrics, EngineConfig, ModelEnsembleRouter,
    ModelSet, ModelType, ModelUsed, PrefetchConfig, ResultCache, RiskEngine, RouterConfig,
};
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Helpers
// ============================================================================

/// Engine over the given models and L2, with its own metrics and L1
fn engine_over(short: Arc<MockModel>, long: Arc<MockModel>, l2: Arc<dyn CacheBackend>) -> (RiskEngine, Arc<EngineMetrics>) {
    let metrics = Arc::new(EngineMetrics::new());
    let router = Arc::new(ModelEnsembleRouter::new(
        ModelSet::new(short, long),
        RouterConfig::default(),
        metrics.clone(),
    ));
    let cache = Arc::new(ResultCache::new(CacheConfig::default(), Some(l2), metrics.clone()));
    (RiskEngine::new(test_engine_config(), router, cache, metrics.clone()), metrics)
}

/// L2 that fails every call
struct BrokenBackend;

#[async_trait]
impl CacheBackend for BrokenBackend {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<L2Entry>, CacheBackendError> {
        Err(CacheBackendError::Unavailable {
            backend: "broken".into(),
            reason: "connection refused".into(),
        })
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheBackendError> {
        Err(CacheBackendError::Unavailable {
            backend: "broken".into(),
            reason: "connection refused".into(),
        })
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<u64, CacheBackendError> {
        Ok(0)
    }

    async fn health_check(&self) -> bool {
        false
    }
}

// ============================================================================
// Idempotence and Coalescing
// ============================================================================

#[tokio::test]
async fn test_repeated_request_is_byte_identical() {
    let h = harness(test_engine_config());
    let request = sample_request("acme", [3]);

    let first = h.engine.assess(&request).await.unwrap();
    let second = h.engine.assess(&request).await.unwrap();
    let third = h.engine.assess(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&second).unwrap(),
        serde_json::to_vec(&third).unwrap()
    );
    assert_eq!(h.short.call_count(), 1);
    assert_eq!(h.long.call_count(), 0);
}

#[tokio::test]
async fn test_equivalent_requests_share_a_cache_entry() {
    let h = harness(test_engine_config());

    // Case, whitespace and horizon order do not change the fingerprint
    let a = sample_request("Acme", [12, 3]);
    let b = sample_request("  acme ", [3, 12]);
    let first = h.engine.assess(&a).await.unwrap();
    let second = h.engine.assess(&b).await.unwrap();

    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(h.metrics.l1.hits.get(), 1);
}

#[tokio::test]
async fn test_concurrent_identical_requests_invoke_models_once() {
    let h = harness(test_engine_config());
    let gate = h.short.install_gate();
    let request = sample_request("acme", [3]);

    let mut set = JoinSet::new();
    for _ in 0..20 {
        let engine = h.engine.clone();
        let request = request.clone();
        set.spawn(async move { engine.assess(&request).await });
    }

    while h.metrics.single_flight_joins.get() < 19 {
        tokio::task::yield_now().await;
    }
    gate.add_permits(1);

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined.unwrap().unwrap());
    }

    assert_eq!(results.len(), 20);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.short.call_count(), 1);
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_trials_and_closes() {
    let h = harness(test_engine_config());
    h.short.set_failing(true);
    h.long.set_failing(true);

    // Three consecutive model failures open the circuit
    for i in 0..3 {
        let err = h.engine.assess(&sample_request(&format!("biz-{i}"), [3])).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelInvocation { .. }), "{err}");
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::Open);

    // Open: rejected without touching the models
    let err = h.engine.assess(&sample_request("biz-open", [3])).await.unwrap_err();
    match err {
        EngineError::CircuitOpen { retry_after_ms } => assert!(retry_after_ms > 0 && retry_after_ms <= 30_000),
        other => panic!("expected circuit_open, got {other}"),
    }
    assert_eq!(h.short.call_count(), 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    h.short.set_failing(false);
    h.long.set_failing(false);
    let gate = h.short.install_gate();

    // Half-open: exactly two trials are admitted
    let mut trials = JoinSet::new();
    for i in 0..2 {
        let engine = h.engine.clone();
        trials.spawn(async move { engine.assess(&sample_request(&format!("trial-{i}"), [3])).await });
    }
    while h.short.call_count() < 5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::HalfOpen);

    let err = h.engine.assess(&sample_request("trial-extra", [3])).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));
    assert_eq!(h.short.call_count(), 5);

    gate.add_permits(2);
    while let Some(joined) = trials.join_next().await {
        joined.unwrap().unwrap();
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::Closed);
    assert_eq!(h.metrics.breaker_transition_count("closed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let h = harness(test_engine_config());
    h.short.set_failing(true);
    h.long.set_failing(true);
    for i in 0..3 {
        let _ = h.engine.assess(&sample_request(&format!("biz-{i}"), [3])).await;
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    let err = h.engine.assess(&sample_request("trial", [3])).await.unwrap_err();
    assert!(matches!(err, EngineError::ModelInvocation { .. }));
    assert_eq!(h.engine.breaker_state(), CircuitState::Open);

    let snapshot = h.engine.breaker_snapshot();
    assert!(snapshot.retry_after_ms.is_some_and(|ms| ms > 29_000));
}

#[tokio::test]
async fn test_invalid_input_does_not_trip_breaker() {
    let h = harness(test_engine_config());
    for _ in 0..10 {
        let err = assert_err!(h.engine.assess(&sample_request("acme", [5])).await);
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::Closed);
    assert_eq!(h.short.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_model_timeouts_open_the_breaker() {
    let config = EngineConfig {
        request_timeout: Duration::from_millis(50),
        ..test_engine_config()
    };
    let h = harness(config);
    h.short.set_latency(Duration::from_millis(500));

    for i in 0..3 {
        let err = h.engine.assess(&sample_request(&format!("slow-{i}"), [3])).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
    assert_eq!(h.engine.breaker_state(), CircuitState::Open);
    assert_eq!(h.short.call_count(), 3);

    let err = h.engine.assess(&sample_request("slow-3", [3])).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));
    assert_eq!(h.short.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_callers_do_not_trip_breaker() {
    let config = EngineConfig {
        breaker: BreakerConfig {
            failure_threshold: 1,
            ..test_engine_config().breaker
        },
        ..test_engine_config()
    };
    let h = harness(config);
    h.short.set_latency(Duration::from_secs(2));

    // The caller gives up long before the engine deadline
    for i in 0..3 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            h.engine.assess(&sample_request(&format!("impatient-{i}"), [3])),
        )
        .await;
        assert!(abandoned.is_err());
    }

    let snapshot = h.engine.breaker_snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(h.metrics.breaker_transition_count("open"), 0);

    h.short.set_latency(Duration::ZERO);
    assert_ok!(h.engine.assess(&sample_request("impatient-0", [3])).await);
}

// ============================================================================
// Horizon Routing
// ============================================================================

#[tokio::test]
async fn test_short_horizon_uses_short_model_only() {
    let h = harness(test_engine_config());
    let result = h.engine.assess(&sample_request("acme", [3])).await.unwrap();

    let prediction = result.prediction(3).unwrap();
    assert_eq!(prediction.model_used, ModelUsed::Short);
    assert!(!prediction.degraded);
    assert!((prediction.score - 0.2).abs() < 1e-9);
    assert_eq!(h.short.call_count(), 1);
    assert_eq!(h.long.call_count(), 0);
}

#[tokio::test]
async fn test_long_horizon_falls_back_to_short_model() {
    let h = harness(test_engine_config());
    h.long.set_failing(true);

    let result = h.engine.assess(&sample_request("acme", [12])).await.unwrap();

    assert!(result.degraded);
    let prediction = result.prediction(12).unwrap();
    assert_eq!(prediction.model_used, ModelUsed::ShortFallback);
    assert!(prediction.degraded);
    assert!((prediction.score - 0.2).abs() < 1e-9);
    // 0.9 from the short model, reduced by the 0.8 fallback penalty
    assert!((prediction.confidence - 0.72).abs() < 1e-9);
    assert_eq!(h.metrics.fallbacks.get(), 1);
}

#[tokio::test]
async fn test_blended_horizon_stays_within_component_scores() {
    let short = Arc::new(MockModel::new("mock-short", 0.1, 0.9));
    let long = Arc::new(MockModel::new("mock-long", 0.7, 0.6));
    let h = harness_with(test_engine_config(), short, long);

    let request = sample_request("acme", [6]).with_model_type(ModelType::Ensemble);
    let result = h.engine.assess(&request).await.unwrap();
    let prediction = result.prediction(6).unwrap();

    assert_eq!(prediction.model_used, ModelUsed::Ensemble);
    assert!(prediction.score >= 0.1 && prediction.score <= 0.7);
    // Disagreement lowers confidence below the weaker model's
    assert!(prediction.confidence < 0.6);
    let total: f64 = prediction.weights.iter().map(|w| w.weight).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_one_failed_horizon_keeps_the_rest() {
    let h = harness(test_engine_config());
    h.short.set_failing(true);

    // 3 months needs the short model; 12 months survives on the long one
    let result = h.engine.assess(&sample_request("acme", [3, 12])).await.unwrap();
    assert_eq!(result.failed_horizons(), 1);
    assert!(result.prediction(3).is_none());
    assert_eq!(result.prediction(12).unwrap().model_used, ModelUsed::Long);
    assert!(result.degraded);

    // Partial results are never cached
    h.short.set_failing(false);
    let retry = h.engine.assess(&sample_request("acme", [3, 12])).await.unwrap();
    assert_eq!(retry.failed_horizons(), 0);
}

#[tokio::test]
async fn test_model_timeout_is_reported_as_timeout() {
    let config = EngineConfig {
        request_timeout: Duration::from_millis(50),
        ..test_engine_config()
    };
    let h = harness(config);
    h.short.set_latency(Duration::from_millis(500));

    let err = h.engine.assess(&sample_request("acme", [3])).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert_eq!(h.metrics.error_count("timeout"), 1);
}

// ============================================================================
// Shared L2 and Maintenance
// ============================================================================

#[tokio::test]
async fn test_l2_shares_results_between_engines() {
    let l2 = Arc::new(InMemoryBackend::new());
    let short = Arc::new(MockModel::new("mock-short", 0.2, 0.9));
    let long = Arc::new(MockModel::new("mock-long", 0.6, 0.8));
    let (first, _) = engine_over(short.clone(), long.clone(), l2.clone());
    let (second, second_metrics) = engine_over(short.clone(), long.clone(), l2);

    let request = sample_request("acme", [3, 12]);
    let computed = first.assess(&request).await.unwrap();
    let shared = second.assess(&request).await.unwrap();

    assert_eq!(computed, shared);
    assert_eq!(short.call_count(), 1);
    assert_eq!(second_metrics.l2.hits.get(), 1);

    // Promoted into the second engine's L1
    second.assess(&request).await.unwrap();
    assert_eq!(second_metrics.l1.hits.get(), 1);
}

#[tokio::test]
async fn test_l2_outage_is_a_cache_miss() {
    let short = Arc::new(MockModel::new("mock-short", 0.2, 0.9));
    let long = Arc::new(MockModel::new("mock-long", 0.6, 0.8));
    let (engine, metrics) = engine_over(short.clone(), long, Arc::new(BrokenBackend));

    let request = sample_request("acme", [3]);
    assert_ok!(engine.assess(&request).await);
    assert_ok!(engine.assess(&request).await);

    assert_eq!(short.call_count(), 1);
    assert!(metrics.l2.errors.get() >= 1);
    let health = engine.health().await;
    assert_eq!(health.l2_healthy, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_rewarms_hot_entries() {
    let config = EngineConfig {
        result_ttl: Duration::from_secs(5),
        prefetch: PrefetchConfig {
            interval: Duration::from_secs(1),
            popularity_threshold: 2,
            refresh_window: Duration::from_secs(10),
            ..PrefetchConfig::default()
        },
        ..test_engine_config()
    };
    let h = harness(config);
    let hot = sample_request("hot", [3]);
    let cold = sample_request("cold", [3]);

    h.engine.assess(&hot).await.unwrap();
    h.engine.assess(&cold).await.unwrap();
    for _ in 0..3 {
        h.engine.assess(&hot).await.unwrap();
    }
    assert_eq!(h.short.call_count(), 2);

    h.engine.start_background();
    assert!(h.engine.background_running());
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Only the popular entry was recomputed
    assert_eq!(h.short.call_count(), 3);
    assert_eq!(h.metrics.prefetch_refreshed.get(), 1);

    h.engine.shutdown().await;
    assert!(!h.engine.background_running());
}
