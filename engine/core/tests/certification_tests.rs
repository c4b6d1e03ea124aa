//! Certification Integration Tests
//!
//! Latency and accuracy certification run against fully bootstrapped
//! engines backed by synthetic models, plus the degraded-mode fallbacks
//! bootstrap takes when optional infrastructure is missing.
//!
//! Run with: `cargo test -p risk-engine-core --test certification_tests`

use std::sync::Arc;
use std::time::Duration;

use risk_engine_core::bootstrap::{self, EngineHandle};
use risk_engine_core::validation::{DatasetSource, EngineTarget, SyntheticSpec, TargetMetric};
use risk_engine_core::{
    BenchmarkConfig, BenchmarkRunner, EngineConfigFile, ModelSlot, RiskAssessmentRequest, ValidationConfig,
    ValidationError,
};

// ============================================================================
// Helpers
// ============================================================================

fn synthetic_config(latency: Duration) -> EngineConfigFile {
    let mut config = EngineConfigFile::default();
    config.models.allow_synthetic = true;
    config.models.synthetic_latency = latency;
    config.engine.request_timeout = Duration::from_secs(2);
    config
}

async fn synthetic_handle(latency: Duration) -> EngineHandle {
    bootstrap::build(synthetic_config(latency)).await.unwrap()
}

fn scenario_config(size: usize) -> ValidationConfig {
    ValidationConfig {
        folds: 5,
        horizons: vec![6],
        default_accuracy_target: 0.5,
        dataset: DatasetSource::Synthetic(SyntheticSpec {
            size,
            seed: 7,
            ..SyntheticSpec::default()
        }),
        ..ValidationConfig::default()
    }
}

// ============================================================================
// Latency Certification
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_benchmark_against_synthetic_engine() {
    let handle = synthetic_handle(Duration::from_millis(50)).await;
    // Distinct businesses, always recomputed, so every call reaches the models
    let requests: Vec<RiskAssessmentRequest> = (0..1000)
        .map(|i| RiskAssessmentRequest::new(format!("biz-{i}"), [3, 12]).with_force_refresh(true))
        .collect();
    let target = Arc::new(EngineTarget::new(handle.engine.clone(), requests).unwrap());

    let runner = BenchmarkRunner::new(BenchmarkConfig {
        iterations: 1000,
        warmup: 20,
        concurrency: 10,
        sla_p95_ms: 100.0,
        sla_p99_ms: 200.0,
        ..BenchmarkConfig::default()
    })
    .unwrap();
    let report = runner.run(target).await;

    assert_eq!(report.successes, 1000);
    assert_eq!(report.failures, 0);
    assert!(report.errors.is_empty());
    // Ten workers, 50ms per call
    assert!(
        (report.throughput - 200.0).abs() < 20.0,
        "throughput {}",
        report.throughput
    );
    assert!(report.latency.p50 >= 50.0 && report.latency.p50 < 60.0);
    assert!(report.latency.p95 <= report.latency.p99);
    assert!(report.sla_passed());
}

#[tokio::test(start_paused = true)]
async fn test_benchmark_reports_sla_breach() {
    let handle = synthetic_handle(Duration::from_millis(120)).await;
    let requests = vec![RiskAssessmentRequest::new("slow", [6]).with_force_refresh(true)];
    let target = Arc::new(EngineTarget::new(handle.engine.clone(), requests).unwrap());

    let runner = BenchmarkRunner::new(BenchmarkConfig {
        iterations: 50,
        warmup: 0,
        concurrency: 1,
        sla_p95_ms: 100.0,
        sla_p99_ms: 200.0,
        ..BenchmarkConfig::default()
    })
    .unwrap();
    let report = runner.run(target).await;

    assert!(!report.sla_passed());
    let p95 = report.sla.iter().find(|s| s.metric == "p95").unwrap();
    assert!(!p95.passed);
    assert!(p95.actual >= 120.0);
    let p99 = report.sla.iter().find(|s| s.metric == "p99").unwrap();
    assert!(p99.passed);
    let errors = report.sla.iter().find(|s| s.metric == "error_rate").unwrap();
    assert!(errors.passed);
}

// ============================================================================
// Accuracy Certification
// ============================================================================

#[tokio::test]
async fn test_cross_validation_is_reproducible() {
    let handle = synthetic_handle(Duration::ZERO).await;
    let config = scenario_config(1000);

    let first = handle.harness.validate(&config).await.unwrap();
    let second = handle.harness.validate(&config).await.unwrap();

    let a = first.horizon(6).unwrap();
    let b = second.horizon(6).unwrap();
    assert_eq!(a.samples, 1000);
    assert_eq!(a.folds.len(), 5);
    assert_eq!(a.folds.iter().map(|f| f.test_size).sum::<usize>(), 1000);
    assert_eq!(a.metrics.accuracy, b.metrics.accuracy);
    assert_eq!(a.metrics.mae, b.metrics.mae);
    assert_eq!(a.folds, b.folds);
    assert_ne!(first.run_id, second.run_id);

    let recent = handle.harness.history().recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].run_id, second.run_id);
}

#[tokio::test]
async fn test_validated_weights_reach_the_serving_path() {
    let handle = synthetic_handle(Duration::ZERO).await;
    let request = RiskAssessmentRequest::new("acme", [6]);
    let before = handle.engine.assess(&request).await.unwrap();
    assert_eq!(before.weights_version, 0);

    let result = handle.harness.validate(&scenario_config(400)).await.unwrap();
    let share = result.horizon(6).unwrap().comparison.recommended_weights.short_share();
    let version = handle.engine.apply_weights(result.weight_table());
    assert_eq!(version, 1);

    // New weights mean a new routing version, so the old entry is not reused
    let after = handle.engine.assess(&request).await.unwrap();
    assert_eq!(after.weights_version, 1);
    assert_ne!(after.fingerprint, before.fingerprint);
    let short_weight = after
        .prediction(6)
        .unwrap()
        .weights
        .iter()
        .find(|w| w.slot == ModelSlot::Short)
        .map(|w| w.weight)
        .unwrap();
    assert!((short_weight - share).abs() < 1e-6);
}

#[tokio::test]
async fn test_missed_targets_fail_the_gate() {
    let handle = synthetic_handle(Duration::ZERO).await;
    let config = ValidationConfig {
        default_accuracy_target: 0.999,
        max_mae: Some(0.0001),
        ..scenario_config(300)
    };

    let result = handle.harness.validate(&config).await.unwrap();
    assert!(!result.target_achieved);
    let failed: Vec<TargetMetric> = result.failed_targets().map(|t| t.metric).collect();
    assert!(failed.contains(&TargetMetric::Accuracy));
    assert!(failed.contains(&TargetMetric::Mae));
    assert_eq!(result.recommendations[0].rank, 1);

    match result.ensure_targets() {
        Err(ValidationError::TargetNotMet { run_id, failures }) => {
            assert_eq!(run_id, result.run_id);
            assert!(failures.len() >= 2);
        }
        other => panic!("expected target failure, got {other:?}"),
    }
}

// ============================================================================
// Degraded Bootstrap
// ============================================================================

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = synthetic_config(Duration::ZERO);
    config.history_path = Some(dir.path().join("history").join("runs.jsonl"));

    let run_id = {
        let handle = bootstrap::build(config.clone()).await.unwrap();
        assert!(!handle.degraded.in_memory_history());
        handle.harness.validate(&scenario_config(200)).await.unwrap().run_id
    };

    let restarted = bootstrap::build(config).await.unwrap();
    let latest = restarted.harness.history().latest().await.unwrap().unwrap();
    assert_eq!(latest.run_id, run_id);
}

#[tokio::test]
async fn test_degraded_engine_still_certifies() {
    let mut config = synthetic_config(Duration::ZERO);
    config.l2_url = Some("http://127.0.0.1:9".into());
    let handle = bootstrap::build(config).await.unwrap();

    assert!(handle.degraded.is_degraded());
    assert!(handle.degraded.in_memory_l2());

    let request = RiskAssessmentRequest::new("acme", [3, 6, 9, 12]);
    let first = handle.engine.assess(&request).await.unwrap();
    let second = handle.engine.assess(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.failed_horizons(), 0);

    let health = handle.engine.health().await;
    assert_eq!(health.l2_healthy, Some(true));
    assert!(handle.harness.validate(&scenario_config(200)).await.is_ok());
}
