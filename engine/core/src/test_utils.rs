//! Model Test Utilities
//!
//! Mock infrastructure for exercising routing, caching and the engine
//! without real model artifacts. [`MockModel`] records every call and can
//! be switched into failure, slow or gated modes mid-test.
//!
//! # Usage
//!
//! ```ignore
//! use risk_engine_core::test_utils::MockModel;
//!
//! let long = Arc::new(MockModel::new("long", 0.6, 0.8));
//! long.set_failing(true);
//!
//! // ... drive the router or engine ...
//!
//! assert_eq!(long.call_count(), 1);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::cache::{CacheConfig, InMemoryBackend, ResultCache};
use crate::engine::{BreakerConfig, EngineConfig, RiskEngine};
use crate::metrics::EngineMetrics;
use crate::model::{FeatureVector, ModelAdapter, ModelDescriptor, ModelError, ModelKind, ModelSet, RawPrediction};
use crate::request::{BusinessSignals, PredictionHorizon, RiskAssessmentRequest};
use crate::routing::{ModelEnsembleRouter, RouterConfig};

// ============================================================================
// Mock Model
// ============================================================================

/// Scriptable model adapter
pub struct MockModel {
    model_id: String,
    version: Mutex<String>,
    score: Mutex<f64>,
    confidence: f64,
    horizon_scores: Mutex<HashMap<u32, f64>>,
    failing: AtomicBool,
    latency: Mutex<Duration>,
    /// When set, each call must take a permit before answering
    gate: Mutex<Option<Arc<Semaphore>>>,
    calls: AtomicUsize,
    history: Mutex<Vec<PredictionHorizon>>,
}

impl std::fmt::Debug for MockModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockModel")
            .field("model_id", &self.model_id)
            .field("calls", &self.call_count())
            .field("failing", &self.failing.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockModel {
    pub fn new(model_id: impl Into<String>, score: f64, confidence: f64) -> Self {
        Self {
            model_id: model_id.into(),
            version: Mutex::new("1".into()),
            score: Mutex::new(score),
            confidence,
            horizon_scores: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_score(&self, score: f64) {
        *self.score.lock() = score;
    }

    pub fn set_horizon_score(&self, months: u32, score: f64) {
        self.horizon_scores.lock().insert(months, score);
    }

    pub fn set_version(&self, version: impl Into<String>) {
        *self.version.lock() = version.into();
    }

    /// Block calls until permits are added to the returned semaphore
    pub fn install_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Horizons requested so far, in call order
    pub fn requested_horizons(&self) -> Vec<PredictionHorizon> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl ModelAdapter for MockModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            model_id: self.model_id.clone(),
            version: self.version.lock().clone(),
            kind: ModelKind::Synthetic,
        }
    }

    async fn load_model(&self, _path: &Path) -> Result<(), ModelError> {
        Ok(())
    }

    async fn predict(
        &self,
        _features: &FeatureVector,
        horizon: PredictionHorizon,
    ) -> Result<RawPrediction, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(horizon);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.map_err(|_| ModelError::Unavailable {
                model_id: self.model_id.clone(),
                reason: "gate closed".into(),
            })?;
            permit.forget();
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(ModelError::Unavailable {
                model_id: self.model_id.clone(),
                reason: "simulated failure".into(),
            });
        }

        let score = self
            .horizon_scores
            .lock()
            .get(&horizon.get())
            .copied()
            .unwrap_or(*self.score.lock());
        RawPrediction::checked(score, self.confidence).ok_or_else(|| ModelError::Inference {
            model_id: self.model_id.clone(),
            reason: "non-finite output".into(),
        })
    }

    async fn health_check(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A short/long mock pair plus the engine wired around them
pub struct TestHarness {
    pub engine: RiskEngine,
    pub short: Arc<MockModel>,
    pub long: Arc<MockModel>,
    pub l2: Arc<InMemoryBackend>,
    pub metrics: Arc<EngineMetrics>,
}

/// Engine config with a generous timeout and breaker, suitable for tests
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrent: 64,
        request_timeout: Duration::from_secs(5),
        breaker: BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        },
        ..EngineConfig::default()
    }
}

/// Build an engine over two mock models and an in-memory L2
pub fn harness(config: EngineConfig) -> TestHarness {
    let short = Arc::new(MockModel::new("mock-short", 0.2, 0.9));
    let long = Arc::new(MockModel::new("mock-long", 0.6, 0.8));
    harness_with(config, short, long)
}

pub fn harness_with(config: EngineConfig, short: Arc<MockModel>, long: Arc<MockModel>) -> TestHarness {
    let metrics = Arc::new(EngineMetrics::new());
    let router = Arc::new(ModelEnsembleRouter::new(
        ModelSet::new(short.clone(), long.clone()),
        RouterConfig::default(),
        metrics.clone(),
    ));
    let l2 = Arc::new(InMemoryBackend::new());
    let cache = Arc::new(ResultCache::new(
        CacheConfig::default(),
        Some(l2.clone()),
        metrics.clone(),
    ));
    let engine = RiskEngine::new(config, router, cache, metrics.clone());
    TestHarness {
        engine,
        short,
        long,
        l2,
        metrics,
    }
}

/// A request with a realistic spread of signals
pub fn sample_request(business_id: &str, horizons: impl IntoIterator<Item = u32>) -> RiskAssessmentRequest {
    RiskAssessmentRequest::new(business_id, horizons)
        .with_identity("Acme Widgets Ltd", "GB", "manufacturing")
        .with_signals(BusinessSignals {
            annual_revenue: Some(2_500_000.0),
            years_in_business: Some(7.0),
            employee_count: Some(35.0),
            avg_payment_delay_days: Some(12.0),
            debt_to_equity: Some(1.4),
            credit_utilization: Some(0.55),
            industry_risk: Some(0.4),
            prior_defaults: Some(0.0),
            payment_history: vec![1.0, 0.95, 1.0, 0.9, 1.0, 0.85],
        })
}
