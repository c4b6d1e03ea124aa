//! Ensemble Router
//!
//! The main entry point for turning a normalized request into an
//! [`EnsembleResult`]. For each horizon:
//! 1. Pick a [`RoutePlan`] from the model preference and horizon
//! 2. Invoke the models the plan (and comparison) needs
//! 3. Blend, or degrade to whichever model answered
//! 4. Attach comparison and uncertainty when requested
//!
//! Multi-horizon requests run one task per horizon on a `JoinSet`; dropping
//! the `predict` future aborts every horizon task.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::blend::{blend, BlendComponent};
use super::config::RouterConfig;
use super::policy::{plan_for, RoutePlan};
use super::weights::{WeightStore, WeightTable};
use crate::error::{EngineError, EngineResult, Stage};
use crate::metrics::EngineMetrics;
use crate::model::{FeatureVector, ModelError, ModelSet};
use crate::prediction::{
    EnsembleResult, HorizonOutcome, HorizonPrediction, ModelComparison, ModelPrediction,
    ModelSlot, ModelUsed, ModelWeight, RiskLevel, UncertaintyBounds,
};
use crate::request::{ModelType, NormalizedRequest, PredictionHorizon};

/// Round to six decimals so cached values round-trip through JSON exactly
fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Per-request output switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HorizonOptions {
    pub include_uncertainty: bool,
    pub include_comparison: bool,
}

impl From<&NormalizedRequest> for HorizonOptions {
    fn from(request: &NormalizedRequest) -> Self {
        Self {
            include_uncertainty: request.include_uncertainty,
            include_comparison: request.include_model_comparison,
        }
    }
}

/// Raw per-model outputs for one horizon, used by validation
#[derive(Debug, Clone)]
pub struct ComponentScores {
    pub short: Result<ModelPrediction, ModelError>,
    pub long: Result<ModelPrediction, ModelError>,
}

/// Health of both model slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterHealth {
    pub short_healthy: bool,
    pub long_healthy: bool,
    pub models_version: String,
}

/// Horizon-aware router over the short and long models
pub struct ModelEnsembleRouter {
    models: ModelSet,
    weights: WeightStore,
    config: RouterConfig,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ModelEnsembleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEnsembleRouter")
            .field("models", &self.models)
            .field("weights_version", &self.weights.current().version)
            .field("config", &self.config)
            .finish()
    }
}

impl ModelEnsembleRouter {
    pub fn new(models: ModelSet, config: RouterConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            models,
            weights: WeightStore::default(),
            config,
            metrics,
        }
    }

    /// Start from a specific weight table instead of equal weights
    #[must_use]
    pub fn with_weights(self, table: WeightTable) -> Self {
        Self {
            weights: WeightStore::new(table),
            ..self
        }
    }

    #[must_use]
    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn current_weights(&self) -> Arc<WeightTable> {
        self.weights.current()
    }

    /// Atomically replace the blend weights
    pub fn apply_weights(&self, table: WeightTable) -> u64 {
        let source = table.source.clone();
        let version = self.weights.swap(table);
        info!(version, source = %source, "Blend weights updated");
        version
    }

    /// Model set and weight versions; results are only reusable while
    /// this string is unchanged
    #[must_use]
    pub fn routing_version(&self) -> String {
        format!("{}#w{}", self.models.version(), self.weights.current().version)
    }

    pub async fn health_check(&self) -> RouterHealth {
        let (short_healthy, long_healthy) =
            tokio::join!(self.models.short.health_check(), self.models.long.health_check());
        RouterHealth {
            short_healthy,
            long_healthy,
            models_version: self.models.version(),
        }
    }

    fn job(
        &self,
        horizon: PredictionHorizon,
        model_type: ModelType,
        features: Arc<FeatureVector>,
        weights: Arc<WeightTable>,
        options: HorizonOptions,
    ) -> HorizonJob {
        HorizonJob {
            models: self.models.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            weights,
            features,
            horizon,
            model_type,
            options,
        }
    }

    /// Score every horizon of a request
    ///
    /// Per-horizon failures are reported inside the result; the call fails
    /// only when every horizon failed.
    pub async fn predict(
        &self,
        request: &NormalizedRequest,
        fingerprint: &str,
    ) -> EngineResult<EnsembleResult> {
        let features = Arc::new(FeatureVector::from_signals(&request.signals));
        let weights = self.weights.current();
        let options = HorizonOptions::from(request);
        let models_version = self.models.version();

        let mut outcomes = if let [horizon] = request.horizons.as_slice() {
            let job = self.job(*horizon, request.model_type, features, weights.clone(), options);
            vec![job.run().await]
        } else {
            let mut set = JoinSet::new();
            for &horizon in &request.horizons {
                let job = self.job(
                    horizon,
                    request.model_type,
                    features.clone(),
                    weights.clone(),
                    options,
                );
                set.spawn(job.run());
            }

            let mut outcomes = Vec::with_capacity(request.horizons.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        return Err(EngineError::internal(
                            Stage::Router,
                            format!("horizon task failed: {e}"),
                        ))
                    }
                }
            }
            outcomes
        };
        outcomes.sort_by_key(|(horizon, _)| *horizon);

        let mut first_error = None;
        let mut horizons = Vec::with_capacity(outcomes.len());
        let mut degraded = false;
        for (horizon, outcome) in outcomes {
            match outcome {
                Ok(prediction) => {
                    degraded |= prediction.degraded;
                    horizons.push(HorizonOutcome::Scored(prediction));
                }
                Err(error) => {
                    degraded = true;
                    self.metrics.horizon_failures.inc();
                    horizons.push(HorizonOutcome::Failed {
                        horizon,
                        stage: error.stage(),
                        error: error.to_string(),
                    });
                    first_error.get_or_insert(error);
                }
            }
        }

        if horizons.iter().all(|h| h.prediction().is_none()) {
            return Err(first_error.unwrap_or_else(|| {
                EngineError::internal(Stage::Router, "request produced no horizons")
            }));
        }
        if degraded {
            self.metrics.degraded_results.inc();
        }

        Ok(EnsembleResult {
            business_id: request.business_id.clone(),
            fingerprint: fingerprint.to_string(),
            horizons,
            degraded,
            models_version,
            weights_version: weights.version,
            computed_at: Utc::now(),
        })
    }

    /// Score a single horizon with explicit options
    pub async fn predict_horizon(
        &self,
        features: &FeatureVector,
        horizon: PredictionHorizon,
        model_type: ModelType,
        options: HorizonOptions,
    ) -> EngineResult<HorizonPrediction> {
        let job = self.job(
            horizon,
            model_type,
            Arc::new(features.clone()),
            self.weights.current(),
            options,
        );
        job.run().await.1
    }

    /// Raw output of both models, without routing or blending
    pub async fn score_components(
        &self,
        features: &FeatureVector,
        horizon: PredictionHorizon,
    ) -> ComponentScores {
        let job = self.job(
            horizon,
            ModelType::Ensemble,
            Arc::new(features.clone()),
            self.weights.current(),
            HorizonOptions::default(),
        );
        let (short, long) = tokio::join!(job.call(ModelSlot::Short), job.call(ModelSlot::Long));
        ComponentScores { short, long }
    }
}

// ============================================================================
// Horizon job
// ============================================================================

/// Everything one horizon needs, owned so it can run on its own task
struct HorizonJob {
    models: ModelSet,
    config: RouterConfig,
    metrics: Arc<EngineMetrics>,
    weights: Arc<WeightTable>,
    features: Arc<FeatureVector>,
    horizon: PredictionHorizon,
    model_type: ModelType,
    options: HorizonOptions,
}

type SlotResult = Option<Result<ModelPrediction, ModelError>>;

fn split(result: SlotResult) -> (Option<ModelPrediction>, Option<ModelError>) {
    match result {
        Some(Ok(p)) => (Some(p), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    }
}

/// Score, confidence and provenance before decoration
struct Resolved {
    score: f64,
    confidence: f64,
    model_used: ModelUsed,
    weights: Vec<ModelWeight>,
    disagreement: f64,
}

impl HorizonJob {
    async fn run(self) -> (PredictionHorizon, EngineResult<HorizonPrediction>) {
        let started = Instant::now();
        let plan = plan_for(self.model_type, self.horizon, &self.config);
        debug!(horizon = %self.horizon, plan = plan.as_str(), "Routing horizon");

        let (short, long) = self.invoke(plan).await;
        let result = self.resolve(plan, short, long);
        self.metrics
            .record_horizon_latency(self.horizon.get(), started.elapsed());
        (self.horizon, result)
    }

    async fn call(&self, slot: ModelSlot) -> Result<ModelPrediction, ModelError> {
        let model = self.models.get(slot);
        let descriptor = model.descriptor();
        let started = Instant::now();
        let result = model.predict(&self.features, self.horizon).await;
        self.metrics
            .record_model_call(&descriptor.model_id, started.elapsed(), result.is_ok());

        match result {
            Ok(raw) => Ok(ModelPrediction {
                horizon: self.horizon,
                predicted_score: round6(raw.score),
                predicted_level: RiskLevel::from_score(raw.score),
                confidence: round6(raw.confidence),
                slot,
                model_id: descriptor.model_id,
                model_version: descriptor.version,
            }),
            Err(e) => {
                warn!(
                    model = %descriptor,
                    slot = slot.as_str(),
                    horizon = %self.horizon,
                    error = %e,
                    "Model invocation failed"
                );
                Err(e)
            }
        }
    }

    /// Call the models the plan needs; comparison needs both
    async fn invoke(&self, plan: RoutePlan) -> (SlotResult, SlotResult) {
        match (plan, self.options.include_comparison) {
            (RoutePlan::Short, false) => (Some(self.call(ModelSlot::Short).await), None),
            (RoutePlan::Long, false) => {
                let long = self.call(ModelSlot::Long).await;
                let short = if long.is_err() {
                    Some(self.call(ModelSlot::Short).await)
                } else {
                    None
                };
                (short, Some(long))
            }
            _ => {
                let (short, long) =
                    tokio::join!(self.call(ModelSlot::Short), self.call(ModelSlot::Long));
                (Some(short), Some(long))
            }
        }
    }

    fn single(&self, prediction: &ModelPrediction, model_used: ModelUsed, penalty: f64) -> Resolved {
        Resolved {
            score: prediction.predicted_score,
            confidence: prediction.confidence * penalty,
            model_used,
            weights: vec![ModelWeight {
                slot: prediction.slot,
                model_id: prediction.model_id.clone(),
                weight: 1.0,
            }],
            disagreement: 0.0,
        }
    }

    fn fallback(&self, prediction: &ModelPrediction, model_used: ModelUsed) -> Resolved {
        let (from, to) = match model_used {
            ModelUsed::LongFallback => ("short", "long"),
            _ => ("long", "short"),
        };
        self.metrics.record_fallback(from, to);
        warn!(
            horizon = %self.horizon,
            model_used = model_used.as_str(),
            "Serving degraded prediction from fallback model"
        );
        self.single(prediction, model_used, self.config.fallback_confidence_penalty)
    }

    fn blended(&self, short: &ModelPrediction, long: &ModelPrediction) -> Resolved {
        let weights = self.weights.weights_for(self.horizon);
        let outcome = blend(
            BlendComponent {
                score: short.predicted_score,
                confidence: short.confidence,
                weight: weights.short,
            },
            BlendComponent {
                score: long.predicted_score,
                confidence: long.confidence,
                weight: weights.long,
            },
            self.config.disagreement_penalty_scale,
        );
        Resolved {
            score: outcome.score,
            confidence: outcome.confidence,
            model_used: ModelUsed::Ensemble,
            weights: vec![
                ModelWeight {
                    slot: ModelSlot::Short,
                    model_id: short.model_id.clone(),
                    weight: round6(outcome.normalized_weights[0]),
                },
                ModelWeight {
                    slot: ModelSlot::Long,
                    model_id: long.model_id.clone(),
                    weight: round6(outcome.normalized_weights[1]),
                },
            ],
            disagreement: outcome.disagreement,
        }
    }

    fn resolve(
        &self,
        plan: RoutePlan,
        short: SlotResult,
        long: SlotResult,
    ) -> EngineResult<HorizonPrediction> {
        let (short_ok, short_err) = split(short);
        let (long_ok, long_err) = split(long);

        let surfaced = |primary: Option<ModelError>, secondary: Option<ModelError>| {
            EngineError::model(primary.or(secondary).unwrap_or_else(|| ModelError::Unavailable {
                model_id: "ensemble".into(),
                reason: "no model produced a prediction".into(),
            }))
        };

        let resolved = match plan {
            RoutePlan::Short => match &short_ok {
                Some(s) => self.single(s, ModelUsed::Short, 1.0),
                None => return Err(surfaced(short_err, None)),
            },
            RoutePlan::Long => match (&long_ok, &short_ok) {
                (Some(l), _) => self.single(l, ModelUsed::Long, 1.0),
                (None, Some(s)) => self.fallback(s, ModelUsed::ShortFallback),
                (None, None) => return Err(surfaced(long_err, short_err)),
            },
            RoutePlan::Blend => match (&short_ok, &long_ok) {
                (Some(s), Some(l)) => self.blended(s, l),
                (Some(s), None) => self.fallback(s, ModelUsed::ShortFallback),
                (None, Some(l)) => self.fallback(l, ModelUsed::LongFallback),
                (None, None) => return Err(surfaced(short_err, long_err)),
            },
        };

        let score = round6(resolved.score.clamp(0.0, 1.0));
        let confidence = round6(resolved.confidence.clamp(0.0, 1.0));

        let uncertainty = self.options.include_uncertainty.then(|| {
            let half = (1.0 - confidence) * self.config.uncertainty_scale + resolved.disagreement / 2.0;
            UncertaintyBounds {
                lower: round6((score - half).clamp(0.0, 1.0)),
                upper: round6((score + half).clamp(0.0, 1.0)),
            }
        });
        let comparison = self
            .options
            .include_comparison
            .then(|| ModelComparison::from_parts(short_ok.clone(), long_ok.clone()));

        Ok(HorizonPrediction {
            horizon: self.horizon,
            score,
            level: RiskLevel::from_score(score),
            confidence,
            model_used: resolved.model_used,
            degraded: resolved.model_used.is_fallback(),
            weights: resolved.weights,
            comparison,
            uncertainty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestLimits, RiskAssessmentRequest};
    use crate::routing::weights::BlendWeights;
    use crate::test_utils::MockModel;

    fn router_with(short: Arc<MockModel>, long: Arc<MockModel>) -> ModelEnsembleRouter {
        ModelEnsembleRouter::new(
            ModelSet::new(short, long),
            RouterConfig::default(),
            Arc::new(EngineMetrics::new()),
        )
    }

    fn normalized(request: RiskAssessmentRequest) -> NormalizedRequest {
        request.normalize(&RequestLimits::default()).unwrap()
    }

    #[tokio::test]
    async fn test_short_horizon_uses_short_model_only() {
        let short = Arc::new(MockModel::new("short", 0.2, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.8));
        let router = router_with(short.clone(), long.clone());

        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [3])), "fp")
            .await
            .unwrap();

        let p = result.prediction(3).unwrap();
        assert_eq!(p.model_used, ModelUsed::Short);
        assert_eq!(p.score, 0.2);
        assert!(!result.degraded);
        assert_eq!(short.call_count(), 1);
        assert_eq!(long.call_count(), 0);
    }

    #[tokio::test]
    async fn test_mid_horizon_blends() {
        let short = Arc::new(MockModel::new("short", 0.2, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.7));
        let router = router_with(short, long);

        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [6])), "fp")
            .await
            .unwrap();
        let p = result.prediction(6).unwrap();
        assert_eq!(p.model_used, ModelUsed::Ensemble);
        assert!((p.score - 0.4).abs() < 1e-9);
        assert!((p.confidence - 0.64).abs() < 1e-9);
        assert_eq!(p.weights.len(), 2);
    }

    #[tokio::test]
    async fn test_long_failure_falls_back_to_short() {
        let short = Arc::new(MockModel::new("short", 0.3, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.8));
        long.set_failing(true);
        let router = router_with(short, long);

        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [12])), "fp")
            .await
            .unwrap();
        let p = result.prediction(12).unwrap();
        assert_eq!(p.model_used, ModelUsed::ShortFallback);
        assert!(p.degraded);
        assert!((p.confidence - 0.72).abs() < 1e-9);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_short_failure_in_blend_uses_long() {
        let short = Arc::new(MockModel::new("short", 0.3, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.5));
        short.set_failing(true);
        let router = router_with(short, long);

        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [6])), "fp")
            .await
            .unwrap();
        let p = result.prediction(6).unwrap();
        assert_eq!(p.model_used, ModelUsed::LongFallback);
        assert!((p.confidence - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_only_failure_is_an_error() {
        let short = Arc::new(MockModel::new("short", 0.3, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.5));
        short.set_failing(true);
        let router = router_with(short, long.clone());

        let err = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [3])), "fp")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelInvocation { .. }));
        assert_eq!(long.call_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_multi_horizon_failure_is_reported_per_horizon() {
        let short = Arc::new(MockModel::new("short", 0.3, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.5));
        short.set_failing(true);
        let router = router_with(short, long);

        // 3m needs the short model (fails); 12m is served by the long model
        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [12, 3])), "fp")
            .await
            .unwrap();

        assert_eq!(result.horizons.len(), 2);
        assert_eq!(result.horizons[0].horizon().get(), 3);
        assert!(matches!(result.horizons[0], HorizonOutcome::Failed { .. }));
        assert_eq!(result.prediction(12).unwrap().model_used, ModelUsed::Long);
        assert!(result.degraded);
        assert_eq!(result.failed_horizons(), 1);
    }

    #[tokio::test]
    async fn test_all_models_failing_fails_request() {
        let short = Arc::new(MockModel::new("short", 0.3, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.5));
        short.set_failing(true);
        long.set_failing(true);
        let router = router_with(short, long);

        let err = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [6, 12])), "fp")
            .await
            .unwrap_err();
        assert!(err.counts_toward_breaker());
    }

    #[tokio::test]
    async fn test_comparison_and_uncertainty() {
        let short = Arc::new(MockModel::new("short", 0.2, 0.9));
        let long = Arc::new(MockModel::new("long", 0.6, 0.8));
        let router = router_with(short.clone(), long.clone());

        let request = RiskAssessmentRequest::new("acme", [3])
            .with_model_comparison(true)
            .with_uncertainty(true);
        let result = router.predict(&normalized(request), "fp").await.unwrap();
        let p = result.prediction(3).unwrap();

        // Comparison forces both models even on a short-only route
        assert_eq!(long.call_count(), 1);
        let cmp = p.comparison.as_ref().unwrap();
        assert!((cmp.score_spread.unwrap() - 0.4).abs() < 1e-9);

        let bounds = p.uncertainty.unwrap();
        assert!(bounds.lower <= p.score && p.score <= bounds.upper);
        assert!((bounds.width() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_weight_swap_changes_blend_and_version() {
        let short = Arc::new(MockModel::new("short", 0.0, 0.9));
        let long = Arc::new(MockModel::new("long", 1.0, 0.9));
        let router = router_with(short, long);
        let before = router.routing_version();

        router.apply_weights(
            WeightTable::equal().with_horizon(6, BlendWeights::from_short_share(0.75)),
        );
        assert_ne!(router.routing_version(), before);

        let result = router
            .predict(&normalized(RiskAssessmentRequest::new("acme", [6])), "fp")
            .await
            .unwrap();
        assert!((result.prediction(6).unwrap().score - 0.25).abs() < 1e-9);
        assert_eq!(result.weights_version, 1);
    }

    #[tokio::test]
    async fn test_score_components_calls_both() {
        let short = Arc::new(MockModel::new("short", 0.1, 0.9));
        let long = Arc::new(MockModel::new("long", 0.7, 0.6));
        long.set_failing(true);
        let router = router_with(short, long);

        let scores = router
            .score_components(&FeatureVector::from_signals(&Default::default()), PredictionHorizon::months(6))
            .await;
        assert_eq!(scores.short.unwrap().predicted_score, 0.1);
        assert!(scores.long.is_err());
    }
}
