//! Validation Harness
//!
//! Certifies the ensemble against labelled data before (and after) a
//! deployment:
//!
//! ```text
//!   dataset ──► score both models per horizon (bounded concurrency)
//!                 │
//!                 ▼
//!   seeded shuffle ──► k folds ──► fit short/long share on k-1 folds
//!                                     │ (grid search, min MAE)
//!                                     ▼
//!                                  blend held-out fold
//!                 │
//!                 ▼
//!   pooled metrics + calibration + comparison ──► targets ──► recommendations
//! ```
//!
//! Targets and calibration apply to the predictor `auto` routing serves at
//! each horizon: the short model alone, the long model alone, or the fitted
//! blend. The blend is cross-validated at every horizon regardless, so the
//! comparison always reports what blending would gain.
//!
//! Model outputs are computed once per sample and horizon; every fold
//! reuses them, so a run costs `samples × horizons × 2` model calls
//! regardless of the fold count.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::calibration::{calibrate, CalibrationPoint, CalibrationReport};
use super::dataset::{DatasetError, LabeledDataset, SyntheticSpec};
use super::history::{HistoryError, ValidationHistoryStore};
use super::stats::{level_accuracy, mae, MetricSet};
use crate::metrics::EngineMetrics;
use crate::model::ModelError;
use crate::routing::{blend, plan_for, BlendComponent, BlendWeights, ModelEnsembleRouter, RoutePlan, WeightTable};
use crate::request::{ModelType, PredictionHorizon};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid validation config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("scoring {business_id} at {horizon} months failed: {source}")]
    Scoring {
        business_id: String,
        horizon: u32,
        #[source]
        source: ModelError,
    },

    /// Deployment gate: the run completed but missed at least one target
    #[error("validation targets not met: {}", failures.join("; "))]
    TargetNotMet { run_id: Uuid, failures: Vec<String> },

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Where the labelled data comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    Synthetic(SyntheticSpec),
    Jsonl { path: PathBuf },
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self::Synthetic(SyntheticSpec::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub folds: usize,
    /// Seed for the fold shuffle
    pub seed: u64,
    pub horizons: Vec<u32>,
    /// Accuracy target for horizons without an explicit entry
    pub default_accuracy_target: f64,
    pub accuracy_targets: BTreeMap<u32, f64>,
    pub max_mae: Option<f64>,
    pub max_calibration_error: Option<f64>,
    /// Step of the short-share grid searched per fold
    pub weight_grid_step: f64,
    /// Samples scored concurrently
    pub concurrency: usize,
    /// Interior confidence bucket boundaries
    pub confidence_buckets: Vec<f64>,
    pub dataset: DatasetSource,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            seed: 42,
            horizons: vec![3, 6, 9, 12],
            default_accuracy_target: 0.8,
            accuracy_targets: BTreeMap::new(),
            max_mae: None,
            max_calibration_error: None,
            weight_grid_step: 0.1,
            concurrency: 16,
            confidence_buckets: vec![0.7],
            dataset: DatasetSource::default(),
        }
    }
}

impl ValidationConfig {
    #[must_use]
    pub fn accuracy_target(&self, horizon: u32) -> f64 {
        self.accuracy_targets
            .get(&horizon)
            .copied()
            .unwrap_or(self.default_accuracy_target)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidConfig(msg));
        if self.folds < 2 {
            return invalid(format!("folds must be at least 2, got {}", self.folds));
        }
        if self.horizons.is_empty() {
            return invalid("at least one horizon is required".into());
        }
        if !(self.weight_grid_step > 0.0 && self.weight_grid_step <= 0.5) {
            return invalid(format!(
                "weight_grid_step must be in (0, 0.5], got {}",
                self.weight_grid_step
            ));
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be positive".into());
        }
        let targets = std::iter::once(self.default_accuracy_target)
            .chain(self.accuracy_targets.values().copied())
            .chain(self.max_calibration_error);
        for target in targets {
            if !(0.0..=1.0).contains(&target) {
                return invalid(format!("target {target} is outside [0, 1]"));
            }
        }
        if self.max_mae.is_some_and(|m| !m.is_finite() || m < 0.0) {
            return invalid("max_mae must be a non-negative number".into());
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// Held-out metrics of one fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub train_size: usize,
    pub test_size: usize,
    /// Short model share fitted on the training folds
    pub short_share: f64,
    /// Held-out metrics of the served predictor
    pub metrics: MetricSet,
}

/// Ensemble against each single model, over the same samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonComparison {
    pub ensemble_mae: f64,
    pub short_mae: f64,
    pub long_mae: f64,
    pub ensemble_accuracy: f64,
    pub short_accuracy: f64,
    pub long_accuracy: f64,
    /// Best single-model MAE minus ensemble MAE; positive when blending helps
    pub improvement: f64,
    pub ensemble_outperforms: bool,
    /// Weights fitted on the full dataset
    pub recommended_weights: BlendWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Accuracy,
    Mae,
    CalibrationError,
}

impl TargetMetric {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Mae => "mae",
            Self::CalibrationError => "calibration_error",
        }
    }

    fn higher_is_better(self) -> bool {
        matches!(self, Self::Accuracy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCheck {
    pub horizon: u32,
    pub metric: TargetMetric,
    pub target: f64,
    pub actual: f64,
    pub met: bool,
}

impl TargetCheck {
    fn new(horizon: u32, metric: TargetMetric, target: f64, actual: f64) -> Self {
        let met = if metric.higher_is_better() {
            actual >= target
        } else {
            actual <= target
        };
        Self {
            horizon,
            metric,
            target,
            actual,
            met,
        }
    }

    /// How far the metric is from its target, relative to the target
    fn shortfall(&self) -> f64 {
        let gap = if self.metric.higher_is_better() {
            self.target - self.actual
        } else {
            self.actual - self.target
        };
        gap.max(0.0) / self.target.abs().max(1e-9)
    }

    fn describe(&self) -> String {
        let op = if self.metric.higher_is_better() { "<" } else { ">" };
        format!(
            "{}m {} {:.4} {op} {:.4}",
            self.horizon,
            self.metric.as_str(),
            self.actual,
            self.target
        )
    }
}

/// Actionable follow-up, ranked by severity (rank 1 first)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: usize,
    pub horizon: u32,
    /// Sub-metric the recommendation addresses
    pub metric: String,
    pub severity: f64,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonValidation {
    pub horizon: u32,
    pub samples: usize,
    /// Predictor `auto` routing serves at this horizon
    pub route: RoutePlan,
    /// Served predictor, pooled over every held-out fold
    pub metrics: MetricSet,
    pub folds: Vec<FoldResult>,
    pub calibration: CalibrationReport,
    pub comparison: HorizonComparison,
    pub targets: Vec<TargetCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dataset: String,
    pub dataset_size: usize,
    pub folds: usize,
    pub seed: u64,
    pub models_version: String,
    /// Weight table version in effect while the models were scored
    pub weights_version: u64,
    pub horizons: Vec<HorizonValidation>,
    pub recommendations: Vec<Recommendation>,
    pub target_achieved: bool,
}

impl ValidationResult {
    #[must_use]
    pub fn horizon(&self, months: u32) -> Option<&HorizonValidation> {
        self.horizons.iter().find(|h| h.horizon == months)
    }

    /// Every target check that failed
    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetCheck> {
        self.horizons.iter().flat_map(|h| &h.targets).filter(|t| !t.met)
    }

    /// Gate a deployment on this run
    pub fn ensure_targets(&self) -> Result<(), ValidationError> {
        if self.target_achieved {
            return Ok(());
        }
        Err(ValidationError::TargetNotMet {
            run_id: self.run_id,
            failures: self.failed_targets().map(TargetCheck::describe).collect(),
        })
    }

    /// Weight table with the recommended weights of every blended horizon
    #[must_use]
    pub fn weight_table(&self) -> WeightTable {
        self.horizons
            .iter()
            .filter(|h| h.route == RoutePlan::Blend)
            .fold(WeightTable::equal(), |table, h| {
                table.with_horizon(h.horizon, h.comparison.recommended_weights)
            })
            .with_source(format!("validation:{}", self.run_id))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Both model outputs and the label for one sample at one horizon
#[derive(Debug, Clone, Copy)]
struct Scored {
    short: BlendComponent,
    long: BlendComponent,
    actual: f64,
}

impl Scored {
    fn blended(&self, share: f64, penalty_scale: f64) -> (f64, f64) {
        let weights = BlendWeights::from_short_share(share);
        let out = blend(
            BlendComponent {
                weight: weights.short,
                ..self.short
            },
            BlendComponent {
                weight: weights.long,
                ..self.long
            },
            penalty_scale,
        );
        (out.score, out.confidence)
    }

    /// Score and confidence of the predictor `route` serves
    fn served(&self, route: RoutePlan, share: f64, penalty_scale: f64) -> (f64, f64) {
        match route {
            RoutePlan::Short => (self.short.score, self.short.confidence),
            RoutePlan::Long => (self.long.score, self.long.confidence),
            RoutePlan::Blend => self.blended(share, penalty_scale),
        }
    }
}

/// Short share on the grid with the lowest blended MAE; ties keep the share
/// closest to an equal split
fn fit_short_share(rows: &[&Scored], step: f64) -> f64 {
    if rows.is_empty() {
        return 0.5;
    }
    let steps = (1.0 / step).round().max(1.0) as usize;
    let error_at = |share: f64| {
        rows.iter()
            .map(|r| (r.short.score * share + r.long.score * (1.0 - share) - r.actual).abs())
            .sum::<f64>()
    };

    let mut best: (f64, f64) = (0.5, error_at(0.5));
    for i in 0..=steps {
        let share = (i as f64 / steps as f64).min(1.0);
        let err = error_at(share);
        let closer = (share - 0.5).abs() < (best.0 - 0.5).abs();
        if err < best.1 - 1e-12 || ((err - best.1).abs() <= 1e-12 && closer) {
            best = (share, err);
        }
    }
    (best.0 * 1e4).round() / 1e4
}

/// Runs validation against a router and records results
pub struct ValidationHarness {
    router: Arc<ModelEnsembleRouter>,
    history: Arc<dyn ValidationHistoryStore>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ValidationHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationHarness")
            .field("history", &self.history.name())
            .finish_non_exhaustive()
    }
}

impl ValidationHarness {
    pub fn new(
        router: Arc<ModelEnsembleRouter>,
        history: Arc<dyn ValidationHistoryStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            router,
            history,
            metrics,
        }
    }

    #[must_use]
    pub fn history(&self) -> &Arc<dyn ValidationHistoryStore> {
        &self.history
    }

    /// Build the configured dataset, then validate against it
    pub async fn validate(&self, config: &ValidationConfig) -> Result<ValidationResult, ValidationError> {
        config.validate()?;
        let dataset = match &config.dataset {
            DatasetSource::Synthetic(spec) => LabeledDataset::synthetic(spec)?,
            DatasetSource::Jsonl { path } => LabeledDataset::from_jsonl(path).await?,
        };
        self.validate_model(config, &dataset).await
    }

    /// Cross-validate the ensemble on `dataset`
    ///
    /// Returns the result even when targets are missed; call
    /// [`ValidationResult::ensure_targets`] to gate on it.
    pub async fn validate_model(
        &self,
        config: &ValidationConfig,
        dataset: &LabeledDataset,
    ) -> Result<ValidationResult, ValidationError> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(DatasetError::Empty.into());
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let weights_version = self.router.current_weights().version;
        info!(
            %run_id,
            dataset = %dataset.name,
            samples = dataset.len(),
            folds = config.folds,
            "Starting validation run"
        );

        let mut horizons = Vec::with_capacity(config.horizons.len());
        for &months in &config.horizons {
            let horizon = self.validate_horizon(config, dataset, months).await?;
            info!(
                %run_id,
                horizon = months,
                route = horizon.route.as_str(),
                accuracy = horizon.metrics.accuracy,
                mae = horizon.metrics.mae,
                calibration_error = horizon.calibration.error,
                "Horizon validated"
            );
            horizons.push(horizon);
        }

        let target_achieved = horizons.iter().all(|h| h.targets.iter().all(|t| t.met));
        let recommendations = recommend(&horizons, &self.router.current_weights());
        let result = ValidationResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dataset: dataset.name.clone(),
            dataset_size: dataset.len(),
            folds: config.folds,
            seed: config.seed,
            models_version: self.router.models().version(),
            weights_version,
            horizons,
            recommendations,
            target_achieved,
        };

        self.metrics.record_validation(target_achieved);
        if let Err(e) = self.history.append(&result).await {
            warn!(%run_id, store = self.history.name(), error = %e, "Failed to persist validation result");
        }
        if target_achieved {
            info!(%run_id, "Validation targets achieved");
        } else {
            warn!(
                %run_id,
                failed = result.failed_targets().count(),
                "Validation targets not met"
            );
        }
        Ok(result)
    }

    async fn score(
        &self,
        config: &ValidationConfig,
        dataset: &LabeledDataset,
        horizon: PredictionHorizon,
    ) -> Result<Vec<Scored>, ValidationError> {
        let router = &self.router;
        stream::iter(
            dataset
                .samples
                .iter()
                .filter_map(|s| s.outcome(horizon).map(|actual| (s, actual))),
        )
        .map(|(sample, actual)| async move {
            let scores = router.score_components(&sample.features(), horizon).await;
            let failed = |source| ValidationError::Scoring {
                business_id: sample.business_id.clone(),
                horizon: horizon.get(),
                source,
            };
            let short = scores.short.map_err(failed)?;
            let long = scores.long.map_err(failed)?;
            Ok(Scored {
                short: BlendComponent {
                    score: short.predicted_score,
                    confidence: short.confidence,
                    weight: 0.5,
                },
                long: BlendComponent {
                    score: long.predicted_score,
                    confidence: long.confidence,
                    weight: 0.5,
                },
                actual,
            })
        })
        .buffered(config.concurrency)
        .try_collect()
        .await
    }

    async fn validate_horizon(
        &self,
        config: &ValidationConfig,
        dataset: &LabeledDataset,
        months: u32,
    ) -> Result<HorizonValidation, ValidationError> {
        let horizon = PredictionHorizon::months(months);
        let rows = self.score(config, dataset, horizon).await?;
        if rows.len() < config.folds {
            return Err(ValidationError::InvalidConfig(format!(
                "horizon {months} has {} labelled samples, fewer than {} folds",
                rows.len(),
                config.folds
            )));
        }

        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(config.seed));
        let mut fold_of = vec![0usize; rows.len()];
        for (position, &row) in order.iter().enumerate() {
            fold_of[row] = position % config.folds;
        }

        let route = plan_for(ModelType::Auto, horizon, self.router.config());
        let penalty_scale = self.router.config().disagreement_penalty_scale;
        let mut predicted = Vec::with_capacity(rows.len());
        let mut blended = Vec::with_capacity(rows.len());
        let mut actual = Vec::with_capacity(rows.len());
        let mut points = Vec::with_capacity(rows.len());
        let mut folds = Vec::with_capacity(config.folds);

        for fold in 0..config.folds {
            let train: Vec<&Scored> = rows
                .iter()
                .zip(&fold_of)
                .filter(|(_, f)| **f != fold)
                .map(|(r, _)| r)
                .collect();
            let share = fit_short_share(&train, config.weight_grid_step);

            let mut fold_predicted = Vec::new();
            let mut fold_actual = Vec::new();
            for (row, _) in rows.iter().zip(&fold_of).filter(|(_, f)| **f == fold) {
                let (score, confidence) = row.served(route, share, penalty_scale);
                blended.push(row.blended(share, penalty_scale).0);
                fold_predicted.push(score);
                fold_actual.push(row.actual);
                points.push(CalibrationPoint {
                    confidence,
                    predicted: score,
                    actual: row.actual,
                });
            }

            folds.push(FoldResult {
                fold,
                train_size: train.len(),
                test_size: fold_predicted.len(),
                short_share: share,
                metrics: MetricSet::compute(&fold_predicted, &fold_actual),
            });
            predicted.extend(fold_predicted);
            actual.extend(fold_actual);
        }

        let metrics = MetricSet::compute(&predicted, &actual);
        let calibration = calibrate(&points, &config.confidence_buckets);
        let comparison = compare(
            &rows,
            &MetricSet::compute(&blended, &actual),
            config.weight_grid_step,
        );

        let mut targets = vec![TargetCheck::new(
            months,
            TargetMetric::Accuracy,
            config.accuracy_target(months),
            metrics.accuracy,
        )];
        if let Some(max) = config.max_mae {
            targets.push(TargetCheck::new(months, TargetMetric::Mae, max, metrics.mae));
        }
        if let Some(max) = config.max_calibration_error {
            targets.push(TargetCheck::new(
                months,
                TargetMetric::CalibrationError,
                max,
                calibration.error,
            ));
        }

        Ok(HorizonValidation {
            horizon: months,
            samples: rows.len(),
            route,
            metrics,
            folds,
            calibration,
            comparison,
            targets,
        })
    }
}

fn compare(rows: &[Scored], ensemble: &MetricSet, step: f64) -> HorizonComparison {
    let actual: Vec<f64> = rows.iter().map(|r| r.actual).collect();
    let short: Vec<f64> = rows.iter().map(|r| r.short.score).collect();
    let long: Vec<f64> = rows.iter().map(|r| r.long.score).collect();

    let short_mae = mae(&short, &actual);
    let long_mae = mae(&long, &actual);
    let improvement = short_mae.min(long_mae) - ensemble.mae;
    let all: Vec<&Scored> = rows.iter().collect();

    HorizonComparison {
        ensemble_mae: ensemble.mae,
        short_mae,
        long_mae,
        ensemble_accuracy: ensemble.accuracy,
        short_accuracy: level_accuracy(&short, &actual),
        long_accuracy: level_accuracy(&long, &actual),
        improvement,
        ensemble_outperforms: improvement > 0.0,
        recommended_weights: BlendWeights::from_short_share(fit_short_share(&all, step)),
    }
}

fn recommend(horizons: &[HorizonValidation], current: &WeightTable) -> Vec<Recommendation> {
    let mut recs = Vec::new();

    for h in horizons {
        for check in h.targets.iter().filter(|t| !t.met) {
            let action = match check.metric {
                TargetMetric::Accuracy => format!(
                    "Accuracy at {}m is {:.1}% against a {:.1}% target; retrain or recalibrate the {} model",
                    h.horizon,
                    check.actual * 100.0,
                    check.target * 100.0,
                    served_model(h)
                ),
                TargetMetric::Mae => format!(
                    "MAE at {}m is {:.4} against a ceiling of {:.4}; review feature coverage for this horizon",
                    h.horizon, check.actual, check.target
                ),
                TargetMetric::CalibrationError => {
                    let bucket = h
                        .calibration
                        .worst_bucket()
                        .map(|b| {
                            let direction = if b.gap > 0.0 { "overconfident" } else { "underconfident" };
                            format!(" ({direction} in [{:.2}, {:.2}])", b.lower, b.upper)
                        })
                        .unwrap_or_default();
                    format!(
                        "Calibration error at {}m is {:.4} against a ceiling of {:.4}{bucket}; rescale model confidence",
                        h.horizon, check.actual, check.target
                    )
                }
            };
            recs.push(Recommendation {
                rank: 0,
                horizon: h.horizon,
                metric: check.metric.as_str().to_string(),
                severity: 1.0 + check.shortfall(),
                action,
            });
        }

        // Weights only matter where auto routing blends
        if h.route != RoutePlan::Blend {
            continue;
        }

        let fitted = h.comparison.recommended_weights.short_share();
        let live = current.weights_for(PredictionHorizon::months(h.horizon)).short_share();
        if (fitted - live).abs() >= 0.1 {
            recs.push(Recommendation {
                rank: 0,
                horizon: h.horizon,
                metric: "blend_weights".into(),
                severity: (fitted - live).abs(),
                action: format!(
                    "Shift the {}m short-model share from {live:.2} to {fitted:.2}",
                    h.horizon
                ),
            });
        }

        if !h.comparison.ensemble_outperforms {
            recs.push(Recommendation {
                rank: 0,
                horizon: h.horizon,
                metric: "ensemble_mae".into(),
                severity: (-h.comparison.improvement).max(0.0),
                action: format!(
                    "Ensemble MAE at {}m does not beat the {} model alone; consider routing this horizon to a single model",
                    h.horizon,
                    stronger_model(&h.comparison)
                ),
            });
        }
    }

    recs.sort_by(|a, b| {
        b.severity
            .total_cmp(&a.severity)
            .then_with(|| a.horizon.cmp(&b.horizon))
    });
    for (i, rec) in recs.iter_mut().enumerate() {
        rec.rank = i + 1;
    }
    recs
}

/// Model to retrain when the served predictor misses a target
fn served_model(h: &HorizonValidation) -> &'static str {
    match h.route {
        RoutePlan::Short => "short-horizon",
        RoutePlan::Long => "long-horizon",
        RoutePlan::Blend if h.comparison.short_mae > h.comparison.long_mae => "short-horizon",
        RoutePlan::Blend => "long-horizon",
    }
}

fn stronger_model(c: &HorizonComparison) -> &'static str {
    if c.short_mae <= c.long_mae {
        "short-horizon"
    } else {
        "long-horizon"
    }
}
