//! Prediction and result types
//!
//! These are the values that travel back to callers and into the result
//! cache (as JSON), so everything here is `Serialize + Deserialize`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Stage;
use crate::request::PredictionHorizon;

/// Discrete risk band derived from a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Band thresholds: `[0, 0.25)` low, `[0.25, 0.5)` medium,
    /// `[0.5, 0.75)` high, `[0.75, 1]` critical
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < 0.25 {
            Self::Low
        } else if score < 0.5 {
            Self::Medium
        } else if score < 0.75 {
            Self::High
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Which model slot served a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSlot {
    /// Tree ensemble, strongest on horizons up to a few months
    Short,
    /// Sequence model, strongest on long horizons
    Long,
}

impl ModelSlot {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

/// How a horizon's final score was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelUsed {
    Short,
    Long,
    Ensemble,
    /// Long model failed, short model served alone
    ShortFallback,
    /// Short model failed inside a blend, long model served alone
    LongFallback,
}

impl ModelUsed {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
            Self::Ensemble => "ensemble",
            Self::ShortFallback => "short_fallback",
            Self::LongFallback => "long_fallback",
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::ShortFallback | Self::LongFallback)
    }
}

impl fmt::Display for ModelUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for ModelUsed {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// A single model's output for one horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub horizon: PredictionHorizon,
    pub predicted_score: f64,
    pub predicted_level: RiskLevel,
    pub confidence: f64,
    pub slot: ModelSlot,
    pub model_id: String,
    pub model_version: String,
}

/// Weight a model carried in the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeight {
    pub slot: ModelSlot,
    pub model_id: String,
    pub weight: f64,
}

/// Side-by-side view of both models for one horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub short: Option<ModelPrediction>,
    pub long: Option<ModelPrediction>,
    /// `|short - long|` when both models answered
    pub score_spread: Option<f64>,
    /// Both models put the business in the same risk band
    pub levels_agree: Option<bool>,
}

impl ModelComparison {
    pub(crate) fn from_parts(short: Option<ModelPrediction>, long: Option<ModelPrediction>) -> Self {
        let (score_spread, levels_agree) = match (&short, &long) {
            (Some(s), Some(l)) => (
                Some((s.predicted_score - l.predicted_score).abs()),
                Some(s.predicted_level == l.predicted_level),
            ),
            _ => (None, None),
        };
        Self {
            short,
            long,
            score_spread,
            levels_agree,
        }
    }
}

/// Interval around a score, clamped to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyBounds {
    pub lower: f64,
    pub upper: f64,
}

impl UncertaintyBounds {
    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Final answer for one horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonPrediction {
    pub horizon: PredictionHorizon,
    pub score: f64,
    pub level: RiskLevel,
    pub confidence: f64,
    pub model_used: ModelUsed,
    pub degraded: bool,
    pub weights: Vec<ModelWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ModelComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<UncertaintyBounds>,
}

/// Per-horizon outcome inside a multi-horizon result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HorizonOutcome {
    Scored(HorizonPrediction),
    Failed {
        horizon: PredictionHorizon,
        stage: Stage,
        error: String,
    },
}

impl HorizonOutcome {
    #[must_use]
    pub fn horizon(&self) -> PredictionHorizon {
        match self {
            Self::Scored(p) => p.horizon,
            Self::Failed { horizon, .. } => *horizon,
        }
    }

    #[must_use]
    pub fn prediction(&self) -> Option<&HorizonPrediction> {
        match self {
            Self::Scored(p) => Some(p),
            Self::Failed { .. } => None,
        }
    }
}

/// Complete result of one assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub business_id: String,
    /// Hex fingerprint the result is cached under
    pub fingerprint: String,
    pub horizons: Vec<HorizonOutcome>,
    /// Any horizon fell back or failed
    pub degraded: bool,
    /// Model set the result was computed with (`short@v+long@v`)
    pub models_version: String,
    pub weights_version: u64,
    pub computed_at: DateTime<Utc>,
}

impl EnsembleResult {
    /// Look up the outcome for a horizon
    #[must_use]
    pub fn horizon(&self, months: u32) -> Option<&HorizonOutcome> {
        self.horizons.iter().find(|o| o.horizon().get() == months)
    }

    /// Scored prediction for a horizon, if it succeeded
    #[must_use]
    pub fn prediction(&self, months: u32) -> Option<&HorizonPrediction> {
        self.horizon(months).and_then(HorizonOutcome::prediction)
    }

    #[must_use]
    pub fn failed_horizons(&self) -> usize {
        self.horizons
            .iter()
            .filter(|o| matches!(o, HorizonOutcome::Failed { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.2499), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.25), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.75), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Critical);
    }

    #[test]
    fn test_model_used_labels() {
        assert_eq!(ModelUsed::ShortFallback, "short_fallback");
        assert_eq!(
            serde_json::to_string(&ModelUsed::LongFallback).unwrap(),
            "\"long_fallback\""
        );
        assert!(ModelUsed::ShortFallback.is_fallback());
        assert!(!ModelUsed::Ensemble.is_fallback());
    }

    #[test]
    fn test_failed_outcome_serialization() {
        let outcome = HorizonOutcome::Failed {
            horizon: PredictionHorizon::months(12),
            stage: Stage::Model,
            error: "model unavailable".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["horizon"], 12);

        let back: HorizonOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_comparison_spread() {
        let make = |slot, score| ModelPrediction {
            horizon: PredictionHorizon::months(6),
            predicted_score: score,
            predicted_level: RiskLevel::from_score(score),
            confidence: 0.9,
            slot,
            model_id: slot_id(slot),
            model_version: "1".into(),
        };
        fn slot_id(slot: ModelSlot) -> String {
            slot.as_str().to_string()
        }

        let cmp = ModelComparison::from_parts(
            Some(make(ModelSlot::Short, 0.2)),
            Some(make(ModelSlot::Long, 0.6)),
        );
        assert!((cmp.score_spread.unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(cmp.levels_agree, Some(false));

        let partial = ModelComparison::from_parts(Some(make(ModelSlot::Short, 0.2)), None);
        assert_eq!(partial.score_spread, None);
    }
}
