//! Closed-form synthetic models
//!
//! Deterministic stand-ins for the trained models, used by the benchmark
//! runner, the synthetic validation dataset and demo deployments that run
//! without artifacts. Both profiles are imperfect views of the same
//! reference risk surface ([`reference_risk`]), which is what the dataset
//! generator labels businesses with, so blending the two is measurably
//! better than either alone.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::features::FeatureVector;
use super::traits::{read_artifact, ModelAdapter, ModelDescriptor, ModelError, ModelKind, RawPrediction};
use super::tree::sigmoid;
use crate::request::PredictionHorizon;

/// Components of the reference logit
#[derive(Debug, Clone, Copy)]
struct LogitParts {
    statics: f64,
    history: f64,
    horizon: f64,
}

fn logit_parts(features: &FeatureVector, horizon: PredictionHorizon) -> LogitParts {
    let v = features.values();
    let statics = -1.6 - 0.35 * (v[0] - 13.8) - 0.06 * v[1] - 0.1 * (v[2] - 3.0)
        + 0.025 * v[3]
        + 0.35 * v[4]
        + 1.6 * v[5]
        + 1.2 * v[6]
        + 0.6 * v[7];

    // Stress over the most recent six months
    let recent = &features.history()[features.history().len().saturating_sub(6)..];
    let history = if recent.is_empty() {
        0.0
    } else {
        2.5 * (1.0 - recent.iter().sum::<f64>() / recent.len() as f64)
    };

    LogitParts {
        statics,
        history,
        horizon: 0.08 * f64::from(horizon.get()),
    }
}

/// Ground-truth risk surface used to label synthetic businesses
#[must_use]
pub fn reference_risk(features: &FeatureVector, horizon: PredictionHorizon) -> f64 {
    let p = logit_parts(features, horizon);
    sigmoid(p.statics + p.history + p.horizon)
}

/// Weights a synthetic model applies to the reference logit parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticProfile {
    pub model_id: String,
    pub version: String,
    pub static_weight: f64,
    pub history_weight: f64,
    pub horizon_weight: f64,
    pub bias: f64,
    /// Confidence at horizon 0 and its change per month of horizon
    pub base_confidence: f64,
    pub confidence_slope: f64,
    /// Extra confidence per month of payment history (capped at 12 months)
    #[serde(default)]
    pub history_confidence: f64,
}

impl SyntheticProfile {
    /// Feature-driven profile that barely reads payment history
    #[must_use]
    pub fn short_horizon() -> Self {
        Self {
            model_id: "synthetic-short".into(),
            version: "1".into(),
            static_weight: 1.0,
            history_weight: 0.3,
            horizon_weight: 0.5,
            bias: 0.1,
            base_confidence: 0.95,
            confidence_slope: -0.03,
            history_confidence: 0.0,
        }
    }

    /// History-driven profile with a slightly muted view of static features
    #[must_use]
    pub fn long_horizon() -> Self {
        Self {
            model_id: "synthetic-long".into(),
            version: "1".into(),
            static_weight: 0.85,
            history_weight: 1.0,
            horizon_weight: 1.0,
            bias: -0.1,
            base_confidence: 0.6,
            confidence_slope: 0.01,
            history_confidence: 0.015,
        }
    }

    fn predict(&self, features: &FeatureVector, horizon: PredictionHorizon) -> Option<RawPrediction> {
        let p = logit_parts(features, horizon);
        let logit = self.static_weight * p.statics
            + self.history_weight * p.history
            + self.horizon_weight * p.horizon
            + self.bias;
        let history_months = features.history().len().min(12) as f64;
        let confidence = self.base_confidence
            + self.confidence_slope * f64::from(horizon.get())
            + self.history_confidence * history_months;
        RawPrediction::checked(sigmoid(logit), confidence)
    }
}

/// Adapter around a [`SyntheticProfile`] with optional simulated latency
pub struct SyntheticModel {
    profile: RwLock<SyntheticProfile>,
    latency: Duration,
}

impl SyntheticModel {
    #[must_use]
    pub fn new(profile: SyntheticProfile) -> Self {
        Self {
            profile: RwLock::new(profile),
            latency: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn short_horizon() -> Self {
        Self::new(SyntheticProfile::short_horizon())
    }

    #[must_use]
    pub fn long_horizon() -> Self {
        Self::new(SyntheticProfile::long_horizon())
    }

    /// Sleep this long on every prediction
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl ModelAdapter for SyntheticModel {
    fn descriptor(&self) -> ModelDescriptor {
        let profile = self.profile.read();
        ModelDescriptor {
            model_id: profile.model_id.clone(),
            version: profile.version.clone(),
            kind: ModelKind::Synthetic,
        }
    }

    async fn load_model(&self, path: &Path) -> Result<(), ModelError> {
        let raw = read_artifact(path).await?;
        let profile: SyntheticProfile =
            serde_json::from_str(&raw).map_err(|e| ModelError::InvalidArtifact {
                model_id: self.profile.read().model_id.clone(),
                reason: e.to_string(),
            })?;
        *self.profile.write() = profile;
        Ok(())
    }

    async fn predict(
        &self,
        features: &FeatureVector,
        horizon: PredictionHorizon,
    ) -> Result<RawPrediction, ModelError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let profile = self.profile.read().clone();
        profile
            .predict(features, horizon)
            .ok_or_else(|| ModelError::Inference {
                model_id: profile.model_id.clone(),
                reason: "non-finite output".into(),
            })
    }
}
