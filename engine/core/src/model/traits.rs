//! Model Adapter Traits
//!
//! Every scoring model sits behind [`ModelAdapter`]. The router only ever
//! talks to this trait, so tree ensembles, recurrent models, synthetic
//! models and test doubles are interchangeable.
//!
//! # Design Philosophy
//!
//! Adapters own their loaded artifact and swap it atomically on reload.
//! A reload changes [`ModelDescriptor::version`], which is part of every
//! cache key, so stale results age out without explicit invalidation.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::features::FeatureVector;
use crate::request::PredictionHorizon;

/// Model family behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Gradient-boosted decision trees
    TreeEnsemble,
    /// Gated recurrent network over payment history
    Sequence,
    /// Closed-form model for benchmarks and demos
    Synthetic,
}

/// Identity of the model an adapter currently serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub version: String,
    pub kind: ModelKind,
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.version)
    }
}

/// Raw adapter output before routing decorates it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    /// Risk score in `[0, 1]`
    pub score: f64,
    /// Self-reported confidence in `[0, 1]`
    pub confidence: f64,
}

impl RawPrediction {
    /// Build a prediction, clamping both values into `[0, 1]`
    ///
    /// Returns `None` for non-finite input so adapters can turn it into an
    /// inference error instead of leaking NaN downstream.
    #[must_use]
    pub fn checked(score: f64, confidence: f64) -> Option<Self> {
        if !score.is_finite() || !confidence.is_finite() {
            return None;
        }
        Some(Self {
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// Errors raised by model adapters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("model `{model_id}` is not loaded")]
    NotLoaded { model_id: String },

    #[error("failed to read artifact {}: {message}", path.display())]
    ArtifactRead { path: PathBuf, message: String },

    #[error("invalid artifact for `{model_id}`: {reason}")]
    InvalidArtifact { model_id: String, reason: String },

    #[error("inference failed in `{model_id}`: {reason}")]
    Inference { model_id: String, reason: String },

    #[error("model `{model_id}` unavailable: {reason}")]
    Unavailable { model_id: String, reason: String },
}

impl ModelError {
    /// Id of the model that failed, when known
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::NotLoaded { model_id }
            | Self::InvalidArtifact { model_id, .. }
            | Self::Inference { model_id, .. }
            | Self::Unavailable { model_id, .. } => Some(model_id),
            Self::ArtifactRead { .. } => None,
        }
    }
}

/// A loaded (or loadable) scoring model
///
/// Implementations must be cheap to call concurrently; `predict` takes
/// `&self` and is invoked from many tasks at once.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Identity of the currently loaded model
    fn descriptor(&self) -> ModelDescriptor;

    /// Load (or reload) the model artifact at `path`
    ///
    /// On failure the previously loaded model, if any, keeps serving.
    async fn load_model(&self, path: &Path) -> Result<(), ModelError>;

    /// Score a business for one horizon
    async fn predict(
        &self,
        features: &FeatureVector,
        horizon: PredictionHorizon,
    ) -> Result<RawPrediction, ModelError>;

    /// Whether the adapter can currently serve predictions
    async fn health_check(&self) -> bool {
        true
    }
}

/// Read an artifact file into a string, mapping IO errors
pub(crate) async fn read_artifact(path: &Path) -> Result<String, ModelError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ModelError::ArtifactRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}
