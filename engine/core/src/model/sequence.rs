//! Recurrent sequence model
//!
//! Serves the long-horizon model: a single-layer GRU that walks the monthly
//! payment history, with the static features appended to every step's input.
//! The final hidden state goes through a linear output layer plus a
//! horizon term `horizon_coefficient * ln(months / 12)`.
//!
//! Weights are stored row-major as `hidden x input` / `hidden x hidden`
//! matrices in a JSON artifact (see [`SequenceArtifact`]).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::features::{index_of, FeatureVector};
use super::traits::{read_artifact, ModelAdapter, ModelDescriptor, ModelError, ModelKind, RawPrediction};
use super::tree::sigmoid;
use crate::request::PredictionHorizon;

/// Weights for one GRU gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateWeights {
    /// `hidden x input`
    pub input: Vec<Vec<f64>>,
    /// `hidden x hidden`
    pub recurrent: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl GateWeights {
    fn check(&self, name: &str, hidden: usize, input: usize) -> Result<(), String> {
        let shape_ok = self.input.len() == hidden
            && self.input.iter().all(|row| row.len() == input)
            && self.recurrent.len() == hidden
            && self.recurrent.iter().all(|row| row.len() == hidden)
            && self.bias.len() == hidden;
        if !shape_ok {
            return Err(format!("gate `{name}` does not match hidden={hidden} input={input}"));
        }
        let finite = self
            .input
            .iter()
            .chain(self.recurrent.iter())
            .flatten()
            .chain(self.bias.iter())
            .all(|w| w.is_finite());
        if !finite {
            return Err(format!("gate `{name}` contains non-finite weights"));
        }
        Ok(())
    }

    /// `W x + U h + b` for row `j`
    fn pre_activation(&self, j: usize, x: &[f64], h: &[f64]) -> f64 {
        dot(&self.input[j], x) + dot(&self.recurrent[j], h) + self.bias[j]
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// On-disk sequence model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceArtifact {
    pub model_id: String,
    pub version: String,
    /// Static features appended to each step, after the history value
    pub feature_names: Vec<String>,
    /// Per-feature standardization; identity when empty
    #[serde(default)]
    pub feature_means: Vec<f64>,
    #[serde(default)]
    pub feature_stds: Vec<f64>,
    pub hidden_size: usize,
    pub update_gate: GateWeights,
    pub reset_gate: GateWeights,
    pub candidate: GateWeights,
    pub output_weights: Vec<f64>,
    pub output_bias: f64,
    #[serde(default)]
    pub horizon_coefficient: f64,
    /// History length at which the model reaches full confidence
    #[serde(default = "default_min_history")]
    pub min_history: usize,
}

fn default_min_history() -> usize {
    12
}

impl SequenceArtifact {
    fn input_size(&self) -> usize {
        1 + self.feature_names.len()
    }

    fn validate(&self) -> Result<Vec<usize>, String> {
        if self.hidden_size == 0 {
            return Err("hidden_size must be positive".into());
        }
        let feature_map = self
            .feature_names
            .iter()
            .map(|name| index_of(name).ok_or_else(|| format!("unknown feature `{name}`")))
            .collect::<Result<Vec<_>, _>>()?;

        let n = self.feature_names.len();
        if !self.feature_means.is_empty() && self.feature_means.len() != n {
            return Err("feature_means length mismatch".into());
        }
        if !self.feature_stds.is_empty()
            && (self.feature_stds.len() != n || self.feature_stds.iter().any(|s| *s <= 0.0))
        {
            return Err("feature_stds must match features and be positive".into());
        }

        let (h, i) = (self.hidden_size, self.input_size());
        self.update_gate.check("update", h, i)?;
        self.reset_gate.check("reset", h, i)?;
        self.candidate.check("candidate", h, i)?;

        if self.output_weights.len() != h {
            return Err("output_weights length must equal hidden_size".into());
        }
        if !self.output_bias.is_finite() || !self.horizon_coefficient.is_finite() {
            return Err("output_bias and horizon_coefficient must be finite".into());
        }
        Ok(feature_map)
    }
}

#[derive(Debug)]
struct CompiledSequence {
    artifact: SequenceArtifact,
    feature_map: Vec<usize>,
}

impl CompiledSequence {
    fn compile(artifact: SequenceArtifact) -> Result<Self, ModelError> {
        let feature_map = artifact.validate().map_err(|reason| ModelError::InvalidArtifact {
            model_id: artifact.model_id.clone(),
            reason,
        })?;
        Ok(Self {
            artifact,
            feature_map,
        })
    }

    fn static_inputs(&self, features: &FeatureVector) -> Vec<f64> {
        let a = &self.artifact;
        let values = features.values();
        self.feature_map
            .iter()
            .enumerate()
            .map(|(k, &idx)| {
                let mean = a.feature_means.get(k).copied().unwrap_or(0.0);
                let std = a.feature_stds.get(k).copied().unwrap_or(1.0);
                (values[idx] - mean) / std
            })
            .collect()
    }

    fn step(&self, x: &[f64], h: &[f64]) -> Vec<f64> {
        let a = &self.artifact;
        let hidden = a.hidden_size;

        let z: Vec<f64> = (0..hidden)
            .map(|j| sigmoid(a.update_gate.pre_activation(j, x, h)))
            .collect();
        let r: Vec<f64> = (0..hidden)
            .map(|j| sigmoid(a.reset_gate.pre_activation(j, x, h)))
            .collect();
        let gated: Vec<f64> = r.iter().zip(h).map(|(r, h)| r * h).collect();
        let n: Vec<f64> = (0..hidden)
            .map(|j| a.candidate.pre_activation(j, x, &gated).tanh())
            .collect();

        (0..hidden).map(|j| (1.0 - z[j]) * n[j] + z[j] * h[j]).collect()
    }

    fn predict(&self, features: &FeatureVector, horizon: PredictionHorizon) -> Option<RawPrediction> {
        let a = &self.artifact;
        let statics = self.static_inputs(features);
        let mut x = Vec::with_capacity(a.input_size());
        let mut h = vec![0.0; a.hidden_size];

        // An empty history is read as a single on-time month
        let history: &[f64] = if features.history().is_empty() {
            &[1.0]
        } else {
            features.history()
        };
        for &month in history {
            x.clear();
            x.push(month);
            x.extend_from_slice(&statics);
            h = self.step(&x, &h);
        }

        let months = f64::from(horizon.get().max(1));
        let logit =
            dot(&a.output_weights, &h) + a.output_bias + a.horizon_coefficient * (months / 12.0).ln();
        let score = sigmoid(logit);

        let coverage = (features.history().len() as f64 / a.min_history.max(1) as f64).min(1.0);
        let margin = (2.0 * score - 1.0).abs();
        let confidence = (0.5 + 0.5 * margin) * (0.6 + 0.4 * coverage);

        RawPrediction::checked(score, confidence)
    }
}

/// Sequence model adapter with hot reload
pub struct SequenceModel {
    model_id: String,
    loaded: RwLock<Option<Arc<CompiledSequence>>>,
}

impl SequenceModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            loaded: RwLock::new(None),
        }
    }

    pub fn from_artifact(artifact: SequenceArtifact) -> Result<Self, ModelError> {
        let model = Self::new(artifact.model_id.clone());
        model.install(artifact)?;
        Ok(model)
    }

    fn install(&self, artifact: SequenceArtifact) -> Result<(), ModelError> {
        let compiled = CompiledSequence::compile(artifact)?;
        info!(
            model_id = %compiled.artifact.model_id,
            version = %compiled.artifact.version,
            hidden = compiled.artifact.hidden_size,
            "Sequence model loaded"
        );
        *self.loaded.write() = Some(Arc::new(compiled));
        Ok(())
    }
}

#[async_trait]
impl ModelAdapter for SequenceModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            model_id: self.model_id.clone(),
            version: self
                .loaded
                .read()
                .as_ref()
                .map_or_else(|| "unloaded".to_string(), |m| m.artifact.version.clone()),
            kind: ModelKind::Sequence,
        }
    }

    async fn load_model(&self, path: &Path) -> Result<(), ModelError> {
        let raw = read_artifact(path).await?;
        let artifact: SequenceArtifact =
            serde_json::from_str(&raw).map_err(|e| ModelError::InvalidArtifact {
                model_id: self.model_id.clone(),
                reason: e.to_string(),
            })?;
        self.install(artifact)
    }

    async fn predict(
        &self,
        features: &FeatureVector,
        horizon: PredictionHorizon,
    ) -> Result<RawPrediction, ModelError> {
        let compiled = self.loaded.read().clone().ok_or_else(|| ModelError::NotLoaded {
            model_id: self.model_id.clone(),
        })?;
        compiled
            .predict(features, horizon)
            .ok_or_else(|| ModelError::Inference {
                model_id: self.model_id.clone(),
                reason: "non-finite output".into(),
            })
    }

    async fn health_check(&self) -> bool {
        self.loaded.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BusinessSignals;

    fn gate(hidden: usize, input: usize, w: f64) -> GateWeights {
        GateWeights {
            input: vec![vec![w; input]; hidden],
            recurrent: vec![vec![0.0; hidden]; hidden],
            bias: vec![0.0; hidden],
        }
    }

    /// Hidden state tracks lateness: the candidate gate reads `-history`
    fn tiny_artifact() -> SequenceArtifact {
        let hidden = 2;
        let input = 2;
        let mut candidate = gate(hidden, input, 0.0);
        for row in &mut candidate.input {
            row[0] = -2.0;
        }
        for b in &mut candidate.bias {
            *b = 1.0;
        }
        SequenceArtifact {
            model_id: "gru-long".into(),
            version: "7".into(),
            feature_names: vec!["credit_utilization".into()],
            feature_means: vec![],
            feature_stds: vec![],
            hidden_size: hidden,
            update_gate: gate(hidden, input, 0.0),
            reset_gate: gate(hidden, input, 0.0),
            candidate,
            output_weights: vec![1.5, 1.5],
            output_bias: 0.0,
            horizon_coefficient: 0.5,
            min_history: 6,
        }
    }

    fn features(history: Vec<f64>) -> FeatureVector {
        FeatureVector::from_signals(&BusinessSignals {
            credit_utilization: Some(0.5),
            payment_history: history,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_late_payers_score_higher() {
        let model = SequenceModel::from_artifact(tiny_artifact()).unwrap();
        let h = PredictionHorizon::months(12);

        let punctual = model.predict(&features(vec![1.0; 6]), h).await.unwrap();
        let late = model.predict(&features(vec![0.1; 6]), h).await.unwrap();
        assert!(late.score > punctual.score);
    }

    #[tokio::test]
    async fn test_short_history_lowers_confidence() {
        let model = SequenceModel::from_artifact(tiny_artifact()).unwrap();
        let h = PredictionHorizon::months(9);

        let sparse = model.predict(&features(vec![0.9]), h).await.unwrap();
        let full = model.predict(&features(vec![0.9; 6]), h).await.unwrap();
        assert!(sparse.confidence < full.confidence);
    }

    #[tokio::test]
    async fn test_horizon_term_shifts_score() {
        let model = SequenceModel::from_artifact(tiny_artifact()).unwrap();
        let fv = features(vec![0.5; 6]);
        let near = model.predict(&fv, PredictionHorizon::months(3)).await.unwrap();
        let far = model.predict(&fv, PredictionHorizon::months(12)).await.unwrap();
        assert!(far.score > near.score);
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let mut artifact = tiny_artifact();
        artifact.output_weights = vec![1.0];
        assert!(matches!(
            SequenceModel::from_artifact(artifact).err().unwrap(),
            ModelError::InvalidArtifact { .. }
        ));

        let mut artifact = tiny_artifact();
        artifact.reset_gate.bias.push(0.0);
        assert!(SequenceModel::from_artifact(artifact).is_err());
    }
}
