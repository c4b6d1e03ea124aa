//! Gradient-boosted tree ensemble
//!
//! Serves the short-horizon model from a JSON artifact:
//!
//! ```json
//! {
//!   "model_id": "gbt-short",
//!   "version": "2024.06.1",
//!   "feature_names": ["payment_delay_days", "credit_utilization"],
//!   "base_score": -1.2,
//!   "learning_rate": 0.1,
//!   "trees": [
//!     { "nodes": [
//!         { "feature": 0, "threshold": 30.0, "left": 1, "right": 2 },
//!         { "leaf": -0.4 },
//!         { "leaf": 0.9 }
//!     ] }
//!   ],
//!   "horizon_offsets": { "6": 0.15 },
//!   "horizon_reliability": { "12": 0.7 }
//! }
//! ```
//!
//! Split features index into the artifact's own `feature_names`, which are
//! resolved against the canonical feature order once at load time.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::features::{index_of, FeatureVector};
use super::traits::{read_artifact, ModelAdapter, ModelDescriptor, ModelError, ModelKind, RawPrediction};
use crate::request::PredictionHorizon;

/// One node of a regression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    /// `value <= threshold` goes left
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf { leaf: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

/// On-disk tree ensemble artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeArtifact {
    pub model_id: String,
    pub version: String,
    pub feature_names: Vec<String>,
    pub base_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<Tree>,
    /// Additive logit offset per horizon (months)
    #[serde(default)]
    pub horizon_offsets: BTreeMap<u32, f64>,
    /// Confidence multiplier per horizon; 1.0 when absent
    #[serde(default)]
    pub horizon_reliability: BTreeMap<u32, f64>,
}

impl TreeArtifact {
    /// Structural checks run before an artifact is swapped in
    ///
    /// Children must point forward in the node array, which rules out
    /// cycles and bounds traversal by the node count.
    fn validate(&self) -> Result<Vec<usize>, String> {
        if self.trees.is_empty() {
            return Err("artifact contains no trees".into());
        }
        if !self.base_score.is_finite() || !self.learning_rate.is_finite() {
            return Err("base_score and learning_rate must be finite".into());
        }

        let feature_map = self
            .feature_names
            .iter()
            .map(|name| index_of(name).ok_or_else(|| format!("unknown feature `{name}`")))
            .collect::<Result<Vec<_>, _>>()?;

        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(format!("tree {t} has no nodes"));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                match node {
                    TreeNode::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        if *feature >= feature_map.len() {
                            return Err(format!("tree {t} node {i}: feature {feature} out of range"));
                        }
                        if !threshold.is_finite() {
                            return Err(format!("tree {t} node {i}: non-finite threshold"));
                        }
                        for child in [left, right] {
                            if *child <= i || *child >= tree.nodes.len() {
                                return Err(format!("tree {t} node {i}: bad child index {child}"));
                            }
                        }
                    }
                    TreeNode::Leaf { leaf } => {
                        if !leaf.is_finite() {
                            return Err(format!("tree {t} node {i}: non-finite leaf"));
                        }
                    }
                }
            }
        }

        for (&months, &r) in &self.horizon_reliability {
            if !(0.0..=1.0).contains(&r) {
                return Err(format!("reliability for {months}m must be in [0, 1]"));
            }
        }
        Ok(feature_map)
    }
}

/// Artifact plus its resolved feature mapping
#[derive(Debug)]
struct CompiledEnsemble {
    artifact: TreeArtifact,
    feature_map: Vec<usize>,
}

impl CompiledEnsemble {
    fn compile(artifact: TreeArtifact) -> Result<Self, ModelError> {
        let feature_map = artifact.validate().map_err(|reason| ModelError::InvalidArtifact {
            model_id: artifact.model_id.clone(),
            reason,
        })?;
        Ok(Self {
            artifact,
            feature_map,
        })
    }

    fn leaf_sum(&self, features: &FeatureVector) -> f64 {
        let values = features.values();
        let mut sum = 0.0;
        for tree in &self.artifact.trees {
            let mut idx = 0;
            // Forward-only children bound this loop by the node count
            loop {
                match &tree.nodes[idx] {
                    TreeNode::Leaf { leaf } => {
                        sum += leaf;
                        break;
                    }
                    TreeNode::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        let value = values[self.feature_map[*feature]];
                        idx = if value <= *threshold { *left } else { *right };
                    }
                }
            }
        }
        sum
    }

    fn predict(&self, features: &FeatureVector, horizon: PredictionHorizon) -> Option<RawPrediction> {
        let a = &self.artifact;
        let offset = a.horizon_offsets.get(&horizon.get()).copied().unwrap_or(0.0);
        let logit = a.base_score + a.learning_rate * self.leaf_sum(features) + offset;
        let score = sigmoid(logit);

        let reliability = a
            .horizon_reliability
            .get(&horizon.get())
            .copied()
            .unwrap_or(1.0);
        let margin = (2.0 * score - 1.0).abs();
        let confidence =
            (0.5 + 0.5 * margin) * reliability * (0.7 + 0.3 * features.completeness());

        RawPrediction::checked(score, confidence)
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Tree ensemble adapter with hot reload
pub struct TreeEnsembleModel {
    model_id: String,
    loaded: RwLock<Option<Arc<CompiledEnsemble>>>,
}

impl TreeEnsembleModel {
    /// Create an empty adapter; `predict` fails until a model is loaded
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            loaded: RwLock::new(None),
        }
    }

    /// Create an adapter around an in-memory artifact
    pub fn from_artifact(artifact: TreeArtifact) -> Result<Self, ModelError> {
        let model = Self::new(artifact.model_id.clone());
        model.install(artifact)?;
        Ok(model)
    }

    fn install(&self, artifact: TreeArtifact) -> Result<(), ModelError> {
        let compiled = CompiledEnsemble::compile(artifact)?;
        info!(
            model_id = %compiled.artifact.model_id,
            version = %compiled.artifact.version,
            trees = compiled.artifact.trees.len(),
            "Tree ensemble loaded"
        );
        *self.loaded.write() = Some(Arc::new(compiled));
        Ok(())
    }
}

#[async_trait]
impl ModelAdapter for TreeEnsembleModel {
    fn descriptor(&self) -> ModelDescriptor {
        let loaded = self.loaded.read();
        ModelDescriptor {
            model_id: self.model_id.clone(),
            version: loaded
                .as_ref()
                .map_or_else(|| "unloaded".to_string(), |m| m.artifact.version.clone()),
            kind: ModelKind::TreeEnsemble,
        }
    }

    async fn load_model(&self, path: &Path) -> Result<(), ModelError> {
        let raw = read_artifact(path).await?;
        let artifact: TreeArtifact =
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
