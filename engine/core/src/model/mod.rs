//! Scoring models
//!
//! - [`traits`]: the [`ModelAdapter`] capability every model implements
//! - [`features`]: signal -> feature vector extraction
//! - [`tree`]: gradient-boosted tree ensemble (short horizons)
//! - [`sequence`]: GRU over payment history (long horizons)
//! - [`synthetic`]: closed-form models for benchmarks and demos

pub mod features;
pub mod sequence;
pub mod synthetic;
pub mod traits;
pub mod tree;

use std::sync::Arc;

pub use features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use sequence::{SequenceArtifact, SequenceModel};
pub use synthetic::{reference_risk, SyntheticModel, SyntheticProfile};
pub use traits::{ModelAdapter, ModelDescriptor, ModelError, ModelKind, RawPrediction};
pub use tree::{TreeArtifact, TreeEnsembleModel};

use crate::prediction::ModelSlot;

/// The pair of models the router serves from
#[derive(Clone)]
pub struct ModelSet {
    pub short: Arc<dyn ModelAdapter>,
    pub long: Arc<dyn ModelAdapter>,
}

impl ModelSet {
    pub fn new(short: Arc<dyn ModelAdapter>, long: Arc<dyn ModelAdapter>) -> Self {
        Self { short, long }
    }

    /// Both synthetic profiles, optionally with simulated latency
    #[must_use]
    pub fn synthetic(latency: std::time::Duration) -> Self {
        Self {
            short: Arc::new(SyntheticModel::short_horizon().with_latency(latency)),
            long: Arc::new(SyntheticModel::long_horizon().with_latency(latency)),
        }
    }

    #[must_use]
    pub fn get(&self, slot: ModelSlot) -> &Arc<dyn ModelAdapter> {
        match slot {
            ModelSlot::Short => &self.short,
            ModelSlot::Long => &self.long,
        }
    }

    /// `short@version+long@version`, part of every cache key
    #[must_use]
    pub fn version(&self) -> String {
        format!("{}+{}", self.short.descriptor(), self.long.descriptor())
    }
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("short", &self.short.descriptor())
            .field("long", &self.long.descriptor())
            .finish()
    }
}
