//! Routing Policy
//!
//! Maps the caller's [`ModelType`] and a horizon onto a [`RoutePlan`].
//! The plan is the only thing the router executes; adding a model strategy
//! means adding a plan variant here.

use serde::{Deserialize, Serialize};

use super::config::RouterConfig;
use crate::request::{ModelType, PredictionHorizon};

/// How one horizon will be served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePlan {
    /// Short model alone; its failure fails the horizon
    Short,
    /// Long model alone, degrading to the short model on failure
    Long,
    /// Both models blended, degrading to whichever one answers
    Blend,
}

impl RoutePlan {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
            Self::Blend => "blend",
        }
    }
}

/// Choose a plan for one horizon
#[must_use]
pub fn plan_for(model_type: ModelType, horizon: PredictionHorizon, config: &RouterConfig) -> RoutePlan {
    match model_type {
        ModelType::ModelA => RoutePlan::Short,
        ModelType::ModelB => RoutePlan::Long,
        ModelType::Ensemble => RoutePlan::Blend,
        ModelType::Auto => {
            let months = horizon.get();
            if months <= config.short_horizon_max {
                RoutePlan::Short
            } else if months >= config.long_horizon_min {
                if config.blend_long_horizons {
                    RoutePlan::Blend
                } else {
                    RoutePlan::Long
                }
            } else {
                RoutePlan::Blend
            }
        }
    }
}
