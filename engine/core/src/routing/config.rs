//! Routing Configuration
//!
//! Horizon boundaries and blending constants for the ensemble router.

use serde::{Deserialize, Serialize};

/// Configuration for [`ModelEnsembleRouter`](super::ModelEnsembleRouter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Horizons up to and including this use the short model alone (auto)
    pub short_horizon_max: u32,
    /// Horizons from this one up use the long model (auto)
    ///
    /// Defaults to 9 rather than 6 so the 6-month horizon, between the two
    /// models' strengths, is served by the blend.
    pub long_horizon_min: u32,
    /// Blend the short model into long horizons instead of serving long alone
    pub blend_long_horizons: bool,
    /// Confidence penalty per unit of score disagreement, capped at 1
    pub disagreement_penalty_scale: f64,
    /// Confidence multiplier applied to fallback predictions
    pub fallback_confidence_penalty: f64,
    /// Uncertainty half-width per unit of missing confidence
    pub uncertainty_scale: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            short_horizon_max: 3,
            long_horizon_min: 9,
            blend_long_horizons: false,
            disagreement_penalty_scale: 0.5,
            fallback_confidence_penalty: 0.8,
            uncertainty_scale: 0.5,
        }
    }
}

impl RouterConfig {
    /// Cross-field checks
    pub fn validate(&self) -> Result<(), String> {
        if self.short_horizon_max >= self.long_horizon_min {
            return Err(format!(
                "short_horizon_max ({}) must be below long_horizon_min ({})",
                self.short_horizon_max, self.long_horizon_min
            ));
        }
        if !(0.0..=1.0).contains(&self.fallback_confidence_penalty) {
            return Err("fallback_confidence_penalty must be in [0, 1]".into());
        }
        if !(self.disagreement_penalty_scale >= 0.0 && self.disagreement_penalty_scale.is_finite()) {
            return Err("disagreement_penalty_scale must be a non-negative number".into());
        }
        if !(self.uncertainty_scale >= 0.0 && self.uncertainty_scale.is_finite()) {
            return Err("uncertainty_scale must be a non-negative number".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_boundaries_leave_six_months_blended() {
        let config = RouterConfig::default();
        assert!(config.short_horizon_max < 6 && 6 < config.long_horizon_min);
    }

    #[test]
    fn test_overlapping_boundaries_rejected() {
        let config = RouterConfig {
            short_horizon_max: 9,
            long_horizon_min: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
