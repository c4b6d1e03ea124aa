//! Feature extraction
//!
//! Turns validated [`BusinessSignals`] into the fixed-order numeric vector
//! both model families consume. Missing signals are filled with neutral
//! values and counted, so adapters can lower confidence for sparse inputs.

use crate::request::BusinessSignals;

/// Canonical feature order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "revenue_log",
    "years_in_business",
    "employees_log",
    "payment_delay_days",
    "debt_to_equity",
    "credit_utilization",
    "industry_risk",
    "prior_defaults",
];

pub const FEATURE_COUNT: usize = 8;

/// Value used when a signal is absent, in feature space
const NEUTRAL: [f64; FEATURE_COUNT] = [
    13.8, // ln(1 + 1M revenue)
    5.0,
    3.0, // ln(1 + 20 employees)
    15.0,
    1.0,
    0.4,
    0.5,
    0.0,
];

/// Model input for one business
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
    history: Vec<f64>,
    missing: usize,
}

impl FeatureVector {
    /// Extract features from signals that already passed validation
    #[must_use]
    pub fn from_signals(signals: &BusinessSignals) -> Self {
        let raw = [
            signals.annual_revenue.map(f64::ln_1p),
            signals.years_in_business,
            signals.employee_count.map(f64::ln_1p),
            signals.avg_payment_delay_days,
            signals.debt_to_equity,
            signals.credit_utilization,
            signals.industry_risk,
            signals.prior_defaults,
        ];

        let mut values = NEUTRAL;
        let mut missing = 0;
        for (slot, value) in values.iter_mut().zip(raw) {
            match value {
                Some(v) => *slot = v,
                None => missing += 1,
            }
        }

        Self {
            values,
            history: signals.payment_history.clone(),
            missing,
        }
    }

    /// Build directly from feature-space values (datasets and tests)
    #[must_use]
    pub fn from_values(values: [f64; FEATURE_COUNT], history: Vec<f64>) -> Self {
        Self {
            values,
            history,
            missing: 0,
        }
    }

    #[must_use]
    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.values
    }

    /// Value of a named feature
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        index_of(name).map(|i| self.values[i])
    }

    /// Monthly on-time payment ratios, oldest first
    #[must_use]
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.missing
    }

    /// Share of signals that were actually supplied
    #[must_use]
    pub fn completeness(&self) -> f64 {
        1.0 - self.missing as f64 / FEATURE_COUNT as f64
    }
}

/// Position of a feature in [`FEATURE_NAMES`]
#[must_use]
pub fn index_of(name: &str) -> Option<usize> {
    FEATURE_NAMES.iter().position(|n| *n == name)
}
