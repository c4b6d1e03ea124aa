//! Assessment requests
//!
//! [`RiskAssessmentRequest`] is what callers hand to the engine. Before it
//! touches the cache it is validated and normalized into a
//! [`NormalizedRequest`], which is what fingerprints and features are derived
//! from. Identical normalized requests always produce the same cache key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationInputError;

/// Maximum business id length accepted
pub const MAX_BUSINESS_ID_LEN: usize = 128;

// ============================================================================
// Horizons and model preference
// ============================================================================

/// Forecast horizon in months
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionHorizon(u32);

impl PredictionHorizon {
    #[must_use]
    pub const fn months(months: u32) -> Self {
        Self(months)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PredictionHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

impl From<u32> for PredictionHorizon {
    fn from(months: u32) -> Self {
        Self(months)
    }
}

/// Caller's model preference
///
/// `ModelA` is the short-horizon tree ensemble, `ModelB` the long-horizon
/// sequence model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Auto,
    ModelA,
    ModelB,
    Ensemble,
}

impl ModelType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ModelA => "model_a",
            Self::ModelB => "model_b",
            Self::Ensemble => "ensemble",
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "model_a" | "a" | "short" => Ok(Self::ModelA),
            "model_b" | "b" | "long" => Ok(Self::ModelB),
            "ensemble" | "blend" => Ok(Self::Ensemble),
            other => Err(format!("unknown model type '{other}' (auto, model_a, model_b, ensemble)")),
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Numeric risk signals for a business
///
/// Every field is optional; missing signals are replaced by neutral values
/// during feature extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessSignals {
    /// Annual revenue in the reporting currency
    pub annual_revenue: Option<f64>,
    pub years_in_business: Option<f64>,
    pub employee_count: Option<f64>,
    /// Average days past due on supplier invoices
    pub avg_payment_delay_days: Option<f64>,
    pub debt_to_equity: Option<f64>,
    /// Share of available credit in use (0-1)
    pub credit_utilization: Option<f64>,
    /// Sector risk factor supplied by the caller (0-1)
    pub industry_risk: Option<f64>,
    pub prior_defaults: Option<f64>,
    /// Monthly on-time payment ratio, oldest first (0-1 per month)
    pub payment_history: Vec<f64>,
}

/// Accepted range for each scalar signal
struct SignalRange {
    field: &'static str,
    min: f64,
    max: f64,
    read: fn(&BusinessSignals) -> Option<f64>,
}

const SIGNAL_RANGES: [SignalRange; 8] = [
    SignalRange {
        field: "annual_revenue",
        min: 0.0,
        max: 1.0e13,
        read: |s| s.annual_revenue,
    },
    SignalRange {
        field: "years_in_business",
        min: 0.0,
        max: 250.0,
        read: |s| s.years_in_business,
    },
    SignalRange {
        field: "employee_count",
        min: 0.0,
        max: 5.0e6,
        read: |s| s.employee_count,
    },
    SignalRange {
        field: "avg_payment_delay_days",
        min: 0.0,
        max: 365.0,
        read: |s| s.avg_payment_delay_days,
    },
    SignalRange {
        field: "debt_to_equity",
        min: 0.0,
        max: 100.0,
        read: |s| s.debt_to_equity,
    },
    SignalRange {
        field: "credit_utilization",
        min: 0.0,
        max: 1.0,
        read: |s| s.credit_utilization,
    },
    SignalRange {
        field: "industry_risk",
        min: 0.0,
        max: 1.0,
        read: |s| s.industry_risk,
    },
    SignalRange {
        field: "prior_defaults",
        min: 0.0,
        max: 50.0,
        read: |s| s.prior_defaults,
    },
];

impl BusinessSignals {
    fn validate(&self, max_history: usize) -> Result<(), ValidationInputError> {
        for range in &SIGNAL_RANGES {
            let Some(value) = (range.read)(self) else {
                continue;
            };
            if !value.is_finite() {
                return Err(ValidationInputError::NonFiniteSignal { field: range.field });
            }
            if value < range.min || value > range.max {
                return Err(ValidationInputError::SignalOutOfRange {
                    field: range.field,
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        if self.payment_history.len() > max_history {
            return Err(ValidationInputError::HistoryTooLong {
                len: self.payment_history.len(),
                max: max_history,
            });
        }
        for &value in &self.payment_history {
            if !value.is_finite() {
                return Err(ValidationInputError::NonFiniteSignal {
                    field: "payment_history",
                });
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationInputError::SignalOutOfRange {
                    field: "payment_history",
                    value,
                    min: 0.0,
                    max: 1.0,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request to score one business over one or more horizons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessmentRequest {
    pub business_id: String,
    #[serde(default)]
    pub business_name: String,
    /// ISO 3166 country code
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub industry: String,
    pub horizons: Vec<PredictionHorizon>,
    #[serde(default)]
    pub model_type: ModelType,
    #[serde(default)]
    pub signals: BusinessSignals,
    #[serde(default)]
    pub include_uncertainty: bool,
    #[serde(default)]
    pub include_model_comparison: bool,
    /// Skip the cache read (the fresh result is still written back)
    #[serde(default)]
    pub force_refresh: bool,
    /// Caller context; not part of the fingerprint and not a model input
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RiskAssessmentRequest {
    /// Create a request for the given horizons (in months)
    pub fn new(business_id: impl Into<String>, horizons: impl IntoIterator<Item = u32>) -> Self {
        Self {
            business_id: business_id.into(),
            business_name: String::new(),
            country: String::new(),
            industry: String::new(),
            horizons: horizons.into_iter().map(PredictionHorizon::months).collect(),
            model_type: ModelType::Auto,
            signals: BusinessSignals::default(),
            include_uncertainty: false,
            include_model_comparison: false,
            force_refresh: false,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_identity(
        mut self,
        name: impl Into<String>,
        country: impl Into<String>,
        industry: impl Into<String>,
    ) -> Self {
        self.business_name = name.into();
        self.country = country.into();
        self.industry = industry.into();
        self
    }

    #[must_use]
    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    #[must_use]
    pub fn with_signals(mut self, signals: BusinessSignals) -> Self {
        self.signals = signals;
        self
    }

    #[must_use]
    pub fn with_uncertainty(mut self, enabled: bool) -> Self {
        self.include_uncertainty = enabled;
        self
    }

    #[must_use]
    pub fn with_model_comparison(mut self, enabled: bool) -> Self {
        self.include_model_comparison = enabled;
        self
    }

    #[must_use]
    pub fn with_force_refresh(mut self, enabled: bool) -> Self {
        self.force_refresh = enabled;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Validate and canonicalize the request
    ///
    /// Identity strings are trimmed and case-folded, horizons sorted and
    /// deduplicated, and every signal range-checked.
    pub fn normalize(&self, limits: &RequestLimits) -> Result<NormalizedRequest, ValidationInputError> {
        let business_id = normalize_business_id(&self.business_id)?;

        if self.horizons.is_empty() {
            return Err(ValidationInputError::NoHorizons);
        }
        let mut horizons = self.horizons.clone();
        horizons.sort_unstable();
        horizons.dedup();
        if horizons.len() > limits.max_horizons {
            return Err(ValidationInputError::TooManyHorizons {
                count: horizons.len(),
                max: limits.max_horizons,
            });
        }
        if let Some(bad) = horizons
            .iter()
            .find(|h| !limits.supported_horizons.contains(&h.get()))
        {
            return Err(ValidationInputError::UnsupportedHorizon {
                months: bad.get(),
                supported: limits.supported_horizons.clone(),
            });
        }

        self.signals.validate(limits.max_history_len)?;

        Ok(NormalizedRequest {
            business_id,
            business_name: self.business_name.trim().to_string(),
            country: self.country.trim().to_ascii_uppercase(),
            industry: self.industry.trim().to_ascii_lowercase(),
            horizons,
            model_type: self.model_type,
            signals: self.signals.clone(),
            include_uncertainty: self.include_uncertainty,
            include_model_comparison: self.include_model_comparison,
        })
    }
}

/// Canonical form of a business id, as it appears in cache keys
pub(crate) fn normalize_business_id(id: &str) -> Result<String, ValidationInputError> {
    let id = id.trim().to_ascii_lowercase();
    validate_business_id(&id)?;
    Ok(id)
}

fn validate_business_id(id: &str) -> Result<(), ValidationInputError> {
    if id.is_empty() {
        return Err(ValidationInputError::EmptyBusinessId);
    }
    if id.len() > MAX_BUSINESS_ID_LEN {
        return Err(ValidationInputError::InvalidBusinessId {
            reason: format!("longer than {MAX_BUSINESS_ID_LEN} bytes"),
        });
    }
    // Cache keys embed the id and invalidation patterns use glob syntax
    if let Some(c) = id
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '*' | '?'))
    {
        return Err(ValidationInputError::InvalidBusinessId {
            reason: format!("contains forbidden character {c:?}"),
        });
    }
    Ok(())
}

/// Request limits enforced during normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLimits {
    pub supported_horizons: Vec<u32>,
    pub max_horizons: usize,
    pub max_history_len: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            supported_horizons: vec![3, 6, 9, 12],
            max_horizons: 4,
            max_history_len: 120, // ten years of monthly data
        }
    }
}

/// A validated, canonical request
///
/// `force_refresh` and `metadata` are dropped here: they never influence
/// the result and must not influence the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRequest {
    pub business_id: String,
    pub business_name: String,
    pub country: String,
    pub industry: String,
    pub horizons: Vec<PredictionHorizon>,
    pub model_type: ModelType,
    pub signals: BusinessSignals,
    pub include_uncertainty: bool,
    pub include_model_comparison: bool,
}
