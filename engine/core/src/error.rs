//! Serving error taxonomy
//!
//! Every failure surfaced by [`RiskEngine::assess`](crate::engine::RiskEngine::assess)
//! is an [`EngineError`] tagged with the [`Stage`] that produced it, so callers
//! and metrics can tell an admission rejection from a model fault.
//!
//! Only model-path failures (`ModelInvocation`, and `Timeout` raised while the
//! router was running) are allowed to move the circuit breaker.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheBackendError;
use crate::model::ModelError;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Request validation and normalization
    Validation,
    /// Concurrency ceiling
    Admission,
    /// L1 / L2 lookups and writes
    Cache,
    /// Circuit breaker gate
    Breaker,
    /// Horizon routing and blending
    Router,
    /// A single model adapter call
    Model,
}

impl Stage {
    /// Stable lowercase label, used for metrics and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Admission => "admission",
            Self::Cache => "cache",
            Self::Breaker => "breaker",
            Self::Router => "router",
            Self::Model => "model",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed or out-of-contract request input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationInputError {
    #[error("business_id must not be empty")]
    EmptyBusinessId,

    #[error("business_id is invalid: {reason}")]
    InvalidBusinessId { reason: String },

    #[error("at least one prediction horizon is required")]
    NoHorizons,

    #[error("too many horizons: {count} (max {max})")]
    TooManyHorizons { count: usize, max: usize },

    #[error("unsupported horizon {months} months (supported: {supported:?})")]
    UnsupportedHorizon { months: u32, supported: Vec<u32> },

    #[error("signal `{field}` is not a finite number")]
    NonFiniteSignal { field: &'static str },

    #[error("signal `{field}` = {value} is outside [{min}, {max}]")]
    SignalOutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("payment history has {len} entries (max {max})")]
    HistoryTooLong { len: usize, max: usize },
}

/// Errors returned by the serving path
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Rejected before the cache is consulted; never retried
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationInputError),

    /// Concurrency ceiling reached; callers may retry with backoff
    #[error("engine at capacity ({limit} concurrent assessments)")]
    ResourceExhausted { limit: usize },

    #[error("deadline of {timeout_ms}ms exceeded during {stage}")]
    Timeout { stage: Stage, timeout_ms: u64 },

    /// Breaker open, no model call was attempted
    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("model invocation failed during {stage}: {source}")]
    ModelInvocation {
        stage: Stage,
        #[source]
        source: ModelError,
    },

    #[error("cache backend error: {0}")]
    CacheBackend(#[from] CacheBackendError),

    #[error("internal error during {stage}: {message}")]
    Internal { stage: Stage, message: String },
}

impl EngineError {
    /// Stage the error originated from
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidInput(_) => Stage::Validation,
            Self::ResourceExhausted { .. } => Stage::Admission,
            Self::Timeout { stage, .. } => *stage,
            Self::CircuitOpen { .. } => Stage::Breaker,
            Self::ModelInvocation { stage, .. } => *stage,
            Self::CacheBackend(_) => Stage::Cache,
            Self::Internal { stage, .. } => *stage,
        }
    }

    /// Whether this outcome should be recorded as a breaker failure
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        match self {
            Self::ModelInvocation { .. } => true,
            Self::Timeout { stage, .. } => matches!(stage, Stage::Router | Stage::Model),
            _ => false,
        }
    }

    /// Whether a caller can reasonably retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::CacheBackend(_)
        )
    }

    /// Short label for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ModelInvocation { .. } => "model_invocation",
            Self::CacheBackend(_) => "cache_backend",
            Self::Internal { .. } => "internal",
        }
    }

    pub(crate) fn model(source: ModelError) -> Self {
        Self::ModelInvocation {
            stage: Stage::Model,
            source,
        }
    }

    pub(crate) fn internal(stage: Stage, message: impl Into<String>) -> Self {
        Self::Internal {
            stage,
            message: message.into(),
        }
    }
}

/// Result alias for the serving path
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_accounting() {
        let model = EngineError::model(ModelError::Inference {
            model_id: "gbt-short".into(),
            reason: "nan".into(),
        });
        assert!(model.counts_toward_breaker());

        let router_timeout = EngineError::Timeout {
            stage: Stage::Router,
            timeout_ms: 500,
        };
        assert!(router_timeout.counts_toward_breaker());

        let cache_timeout = EngineError::Timeout {
            stage: Stage::Cache,
            timeout_ms: 500,
        };
        assert!(!cache_timeout.counts_toward_breaker());
        assert!(!EngineError::ResourceExhausted { limit: 4 }.counts_toward_breaker());
        assert!(!EngineError::from(ValidationInputError::NoHorizons).counts_toward_breaker());
    }

    #[test]
    fn test_stage_tags() {
        assert_eq!(
            EngineError::CircuitOpen { retry_after_ms: 10 }.stage(),
            Stage::Breaker
        );
        assert_eq!(
            EngineError::from(ValidationInputError::EmptyBusinessId).stage(),
            Stage::Validation
        );
        assert_eq!(Stage::Router.to_string(), "router");
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::ResourceExhausted { limit: 1 }.is_retryable());
        assert!(!EngineError::from(ValidationInputError::NoHorizons).is_retryable());
    }
}
