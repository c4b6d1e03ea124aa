//! Risk Engine Core - Multi-Horizon Business Risk Scoring
//!
//! Scores a business's probability of distress at several horizons (3, 6, 9
//! and 12 months) under a strict latency budget, routing each horizon to the
//! model best suited to it and blending models where that helps.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Handler layer / daemon (JSON lines)              │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ assess(request)
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          RiskEngine                              │
//! │  validate ─► admission ─► ResultCache ─► single-flight ─► breaker│
//! │              (semaphore)   (L1 ─► L2)                            │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ predict(normalized request)
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                    ModelEnsembleRouter                           │
//! │   per horizon:  plan ─► short / long ModelAdapter ─► blend       │
//! └──────────────────────────────────────────────────────────────────┘
//!
//!   ValidationHarness ── k-fold CV, calibration ──► WeightTable swap
//!   BenchmarkRunner   ── warmup, P50/P95/P99    ──► SLA pass/fail
//! ```
//!
//! # Key Types
//!
//! - [`RiskEngine`]: request orchestration with admission, deadline and breaker
//! - [`ModelEnsembleRouter`]: horizon-aware routing and blending
//! - [`ResultCache`]: two-tier cache with prefetch of hot entries
//! - [`ValidationHarness`]: accuracy and calibration certification
//! - [`BenchmarkRunner`]: latency certification
//!
//! # Quick Start
//!
//! ```ignore
//! use risk_engine_core::{bootstrap, config, RiskAssessmentRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config()?;
//!     let handle = bootstrap::build(config).await?;
//!     handle.start_background();
//!
//!     let request = RiskAssessmentRequest::new("acme-ltd", [3, 12]);
//!     let result = handle.engine.assess(&request).await?;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`engine`]: `RiskEngine`, circuit breaker, single-flight
//! - [`routing`]: routing policy, blending, weight tables
//! - [`model`]: model adapters and feature extraction
//! - [`cache`]: L1 LRU, L2 backends, keys, prefetch
//! - [`validation`]: datasets, cross-validation, calibration, benchmarks
//! - [`metrics`]: counters, histograms, Prometheus export
//! - [`config`]: TOML / environment / CLI configuration
//! - [`bootstrap`]: wiring with degraded-mode fallbacks

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod prediction;
pub mod request;
pub mod routing;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-exports for convenience
pub use bootstrap::{BootstrapError, DegradedMode, DegradedReason, EngineHandle};
pub use cache::{CacheBackend, CacheConfig, CacheKey, Invalidation, PrefetchConfig, ResultCache};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, EngineConfigFile};
pub use engine::{BreakerConfig, CircuitState, EngineConfig, EngineHealth, RiskEngine};
pub use error::{EngineError, EngineResult, Stage, ValidationInputError};
pub use metrics::{EngineMetrics, MetricsSink};
pub use model::{FeatureVector, ModelAdapter, ModelError, ModelSet};
pub use prediction::{
    EnsembleResult, HorizonOutcome, HorizonPrediction, ModelComparison, ModelPrediction,
    ModelSlot, ModelUsed, RiskLevel, UncertaintyBounds,
};
pub use request::{BusinessSignals, ModelType, PredictionHorizon, RiskAssessmentRequest};
pub use routing::{BlendWeights, ModelEnsembleRouter, RouterConfig, WeightTable};
pub use validation::{
    BenchmarkConfig, BenchmarkReport, BenchmarkRunner, LabeledDataset, ValidationConfig,
    ValidationError, ValidationHarness, ValidationResult,
};
