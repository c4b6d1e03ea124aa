//! Offline Certification
//!
//! Accuracy and latency gates for the serving path.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+      +--------------------+
//! |  LabeledDataset   |      |  BenchmarkTarget   |
//! | (synthetic/JSONL) |      |  (RiskEngine)      |
//! +---------+---------+      +---------+----------+
//!           |                          |
//!           v                          v
//! +-------------------+      +--------------------+
//! | ValidationHarness |      |  BenchmarkRunner   |
//! | k-fold, calibrate |      |  warmup, P50-P99   |
//! +---------+---------+      +---------+----------+
//!           |                          |
//!           v                          v
//! +-------------------+      +--------------------+
//! | ValidationResult  |      |  BenchmarkReport   |
//! |  -> history store |      |  -> SLA pass/fail  |
//! |  -> WeightTable   |      |                    |
//! +-------------------+      +--------------------+
//! ```

pub mod benchmark;
pub mod calibration;
pub mod dataset;
pub mod harness;
pub mod history;
pub mod stats;

pub use benchmark::{
    percentile, BenchmarkConfig, BenchmarkReport, BenchmarkRunner, BenchmarkTarget, EngineTarget,
    LatencySummary, SlaResult,
};
pub use calibration::{calibrate, CalibrationBucket, CalibrationPoint, CalibrationReport};
pub use dataset::{DatasetError, LabeledDataset, LabeledSample, SyntheticSpec};
pub use harness::{
    DatasetSource, FoldResult, HorizonComparison, HorizonValidation, Recommendation, TargetCheck,
    TargetMetric, ValidationConfig, ValidationError, ValidationHarness, ValidationResult,
};
pub use history::{HistoryError, InMemoryHistory, JsonlHistoryStore, ValidationHistoryStore};
pub use stats::MetricSet;
