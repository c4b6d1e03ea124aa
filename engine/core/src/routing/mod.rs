//! Horizon-Aware Ensemble Routing
//!
//! Decides which model serves each horizon and blends the answers.
//!
//! # Architecture
//!
//! ```text
//! +----------------------+
//! | ModelEnsembleRouter  |  <-- Entry point, fans out per horizon
//! +----------+-----------+
//!            |
//!            v
//! +----------------------+
//! |   RoutingPolicy      |  <-- ModelType + horizon -> RoutePlan
//! +----------+-----------+
//!            |
//!      +-----+------+
//!      |            |
//!      v            v
//! +---------+  +---------+
//! |  Short  |  |  Long   |  <-- ModelAdapter (tree / sequence)
//! +----+----+  +----+----+
//!      |            |
//!      +-----+------+
//!            v
//! +----------------------+
//! |  Blend / Fallback    |  <-- WeightTable, disagreement penalty
//! +----------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Horizon Fit**: short horizons go to the tree ensemble, long ones to the sequence model
//! 2. **Graceful Degradation**: a failing model degrades the horizon instead of failing it
//! 3. **Never Invent Scores**: when no model answers, the horizon fails

pub mod blend;
pub mod config;
pub mod policy;
pub mod router;
pub mod weights;

pub use blend::{blend, BlendComponent, BlendOutcome};
pub use config::RouterConfig;
pub use policy::{plan_for, RoutePlan};
pub use router::{ComponentScores, HorizonOptions, ModelEnsembleRouter, RouterHealth};
pub use weights::{BlendWeights, WeightStore, WeightTable};
