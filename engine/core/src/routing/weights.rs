//! Blend weight tables
//!
//! The router reads weights from an immutable, versioned [`WeightTable`].
//! Updates (typically from a validation run) build a new table and swap the
//! `Arc` in one step, so a request never sees a half-applied update.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::request::PredictionHorizon;

/// Relative weight of each model in a blend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub short: f64,
    pub long: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self::equal()
    }
}

impl BlendWeights {
    #[must_use]
    pub const fn equal() -> Self {
        Self {
            short: 0.5,
            long: 0.5,
        }
    }

    /// Weights from the short model's share in `[0, 1]`
    #[must_use]
    pub fn from_short_share(share: f64) -> Self {
        let share = share.clamp(0.0, 1.0);
        Self {
            short: share,
            long: 1.0 - share,
        }
    }

    /// Short model share of the total weight
    #[must_use]
    pub fn short_share(&self) -> f64 {
        let total = self.short + self.long;
        if total > 0.0 {
            self.short / total
        } else {
            0.5
        }
    }
}

/// Versioned per-horizon weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub version: u64,
    pub default: BlendWeights,
    pub per_horizon: BTreeMap<u32, BlendWeights>,
    /// Where the weights came from (`default`, `validation:<run id>`, ...)
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::equal()
    }
}

impl WeightTable {
    /// Equal weights for every horizon
    #[must_use]
    pub fn equal() -> Self {
        Self {
            version: 0,
            default: BlendWeights::equal(),
            per_horizon: BTreeMap::new(),
            source: "default".into(),
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_horizon(mut self, months: u32, weights: BlendWeights) -> Self {
        self.per_horizon.insert(months, weights);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn weights_for(&self, horizon: PredictionHorizon) -> BlendWeights {
        self.per_horizon
            .get(&horizon.get())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Holder for the current table
#[derive(Debug)]
pub struct WeightStore {
    current: RwLock<Arc<WeightTable>>,
}

impl Default for WeightStore {
    fn default() -> Self {
        Self::new(WeightTable::equal())
    }
}

impl WeightStore {
    #[must_use]
    pub fn new(table: WeightTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Snapshot of the current table
    #[must_use]
    pub fn current(&self) -> Arc<WeightTable> {
        self.current.read().clone()
    }

    /// Install a new table, returning its assigned version
    ///
    /// Versions increase monotonically regardless of what the caller set.
    pub fn swap(&self, mut table: WeightTable) -> u64 {
        let mut current = self.current.write();
        table.version = current.version + 1;
        table.updated_at = Utc::now();
        let version = table.version;
        *current = Arc::new(table);
        version
    }
}
