//! Confidence calibration
//!
//! Predictions are bucketed by the confidence the model stated; within each
//! bucket the realized accuracy (risk level match) should be close to the
//! mean stated confidence. The calibration error is the sample-weighted
//! mean gap across buckets.

use serde::{Deserialize, Serialize};

use crate::prediction::RiskLevel;

/// One prediction as seen by calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    pub confidence: f64,
    pub predicted: f64,
    pub actual: f64,
}

impl CalibrationPoint {
    fn correct(&self) -> bool {
        RiskLevel::from_score(self.predicted) == RiskLevel::from_score(self.actual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub lower: f64,
    /// Exclusive, except for the last bucket
    pub upper: f64,
    pub count: usize,
    pub mean_confidence: f64,
    pub realized_accuracy: f64,
    /// `mean_confidence - realized_accuracy`; positive means overconfident
    pub gap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub buckets: Vec<CalibrationBucket>,
    /// Sample-weighted mean of `|gap|` over non-empty buckets
    pub error: f64,
}

impl CalibrationReport {
    /// Bucket with the widest gap, if any bucket has samples
    #[must_use]
    pub fn worst_bucket(&self) -> Option<&CalibrationBucket> {
        self.buckets
            .iter()
            .filter(|b| b.count > 0)
            .max_by(|a, b| a.gap.abs().total_cmp(&b.gap.abs()))
    }
}

/// Bucket `points` at the given interior boundaries
///
/// `boundaries = [0.7]` yields `[0, 0.7)` (low) and `[0.7, 1]` (high).
/// Boundaries may come in any order.
#[must_use]
pub fn calibrate(points: &[CalibrationPoint], boundaries: &[f64]) -> CalibrationReport {
    let mut edges = vec![0.0, 1.0];
    edges.extend(boundaries.iter().copied().filter(|b| *b > 0.0 && *b < 1.0));
    edges.sort_by(f64::total_cmp);
    edges.dedup();

    let last = edges.len() - 2;
    let mut buckets: Vec<CalibrationBucket> = edges
        .windows(2)
        .map(|w| CalibrationBucket {
            lower: w[0],
            upper: w[1],
            count: 0,
            mean_confidence: 0.0,
            realized_accuracy: 0.0,
            gap: 0.0,
        })
        .collect();
    let mut correct = vec![0usize; buckets.len()];

    for point in points {
        let c = point.confidence.clamp(0.0, 1.0);
        let index = buckets
            .iter()
            .position(|b| c >= b.lower && c < b.upper)
            .unwrap_or(last);
        let bucket = &mut buckets[index];
        bucket.count += 1;
        bucket.mean_confidence += c;
        if point.correct() {
            correct[index] += 1;
        }
    }

    let total: usize = buckets.iter().map(|b| b.count).sum();
    let mut weighted_gap = 0.0;
    for (bucket, hits) in buckets.iter_mut().zip(correct) {
        if bucket.count == 0 {
            continue;
        }
        let n = bucket.count as f64;
        bucket.mean_confidence /= n;
        bucket.realized_accuracy = hits as f64 / n;
        bucket.gap = bucket.mean_confidence - bucket.realized_accuracy;
        weighted_gap += bucket.gap.abs() * n;
    }

    CalibrationReport {
        buckets,
        error: if total == 0 { 0.0 } else { weighted_gap / total as f64 },
    }
}
