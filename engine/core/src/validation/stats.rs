//! Accuracy metrics over paired predictions and outcomes

use serde::{Deserialize, Serialize};

use crate::prediction::RiskLevel;

/// Accuracy, MAE, RMSE and R² for one set of predictions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    /// Share of predictions whose risk level matches the outcome's level
    pub accuracy: f64,
    pub mae: f64,
    pub rmse: f64,
    /// Coefficient of determination; negative when worse than the mean
    pub r2: f64,
    pub samples: usize,
}

impl MetricSet {
    /// Compute every metric; `predicted` and `actual` must be paired
    #[must_use]
    pub fn compute(predicted: &[f64], actual: &[f64]) -> Self {
        debug_assert_eq!(predicted.len(), actual.len());
        Self {
            accuracy: level_accuracy(predicted, actual),
            mae: mae(predicted, actual),
            rmse: rmse(predicted, actual),
            r2: r_squared(predicted, actual),
            samples: predicted.len().min(actual.len()),
        }
    }
}

fn pairs<'a>(predicted: &'a [f64], actual: &'a [f64]) -> impl Iterator<Item = (f64, f64)> + 'a {
    predicted.iter().copied().zip(actual.iter().copied())
}

/// Fraction of pairs that land in the same [`RiskLevel`]
#[must_use]
pub fn level_accuracy(predicted: &[f64], actual: &[f64]) -> f64 {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return 0.0;
    }
    let hits = pairs(predicted, actual)
        .filter(|&(p, a)| RiskLevel::from_score(p) == RiskLevel::from_score(a))
        .count();
    hits as f64 / n as f64
}

#[must_use]
pub fn mae(predicted: &[f64], actual: &[f64]) -> f64 {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return 0.0;
    }
    pairs(predicted, actual).map(|(p, a)| (p - a).abs()).sum::<f64>() / n as f64
}

#[must_use]
pub fn rmse(predicted: &[f64], actual: &[f64]) -> f64 {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return 0.0;
    }
    (pairs(predicted, actual).map(|(p, a)| (p - a).powi(2)).sum::<f64>() / n as f64).sqrt()
}

/// `1 - SS_res / SS_tot`
///
/// With constant outcomes SS_tot is zero: a perfect fit scores 1, anything
/// else 0.
#[must_use]
pub fn r_squared(predicted: &[f64], actual: &[f64]) -> f64 {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return 0.0;
    }
    let mean = actual[..n].iter().sum::<f64>() / n as f64;
    let ss_tot: f64 = actual[..n].iter().map(|a| (a - mean).powi(2)).sum();
    let ss_res: f64 = pairs(predicted, actual).map(|(p, a)| (a - p).powi(2)).sum();
    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let values = [0.1, 0.3, 0.6, 0.9];
        let m = MetricSet::compute(&values, &values);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.rmse, 0.0);
        assert_eq!(m.r2, 1.0);
        assert_eq!(m.samples, 4);
    }

    #[test]
    fn test_known_errors() {
        let predicted = [0.2, 0.4, 0.8];
        let actual = [0.1, 0.6, 0.8];
        assert!((mae(&predicted, &actual) - 0.1).abs() < 1e-12);
        assert!((rmse(&predicted, &actual) - (0.05f64 / 3.0).sqrt()).abs() < 1e-12);
        // 0.2 vs 0.1 both low, 0.4 medium vs 0.6 high, 0.8 vs 0.8
        assert!((level_accuracy(&predicted, &actual) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_r_squared_can_go_negative() {
        let actual = [0.1, 0.5, 0.9];
        let inverted = [0.9, 0.5, 0.1];
        assert!(r_squared(&inverted, &actual) < 0.0);
        assert_eq!(r_squared(&[0.5, 0.5], &[0.5, 0.5]), 1.0);
        assert_eq!(r_squared(&[0.4, 0.6], &[0.5, 0.5]), 0.0);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(MetricSet::compute(&[], &[]), MetricSet::default());
    }
}
