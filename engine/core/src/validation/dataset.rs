//! Labelled datasets for validation
//!
//! Two sources: a seeded synthetic generator whose labels come from
//! [`reference_risk`] plus noise, and JSON lines files of externally
//! labelled businesses (one [`LabeledSample`] per line).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{reference_risk, FeatureVector};
use crate::request::{BusinessSignals, PredictionHorizon, RiskAssessmentRequest};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("dataset is empty")]
    Empty,

    #[error("invalid synthetic dataset parameters: {0}")]
    InvalidParameters(String),
}

/// One business with realized risk per horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub business_id: String,
    #[serde(default)]
    pub signals: BusinessSignals,
    /// Realized risk in [0, 1], keyed by horizon in months
    pub outcomes: BTreeMap<u32, f64>,
}

impl LabeledSample {
    #[must_use]
    pub fn features(&self) -> FeatureVector {
        FeatureVector::from_signals(&self.signals)
    }

    #[must_use]
    pub fn outcome(&self, horizon: PredictionHorizon) -> Option<f64> {
        self.outcomes.get(&horizon.get()).copied()
    }

    /// Assessment request for this business
    #[must_use]
    pub fn to_request(&self, horizons: impl IntoIterator<Item = u32>) -> RiskAssessmentRequest {
        RiskAssessmentRequest::new(self.business_id.clone(), horizons).with_signals(self.signals.clone())
    }
}

/// Parameters of the synthetic generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub size: usize,
    pub seed: u64,
    /// Standard deviation of label noise around the reference risk
    pub noise: f64,
    pub horizons: Vec<u32>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            size: 1000,
            seed: 42,
            noise: 0.05,
            horizons: vec![3, 6, 9, 12],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDataset {
    pub name: String,
    pub samples: Vec<LabeledSample>,
}

impl LabeledDataset {
    pub fn new(name: impl Into<String>, samples: Vec<LabeledSample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples that carry a label for `horizon`
    #[must_use]
    pub fn labelled_for(&self, horizon: PredictionHorizon) -> usize {
        self.samples.iter().filter(|s| s.outcome(horizon).is_some()).count()
    }

    /// Generate businesses with realistic signal spreads
    ///
    /// The same parameters always yield the same dataset.
    pub fn synthetic(spec: &SyntheticSpec) -> Result<Self, DatasetError> {
        if spec.size == 0 {
            return Err(DatasetError::InvalidParameters("size must be positive".into()));
        }
        if !spec.noise.is_finite() || spec.noise < 0.0 {
            return Err(DatasetError::InvalidParameters(format!("noise {} must be >= 0", spec.noise)));
        }
        let invalid = |e: rand_distr::NormalError| DatasetError::InvalidParameters(e.to_string());

        let mut rng = StdRng::seed_from_u64(spec.seed);
        let revenue = LogNormal::<f64>::new(1.0e6_f64.ln(), 1.2).map_err(invalid)?;
        let employees = LogNormal::<f64>::new(20.0_f64.ln(), 1.0).map_err(invalid)?;
        let leverage = LogNormal::<f64>::new(0.0, 0.6).map_err(invalid)?;
        let delay = Normal::<f64>::new(15.0, 12.0).map_err(invalid)?;
        let monthly = Normal::<f64>::new(0.0, 0.08).map_err(invalid)?;
        let noise = Normal::<f64>::new(0.0, spec.noise).map_err(invalid)?;

        let mut samples = Vec::with_capacity(spec.size);
        for i in 0..spec.size {
            let reliability: f64 = rng.gen_range(0.55..1.0);
            let months: usize = rng.gen_range(0..=24);
            let payment_history = (0..months)
                .map(|_| round4((reliability + monthly.sample(&mut rng)).clamp(0.0, 1.0)))
                .collect();

            let prior_defaults = if rng.gen_bool(0.03) {
                2.0
            } else if rng.gen_bool(0.1) {
                1.0
            } else {
                0.0
            };

            let signals = BusinessSignals {
                annual_revenue: Some(round4(revenue.sample(&mut rng).clamp(1.0e3, 1.0e10))),
                years_in_business: Some(round4(rng.gen_range(0.0..40.0))),
                employee_count: Some(employees.sample(&mut rng).clamp(1.0, 1.0e5).round()),
                avg_payment_delay_days: Some(round4(delay.sample(&mut rng).clamp(0.0, 120.0))),
                debt_to_equity: Some(round4(leverage.sample(&mut rng).clamp(0.0, 20.0))),
                credit_utilization: Some(round4(rng.gen_range(0.0..1.0))),
                industry_risk: Some(round4(rng.gen_range(0.0..1.0))),
                prior_defaults: Some(prior_defaults),
                payment_history,
            };

            let features = FeatureVector::from_signals(&signals);
            let outcomes = spec
                .horizons
                .iter()
                .map(|&months| {
                    let truth = reference_risk(&features, PredictionHorizon::months(months)) + noise.sample(&mut rng);
                    (months, round4(truth.clamp(0.0, 1.0)))
                })
                .collect();

            samples.push(LabeledSample {
                business_id: format!("synthetic-{i:05}"),
                signals,
                outcomes,
            });
        }

        Ok(Self::new(
            format!("synthetic(size={}, seed={})", spec.size, spec.seed),
            samples,
        ))
    }

    /// Load a JSON lines file; blank lines and `#` comments are skipped
    pub async fn from_jsonl(path: &Path) -> Result<Self, DatasetError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dataset = Self::parse_jsonl(&path.display().to_string(), path, &text)?;
        Ok(dataset)
    }

    fn parse_jsonl(name: &str, path: &Path, text: &str) -> Result<Self, DatasetError> {
        let mut samples = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let sample: LabeledSample = serde_json::from_str(line).map_err(|e| DatasetError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                message: e.to_string(),
            })?;
            if let Some((&h, &v)) = sample.outcomes.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
                return Err(DatasetError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: format!("outcome {v} for horizon {h} is outside [0, 1]"),
                });
            }
            samples.push(sample);
        }
        if samples.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self::new(name, samples))
    }
}

fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_synthetic_is_deterministic() {
        let spec = SyntheticSpec {
            size: 50,
            ..SyntheticSpec::default()
        };
        let a = LabeledDataset::synthetic(&spec).unwrap();
        let b = LabeledDataset::synthetic(&spec).unwrap();
        assert_eq!(a, b);

        let other = LabeledDataset::synthetic(&SyntheticSpec { seed: 7, ..spec }).unwrap();
        assert_ne!(a.samples, other.samples);
    }

    #[test]
    fn test_synthetic_samples_pass_request_validation() {
        let dataset = LabeledDataset::synthetic(&SyntheticSpec {
            size: 200,
            ..SyntheticSpec::default()
        })
        .unwrap();
        let limits = crate::request::RequestLimits::default();
        for sample in &dataset.samples {
            assert!(sample.to_request([3, 12]).normalize(&limits).is_ok());
            assert_eq!(sample.outcomes.len(), 4);
            assert!(sample.outcomes.values().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_synthetic_labels_spread_across_levels() {
        let dataset = LabeledDataset::synthetic(&SyntheticSpec::default()).unwrap();
        let h6 = PredictionHorizon::months(6);
        let labels: Vec<f64> = dataset.samples.iter().filter_map(|s| s.outcome(h6)).collect();
        let low = labels.iter().filter(|&&v| v < 0.25).count();
        let high = labels.iter().filter(|&&v| v >= 0.5).count();
        assert!(low > 20, "expected a healthy share of low-risk businesses, got {low}");
        assert!(high > 100, "expected a healthy share of high-risk businesses, got {high}");
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(LabeledDataset::synthetic(&SyntheticSpec {
            size: 0,
            ..SyntheticSpec::default()
        })
        .is_err());
        assert!(LabeledDataset::synthetic(&SyntheticSpec {
            noise: -1.0,
            ..SyntheticSpec::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_jsonl_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# exported labels").unwrap();
        writeln!(
            file,
            r#"{{"business_id":"acme","signals":{{"annual_revenue":1000000}},"outcomes":{{"6":0.3}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"business_id":"zeta","outcomes":{{"6":0.8,"12":0.9}}}}"#).unwrap();

        let dataset = LabeledDataset::from_jsonl(file.path()).await.unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.labelled_for(PredictionHorizon::months(12)), 1);
        assert_eq!(dataset.samples[0].signals.annual_revenue, Some(1_000_000.0));
    }

    #[tokio::test]
    async fn test_jsonl_reports_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"business_id":"acme","outcomes":{{"6":0.3}}}}"#).unwrap();
        writeln!(file, r#"{{"business_id":"zeta","outcomes":{{"6":1.7}}}}"#).unwrap();

        match LabeledDataset::from_jsonl(file.path()).await {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
