//! Latency benchmark runner
//!
//! Drives a [`BenchmarkTarget`] for a fixed number of iterations with a fixed
//! number of workers, discards a warmup prefix, and reports sort-then-index
//! percentiles and throughput against SLA targets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::RiskEngine;
use crate::error::EngineError;
use crate::request::RiskAssessmentRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub name: String,
    /// Measured calls
    pub iterations: usize,
    /// Calls made before measuring, discarded
    pub warmup: usize,
    /// Parallel workers; 1 runs sequentially
    pub concurrency: usize,
    pub sla_p95_ms: f64,
    pub sla_p99_ms: f64,
    /// Highest share of measured calls allowed to fail
    pub max_error_rate: f64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            name: "assess".into(),
            iterations: 1000,
            warmup: 50,
            concurrency: 1,
            sla_p95_ms: 100.0,
            sla_p99_ms: 200.0,
            max_error_rate: 0.01,
        }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.iterations == 0 {
            return Err("iterations must be positive".into());
        }
        if self.concurrency == 0 {
            return Err("concurrency must be positive".into());
        }
        if !(self.sla_p95_ms > 0.0 && self.sla_p99_ms > 0.0) {
            return Err("SLA targets must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err("max_error_rate must be in [0, 1]".into());
        }
        Ok(())
    }
}

/// Something the runner can call repeatedly
#[async_trait]
pub trait BenchmarkTarget: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, iteration: usize) -> Result<(), EngineError>;
}

/// Benchmarks `RiskEngine::assess` by cycling through a request list
#[derive(Debug, Clone)]
pub struct EngineTarget {
    engine: RiskEngine,
    requests: Arc<[RiskAssessmentRequest]>,
}

impl EngineTarget {
    /// `requests` must not be empty
    pub fn new(engine: RiskEngine, requests: Vec<RiskAssessmentRequest>) -> Result<Self, String> {
        if requests.is_empty() {
            return Err("at least one benchmark request is required".into());
        }
        Ok(Self {
            engine,
            requests: requests.into(),
        })
    }
}

#[async_trait]
impl BenchmarkTarget for EngineTarget {
    fn name(&self) -> &str {
        "engine.assess"
    }

    async fn call(&self, iteration: usize) -> Result<(), EngineError> {
        let request = &self.requests[iteration % self.requests.len()];
        self.engine.assess(request).await.map(|_| ())
    }
}

/// Latencies in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    /// Summarize unsorted samples
    #[must_use]
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(f64::total_cmp);
        Self {
            min: samples[0],
            max: samples[samples.len() - 1],
            avg: samples.iter().sum::<f64>() / samples.len() as f64,
            p50: percentile(&samples, 50.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
        }
    }
}

/// Nearest-rank percentile: index `ceil(p/100 · n) - 1` of sorted samples
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// One SLA target; latencies in milliseconds, error rate as a fraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaResult {
    /// `p95`, `p99` or `error_rate`
    pub metric: String,
    pub target: f64,
    pub actual: f64,
    pub passed: bool,
}

impl SlaResult {
    fn at_most(metric: &str, target: f64, actual: f64) -> Self {
        Self {
            metric: metric.into(),
            target,
            actual,
            passed: actual <= target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub name: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub iterations: usize,
    pub warmup: usize,
    pub concurrency: usize,
    pub successes: usize,
    pub failures: usize,
    /// Failures by error kind
    pub errors: Vec<(String, usize)>,
    pub latency: LatencySummary,
    pub duration_ms: f64,
    /// Successful calls per second of measured wall time
    pub throughput: f64,
    pub sla: Vec<SlaResult>,
}

impl BenchmarkReport {
    #[must_use]
    pub fn sla_passed(&self) -> bool {
        self.sla.iter().all(|s| s.passed)
    }
}

#[derive(Debug, Default)]
struct Samples {
    latencies_ms: Vec<f64>,
    successes: usize,
    errors: Vec<(String, usize)>,
}

impl Samples {
    fn record(&mut self, elapsed: Duration, outcome: Result<(), EngineError>) {
        self.latencies_ms.push(elapsed.as_secs_f64() * 1000.0);
        match outcome {
            Ok(()) => self.successes += 1,
            Err(e) => match self.errors.iter().position(|(kind, _)| kind == e.kind()) {
                Some(i) => self.errors[i].1 += 1,
                None => self.errors.push((e.kind().to_string(), 1)),
            },
        }
    }
}

pub struct BenchmarkRunner {
    config: BenchmarkConfig,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub async fn run(&self, target: Arc<dyn BenchmarkTarget>) -> BenchmarkReport {
        let config = &self.config;
        let started_at = Utc::now();
        info!(
            benchmark = %config.name,
            target = target.name(),
            iterations = config.iterations,
            warmup = config.warmup,
            concurrency = config.concurrency,
            "Starting benchmark"
        );

        if config.warmup > 0 {
            // Warmup indices precede the measured ones so request cycling
            // continues where warmup stopped
            let discarded = Self::drive(target.clone(), 0, config.warmup, config.concurrency).await;
            info!(calls = discarded.latencies_ms.len(), "Warmup complete");
        }

        let measured_from = Instant::now();
        let samples = Self::drive(
            target.clone(),
            config.warmup,
            config.iterations,
            config.concurrency,
        )
        .await;
        let duration = measured_from.elapsed();

        let latency = LatencySummary::from_samples(samples.latencies_ms.clone());
        let seconds = duration.as_secs_f64();
        let throughput = if seconds > 0.0 {
            samples.successes as f64 / seconds
        } else {
            0.0
        };

        let measured = samples.latencies_ms.len();
        let failures = measured - samples.successes;
        let mut errors = SlaResult::at_most(
            "error_rate",
            config.max_error_rate,
            failures as f64 / measured.max(1) as f64,
        );
        // A run with no successful call passes nothing
        errors.passed &= samples.successes > 0;
        let sla = vec![
            SlaResult::at_most("p95", config.sla_p95_ms, latency.p95),
            SlaResult::at_most("p99", config.sla_p99_ms, latency.p99),
            errors,
        ];

        let report = BenchmarkReport {
            name: config.name.clone(),
            target: target.name().to_string(),
            started_at,
            iterations: config.iterations,
            warmup: config.warmup,
            concurrency: config.concurrency,
            successes: samples.successes,
            failures,
            errors: samples.errors,
            latency,
            duration_ms: seconds * 1000.0,
            throughput,
            sla,
        };

        if report.sla_passed() {
            info!(
                benchmark = %report.name,
                p95_ms = report.latency.p95,
                p99_ms = report.latency.p99,
                throughput = report.throughput,
                "Benchmark met SLA"
            );
        } else {
            warn!(
                benchmark = %report.name,
                p95_ms = report.latency.p95,
                p99_ms = report.latency.p99,
                failures = report.failures,
                "Benchmark missed SLA"
            );
        }
        report
    }

    /// Run `count` calls starting at iteration `offset` across `workers` tasks
    async fn drive(
        target: Arc<dyn BenchmarkTarget>,
        offset: usize,
        count: usize,
        workers: usize,
    ) -> Samples {
        let next = Arc::new(AtomicUsize::new(0));
        let samples = Arc::new(Mutex::new(Samples::default()));

        let mut set = JoinSet::new();
        for _ in 0..workers.min(count.max(1)) {
            let target = target.clone();
            let next = next.clone();
            let samples = samples.clone();
            set.spawn(async move {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= count {
                        break;
                    }
                    let started = Instant::now();
                    let outcome = target.call(offset + i).await;
                    samples.lock().record(started.elapsed(), outcome);
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Benchmark worker failed");
            }
        }

        let taken = std::mem::take(&mut *samples.lock());
        taken
    }
}
