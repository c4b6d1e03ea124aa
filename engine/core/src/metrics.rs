//! Engine Metrics
//!
//! Observability for the serving path including:
//! - Assessment outcomes and latency
//! - Cache hits / misses / evictions per tier
//! - Circuit breaker transitions
//! - Per-horizon and per-model latency
//! - Prefetch and validation activity
//!
//! Everything is lock-free atomics except the labeled maps, which take a
//! short `parking_lot` lock on first use of a label. An optional external
//! [`MetricsSink`] receives every observation as it is recorded.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::cache::CacheTier;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// Values are stored in thousandths so sub-millisecond latencies survive
const SCALE: f64 = 1000.0;

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries (in the unit being measured)
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    /// Sum of all values, scaled
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets in milliseconds, dense around the 500ms SLA
    pub fn latency_default() -> Self {
        Self::new(vec![
            1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 150.0, 250.0, 400.0, 500.0, 750.0,
            1000.0, 2500.0, 5000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() || !value.is_finite() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        let scaled = (value.max(0.0) * SCALE) as u64;
        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(scaled, Ordering::Relaxed);
        self.min.fetch_min(scaled, Ordering::Relaxed);
        self.max.fetch_max(scaled, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed) as f64 / SCALE;
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed) as f64 / SCALE;

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0.0 } else { min as f64 / SCALE },
            max,
            mean: if total > 0 { sum / total as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the p-th percentile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p95(&self) -> f64 {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// External sink
// ============================================================================

/// Receiver for metric observations (StatsD, OTLP bridges, logs)
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64);
    fn observe(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

/// Sink that emits every observation as a `trace` event
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
        tracing::trace!(metric = name, ?labels, value, "counter");
    }

    fn observe(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        tracing::trace!(metric = name, ?labels, value, "histogram");
    }
}

// ============================================================================
// Per-Model Metrics
// ============================================================================

/// Metrics for a single model
#[derive(Debug)]
pub struct ModelMetrics {
    pub model_id: String,
    pub invocations: Counter,
    pub failures: Counter,
    pub latency: Histogram,
}

impl ModelMetrics {
    pub fn new(model_id: String) -> Self {
        Self {
            model_id,
            invocations: Counter::new(),
            failures: Counter::new(),
            latency: Histogram::latency_default(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.invocations.get();
        if total == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / total as f64
    }
}

/// Per-tier cache counters
#[derive(Debug, Default)]
pub struct TierMetrics {
    pub hits: Counter,
    pub misses: Counter,
    pub evictions: Counter,
    pub errors: Counter,
}

impl TierMetrics {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.get();
        let total = hits + self.misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Centralized metrics for one engine instance
pub struct EngineMetrics {
    pub assessments_total: Counter,
    pub assessments_succeeded: Counter,
    pub assessments_failed: Counter,
    pub in_flight: Gauge,
    pub assessment_latency: Histogram,

    pub l1: TierMetrics,
    pub l2: TierMetrics,
    pub single_flight_joins: Counter,

    pub fallbacks: Counter,
    pub degraded_results: Counter,
    pub horizon_failures: Counter,

    pub prefetch_refreshed: Counter,
    pub prefetch_failed: Counter,
    pub ttl_expired: Counter,

    pub validation_runs: Counter,
    pub validation_passed: Counter,
    pub validation_failed: Counter,

    errors: RwLock<HashMap<&'static str, Arc<Counter>>>,
    breaker_transitions: RwLock<HashMap<&'static str, Arc<Counter>>>,
    horizons: RwLock<HashMap<u32, Arc<Histogram>>>,
    models: RwLock<HashMap<String, Arc<ModelMetrics>>>,

    sink: Option<Arc<dyn MetricsSink>>,
    started_at: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("assessments_total", &self.assessments_total.get())
            .field("in_flight", &self.in_flight.get())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            assessments_total: Counter::new(),
            assessments_succeeded: Counter::new(),
            assessments_failed: Counter::new(),
            in_flight: Gauge::new(),
            assessment_latency: Histogram::latency_default(),
            l1: TierMetrics::default(),
            l2: TierMetrics::default(),
            single_flight_joins: Counter::new(),
            fallbacks: Counter::new(),
            degraded_results: Counter::new(),
            horizon_failures: Counter::new(),
            prefetch_refreshed: Counter::new(),
            prefetch_failed: Counter::new(),
            ttl_expired: Counter::new(),
            validation_runs: Counter::new(),
            validation_passed: Counter::new(),
            validation_failed: Counter::new(),
            errors: RwLock::new(HashMap::new()),
            breaker_transitions: RwLock::new(HashMap::new()),
            horizons: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            sink: None,
            started_at: Instant::now(),
        }
    }

    /// Forward every observation to an external sink as well
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn forward_count(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        if let Some(sink) = &self.sink {
            sink.increment(name, labels, 1);
        }
    }

    fn forward_observe(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        if let Some(sink) = &self.sink {
            sink.observe(name, labels, value);
        }
    }

    fn labeled<K, V>(map: &RwLock<HashMap<K, Arc<V>>>, key: K, make: impl FnOnce() -> V) -> Arc<V>
    where
        K: std::hash::Hash + Eq,
    {
        if let Some(existing) = map.read().get(&key) {
            return existing.clone();
        }
        map.write().entry(key).or_insert_with(|| Arc::new(make())).clone()
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    pub fn record_assessment(&self, elapsed: Duration, error_kind: Option<&'static str>) {
        self.assessments_total.inc();
        self.assessment_latency.record_duration(elapsed);
        match error_kind {
            None => {
                self.assessments_succeeded.inc();
                self.forward_count("assessments_total", &[("outcome", "ok")]);
            }
            Some(kind) => {
                self.assessments_failed.inc();
                Self::labeled(&self.errors, kind, Counter::new).inc();
                self.forward_count("assessments_total", &[("outcome", kind)]);
            }
        }
        self.forward_observe("assessment_latency_ms", &[], elapsed.as_secs_f64() * 1000.0);
    }

    /// Count an error that never reached the timed part of the pipeline
    pub fn record_rejection(&self, kind: &'static str) {
        self.assessments_total.inc();
        self.assessments_failed.inc();
        Self::labeled(&self.errors, kind, Counter::new).inc();
        self.forward_count("assessments_total", &[("outcome", kind)]);
    }

    pub fn record_cache_lookup(&self, tier: CacheTier, hit: bool) {
        let metrics = self.tier(tier);
        if hit {
            metrics.hits.inc();
        } else {
            metrics.misses.inc();
        }
        let result = if hit { "hit" } else { "miss" };
        self.forward_count("cache_lookups_total", &[("tier", tier.as_str()), ("result", result)]);
    }

    pub fn record_cache_eviction(&self, tier: CacheTier, count: u64) {
        if count == 0 {
            return;
        }
        self.tier(tier).evictions.add(count);
        if let Some(sink) = &self.sink {
            sink.increment("cache_evictions_total", &[("tier", tier.as_str())], count);
        }
    }

    pub fn record_cache_error(&self, tier: CacheTier) {
        self.tier(tier).errors.inc();
        self.forward_count("cache_errors_total", &[("tier", tier.as_str())]);
    }

    pub fn tier(&self, tier: CacheTier) -> &TierMetrics {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }

    pub fn record_breaker_transition(&self, to: &'static str) {
        Self::labeled(&self.breaker_transitions, to, Counter::new).inc();
        self.forward_count("breaker_transitions_total", &[("to", to)]);
    }

    pub fn record_horizon_latency(&self, months: u32, elapsed: Duration) {
        Self::labeled(&self.horizons, months, Histogram::latency_default).record_duration(elapsed);
        let label = months.to_string();
        self.forward_observe(
            "horizon_latency_ms",
            &[("horizon", label.as_str())],
            elapsed.as_secs_f64() * 1000.0,
        );
    }

    pub fn record_model_call(&self, model_id: &str, elapsed: Duration, ok: bool) {
        let existing = self.models.read().get(model_id).cloned();
        let metrics = match existing {
            Some(metrics) => metrics,
            None => self
                .models
                .write()
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(ModelMetrics::new(model_id.to_string())))
                .clone(),
        };
        metrics.invocations.inc();
        metrics.latency.record_duration(elapsed);
        if !ok {
            metrics.failures.inc();
        }
        let outcome = if ok { "ok" } else { "error" };
        self.forward_count("model_calls_total", &[("model", model_id), ("outcome", outcome)]);
    }

    pub fn record_fallback(&self, from: &'static str, to: &'static str) {
        self.fallbacks.inc();
        self.forward_count("fallbacks_total", &[("from", from), ("to", to)]);
    }

    pub fn record_validation(&self, passed: bool) {
        self.validation_runs.inc();
        if passed {
            self.validation_passed.inc();
        } else {
            self.validation_failed.inc();
        }
        let outcome = if passed { "pass" } else { "fail" };
        self.forward_count("validation_runs_total", &[("outcome", outcome)]);
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.read().get(kind).map_or(0, |c| c.get())
    }

    pub fn breaker_transition_count(&self, to: &str) -> u64 {
        self.breaker_transitions.read().get(to).map_or(0, |c| c.get())
    }

    pub fn horizon_latency(&self, months: u32) -> Option<HistogramSnapshot> {
        self.horizons.read().get(&months).map(|h| h.snapshot())
    }

    pub fn model_metrics(&self, model_id: &str) -> Option<Arc<ModelMetrics>> {
        self.models.read().get(model_id).cloned()
    }

    /// Export as Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, u64); 9] = [
            ("risk_assessments_total", "Assessments received", self.assessments_total.get()),
            ("risk_assessments_succeeded_total", "Assessments that returned a result", self.assessments_succeeded.get()),
            ("risk_assessments_failed_total", "Assessments that returned an error", self.assessments_failed.get()),
            ("risk_single_flight_joins_total", "Requests that joined an in-flight computation", self.single_flight_joins.get()),
            ("risk_fallbacks_total", "Horizons served by a fallback model", self.fallbacks.get()),
            ("risk_degraded_results_total", "Results flagged as degraded", self.degraded_results.get()),
            ("risk_prefetch_refreshed_total", "Cache entries re-warmed by prefetch", self.prefetch_refreshed.get()),
            ("risk_prefetch_failed_total", "Prefetch refresh failures", self.prefetch_failed.get()),
            ("risk_cache_expired_total", "Entries removed by the TTL sweep", self.ttl_expired.get()),
        ];
        for (name, help, value) in counters {
            let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n");
        }

        let _ = write!(
            out,
            "# HELP risk_in_flight Assessments currently admitted\n\
             # TYPE risk_in_flight gauge\n\
             risk_in_flight {}\n\n",
            self.in_flight.get()
        );

        let _ = writeln!(out, "# HELP risk_cache_lookups_total Cache lookups per tier");
        let _ = writeln!(out, "# TYPE risk_cache_lookups_total counter");
        for tier in [CacheTier::L1, CacheTier::L2] {
            let m = self.tier(tier);
            let t = tier.as_str();
            let _ = writeln!(out, "risk_cache_lookups_total{{tier=\"{t}\",result=\"hit\"}} {}", m.hits.get());
            let _ = writeln!(out, "risk_cache_lookups_total{{tier=\"{t}\",result=\"miss\"}} {}", m.misses.get());
            let _ = writeln!(out, "risk_cache_evictions_total{{tier=\"{t}\"}} {}", m.evictions.get());
            let _ = writeln!(out, "risk_cache_errors_total{{tier=\"{t}\"}} {}", m.errors.get());
        }
        out.push('\n');

        for (kind, counter) in self.errors.read().iter() {
            let _ = writeln!(out, "risk_errors_total{{kind=\"{kind}\"}} {}", counter.get());
        }
        for (to, counter) in self.breaker_transitions.read().iter() {
            let _ = writeln!(out, "risk_breaker_transitions_total{{to=\"{to}\"}} {}", counter.get());
        }

        let overall = self.assessment_latency.snapshot();
        let _ = writeln!(out, "risk_assessment_latency_p50_ms {}", overall.p50());
        let _ = writeln!(out, "risk_assessment_latency_p95_ms {}", overall.p95());
        let _ = writeln!(out, "risk_assessment_latency_p99_ms {}", overall.p99());

        let mut horizons: Vec<(u32, HistogramSnapshot)> = self
            .horizons
            .read()
            .iter()
            .map(|(h, hist)| (*h, hist.snapshot()))
            .collect();
        horizons.sort_by_key(|(h, _)| *h);
        for (h, snap) in horizons {
            let _ = writeln!(out, "risk_horizon_latency_p95_ms{{horizon=\"{h}\"}} {}", snap.p95());
        }

        for (model_id, m) in self.models.read().iter() {
            let snap = m.latency.snapshot();
            let _ = writeln!(out, "risk_model_calls_total{{model=\"{model_id}\"}} {}", m.invocations.get());
            let _ = writeln!(out, "risk_model_errors_total{{model=\"{model_id}\"}} {}", m.failures.get());
            let _ = writeln!(out, "risk_model_latency_p95_ms{{model=\"{model_id}\"}} {}", snap.p95());
        }

        let _ = writeln!(
            out,
            "risk_validation_runs_total{{outcome=\"pass\"}} {}\nrisk_validation_runs_total{{outcome=\"fail\"}} {}",
            self.validation_passed.get(),
            self.validation_failed.get()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0, 500.0]);

        hist.record(5.0);
        hist.record(25.0);
        hist.record(75.0);
        hist.record(200.0);
        hist.record(1000.0);

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.counts, vec![1, 1, 1, 2]);
        assert_eq!(snapshot.min, 5.0);
        assert_eq!(snapshot.max, 1000.0);
    }

    #[test]
    fn test_percentiles() {
        let hist = Histogram::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]);

        for i in 1..=100 {
            hist.record(i as f64);
        }

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.p50(), 50.0);
        assert_eq!(snapshot.p95(), 100.0);
        assert_eq!(snapshot.percentile(0.01), 10.0);
    }

    #[test]
    fn test_sub_millisecond_values_survive() {
        let hist = Histogram::latency_default();
        hist.record(0.25);
        hist.record(0.75);
        let snapshot = hist.snapshot();
        assert!((snapshot.mean - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_engine_metrics_labels() {
        let metrics = EngineMetrics::new();
        metrics.record_assessment(Duration::from_millis(12), None);
        metrics.record_assessment(Duration::from_millis(40), Some("timeout"));
        metrics.record_rejection("resource_exhausted");
        metrics.record_cache_lookup(CacheTier::L1, true);
        metrics.record_cache_lookup(CacheTier::L1, false);
        metrics.record_breaker_transition("open");
        metrics.record_model_call("gbt-short", Duration::from_millis(3), true);
        metrics.record_model_call("gbt-short", Duration::from_millis(3), false);
        metrics.record_horizon_latency(6, Duration::from_millis(8));

        assert_eq!(metrics.assessments_total.get(), 3);
        assert_eq!(metrics.assessments_failed.get(), 2);
        assert_eq!(metrics.error_count("timeout"), 1);
        assert_eq!(metrics.error_count("resource_exhausted"), 1);
        assert_eq!(metrics.l1.hit_rate(), 0.5);
        assert_eq!(metrics.breaker_transition_count("open"), 1);
        assert_eq!(metrics.model_metrics("gbt-short").unwrap().error_rate(), 0.5);
        assert_eq!(metrics.horizon_latency(6).unwrap().total, 1);

        let text = metrics.to_prometheus();
        assert!(text.contains("risk_assessments_total 3"));
        assert!(text.contains("risk_cache_lookups_total{tier=\"l1\",result=\"hit\"} 1"));
        assert!(text.contains("risk_breaker_transitions_total{to=\"open\"} 1"));
        assert!(text.contains("risk_model_errors_total{model=\"gbt-short\"} 1"));
    }

    struct CountingSink {
        counts: AtomicUsize,
        observations: AtomicUsize,
    }

    impl MetricsSink for CountingSink {
        fn increment(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: u64) {
            self.counts.fetch_add(1, Ordering::SeqCst);
        }

        fn observe(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {
            self.observations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sink_receives_observations() {
        let sink = Arc::new(CountingSink {
            counts: AtomicUsize::new(0),
            observations: AtomicUsize::new(0),
        });
        let metrics = EngineMetrics::new().with_sink(sink.clone());

        metrics.record_assessment(Duration::from_millis(5), None);
        metrics.record_cache_lookup(CacheTier::L2, false);
        metrics.record_validation(true);

        assert_eq!(sink.counts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.observations.load(Ordering::SeqCst), 1);
    }
}
