//! Circuit Breaker
//!
//! Guards the router against a failing model path.
//!
//! ```text
//! +--------+  failure_threshold   +-------+   recovery_timeout   +------------+
//! | Closed | -------------------> | Open  | -------------------> | Half-Open  |
//! +--------+  consecutive fails   +-------+                      +------------+
//!     ^                               ^      any trial failure         |
//!     |                               +--------------------------------+
//!     |         half_open_max_calls trials succeed                     |
//!     +----------------------------------------------------------------+
//! ```
//!
//! - **Closed**: requests flow; consecutive failures are counted, a success resets the count
//! - **Open**: requests are rejected with `CircuitOpen` without touching the router
//! - **Half-Open**: at most `half_open_max_calls` trials are admitted
//!
//! Callers hold a [`BreakerPermit`] for the duration of a call. Dropping a
//! permit without recording an outcome (cancellation) records nothing and
//! hands a half-open trial slot back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::metrics::EngineMetrics;

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing
    pub recovery_timeout: Duration,
    /// Trials admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting requests
    Open,
    /// Admitting a limited number of trials
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    /// Trials admitted in the current half-open window
    trials_started: u32,
    trials_succeeded: u32,
}

/// Serializable view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Milliseconds until a trial will be admitted, when open
    pub retry_after_ms: Option<u64>,
    /// Milliseconds since the last recorded failure
    pub last_failure_ms_ago: Option<u64>,
}

/// Per-engine circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: Arc<EngineMetrics>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::default()),
            metrics,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without applying the open -> half-open timeout
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            retry_after_ms: match (inner.state, inner.opened_at) {
                (CircuitState::Open, Some(opened)) => Some(self.retry_after(opened, now)),
                _ => None,
            },
            last_failure_ms_ago: inner
                .last_failure
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
        }
    }

    fn retry_after(&self, opened_at: Instant, now: Instant) -> u64 {
        (opened_at + self.config.recovery_timeout)
            .saturating_duration_since(now)
            .as_millis() as u64
    }

    /// Ask to make a call
    ///
    /// Fails with `CircuitOpen` while open, or while half-open with every
    /// trial slot taken.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, EngineError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let opened_at = inner.opened_at.unwrap_or(now);
            if now < opened_at + self.config.recovery_timeout {
                return Err(EngineError::CircuitOpen {
                    retry_after_ms: self.retry_after(opened_at, now),
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self.clone(), false)),
            CircuitState::HalfOpen => {
                if inner.trials_started >= self.config.half_open_max_calls.max(1) {
                    return Err(EngineError::CircuitOpen { retry_after_ms: 0 });
                }
                inner.trials_started += 1;
                Ok(BreakerPermit::new(self.clone(), true))
            }
            CircuitState::Open => Err(EngineError::CircuitOpen {
                retry_after_ms: self.config.recovery_timeout.as_millis() as u64,
            }),
        }
    }

    fn on_success(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.half_open_max_calls.max(1) {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            // Late result from a call admitted before the state changed
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn on_cancel(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_started = inner.trials_started.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.trials_started = 0;
        inner.trials_succeeded = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                warn!(
                    from = from.as_str(),
                    failures = inner.consecutive_failures,
                    recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(trials = self.config.half_open_max_calls, "Circuit breaker transitioning to half-open");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                info!("Circuit breaker closed, model path recovered");
            }
        }
        self.metrics.record_breaker_transition(to.as_str());
    }
}

/// Admission to make one call through the breaker
///
/// Consume it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unconsumed means the
/// call was cancelled.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is a half-open trial
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Record `result` if it is a breaker-relevant outcome
    ///
    /// Errors that are not model-path failures count as neither success nor
    /// failure.
    pub fn record<T>(self, result: &Result<T, EngineError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.counts_toward_breaker() => self.record_failure(),
            Err(_) => drop(self),
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_cancel(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;

    fn breaker(threshold: u32, trials: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
                half_open_max_calls: trials,
            },
            Arc::new(EngineMetrics::new()),
        ))
    }

    fn fail(b: &Arc<CircuitBreaker>) {
        b.try_acquire().unwrap().record_failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let b = breaker(3, 1);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);

        match b.try_acquire() {
            Err(EngineError::CircuitOpen { retry_after_ms }) => assert_eq!(retry_after_ms, 30_000),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(b.metrics.breaker_transition_count("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(3, 1);
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().record_success();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_limited_trials_then_closes() {
        let b = breaker(1, 2);
        fail(&b);
        tokio::time::advance(Duration::from_secs(31)).await;

        let p1 = b.try_acquire().unwrap();
        let p2 = b.try_acquire().unwrap();
        assert!(p1.is_trial() && p2.is_trial());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(EngineError::CircuitOpen { .. })));

        p1.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        p2.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics.breaker_transition_count("closed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_and_restarts_timer() {
        let b = breaker(1, 2);
        fail(&b);
        tokio::time::advance(Duration::from_secs(31)).await;

        b.try_acquire().unwrap().record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        match b.try_acquire() {
            Err(EngineError::CircuitOpen { retry_after_ms }) => assert_eq!(retry_after_ms, 20_000),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(b.metrics.breaker_transition_count("open"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_returns_its_slot() {
        let b = breaker(1, 1);
        fail(&b);
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = b.try_acquire().unwrap();
        assert!(b.try_acquire().is_err());
        drop(trial);

        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap().record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_model_errors_are_not_counted() {
        let b = breaker(1, 1);
        let cache_timeout: Result<(), _> = Err(EngineError::Timeout {
            stage: crate::error::Stage::Cache,
            timeout_ms: 10,
        });
        b.try_acquire().unwrap().record(&cache_timeout);
        assert_eq!(b.state(), CircuitState::Closed);

        let model: Result<(), _> = Err(EngineError::model(ModelError::NotLoaded {
            model_id: "m".into(),
        }));
        b.try_acquire().unwrap().record(&model);
        assert_eq!(b.state(), CircuitState::Open);
    }
}
