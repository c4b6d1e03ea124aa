//! TOML Configuration File Support
//!
//! Centralized configuration loading for the risk engine, from a TOML file
//! at `~/.config/risk-engine/engine.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RISK_ENGINE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/risk-engine/engine.toml` (typically `~/.config/risk-engine/engine.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [engine]
//! max_concurrent = 64
//! request_timeout_ms = 500
//! result_ttl_secs = 300
//! supported_horizons = [3, 6, 9, 12]
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 30
//!
//! [router]
//! short_horizon_max = 3
//! long_horizon_min = 9
//!
//! [models]
//! short_artifact = "/var/lib/risk-engine/gbt-short.json"
//! long_artifact = "/var/lib/risk-engine/gru-long.json"
//!
//! [cache]
//! l1_capacity = 10000
//! l2_url = "http://kv.internal:8200"
//!
//! [prefetch]
//! popularity_threshold = 5
//!
//! [validation]
//! folds = 5
//! default_accuracy_target = 0.8
//! history_path = "/var/lib/risk-engine/validation.jsonl"
//!
//! [validation.accuracy_targets]
//! "12" = 0.75
//!
//! [benchmark]
//! iterations = 1000
//! sla_p95_ms = 100
//! max_error_rate = 0.01
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheConfig, PrefetchConfig};
use crate::engine::EngineConfig;
use crate::routing::RouterConfig;
use crate::validation::{BenchmarkConfig, DatasetSource, SyntheticSpec, ValidationConfig};

/// Prefix of every environment variable the loader reads
pub const ENV_PREFIX: &str = "RISK_ENGINE_";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {}: {source}", path.display())]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Engine section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Concurrent assessments admitted
    pub max_concurrent: Option<usize>,

    /// Per-request deadline in milliseconds
    pub request_timeout_ms: Option<u64>,

    /// TTL for complete results in seconds
    pub result_ttl_secs: Option<u64>,

    /// TTL for degraded results in seconds
    pub degraded_ttl_secs: Option<u64>,

    /// Horizons (months) requests may ask for
    pub supported_horizons: Option<Vec<u32>>,

    /// Maximum horizons per request
    pub max_horizons: Option<usize>,

    /// Maximum months of payment history per request
    pub max_history_len: Option<usize>,
}

/// Circuit breaker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_secs: Option<u64>,
    pub half_open_max_calls: Option<u32>,
}

/// Router section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    pub short_horizon_max: Option<u32>,
    pub long_horizon_min: Option<u32>,
    pub blend_long_horizons: Option<bool>,
    pub disagreement_penalty_scale: Option<f64>,
    pub fallback_confidence_penalty: Option<f64>,
    pub uncertainty_scale: Option<f64>,
}

/// Models section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsToml {
    /// Tree ensemble artifact (JSON)
    pub short_artifact: Option<PathBuf>,

    /// Sequence model artifact (JSON)
    pub long_artifact: Option<PathBuf>,

    /// Serve closed-form synthetic models when an artifact is not configured
    pub allow_synthetic: Option<bool>,

    /// Simulated latency of synthetic models in milliseconds
    pub synthetic_latency_ms: Option<u64>,
}

/// Cache section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    pub l1_capacity: Option<usize>,
    pub l1_ttl_secs: Option<u64>,
    pub namespace: Option<String>,

    /// Base URL of the shared key-value service; unset keeps L2 in-process
    pub l2_url: Option<String>,

    pub l2_timeout_ms: Option<u64>,
}

/// Prefetch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchToml {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub popularity_threshold: Option<u64>,
    pub refresh_window_secs: Option<u64>,
    pub max_items: Option<usize>,
    pub concurrency: Option<usize>,
}

/// Validation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationToml {
    pub folds: Option<usize>,
    pub seed: Option<u64>,
    pub horizons: Option<Vec<u32>>,
    pub default_accuracy_target: Option<f64>,

    /// Per-horizon accuracy targets; TOML keys are the horizon in months
    pub accuracy_targets: Option<BTreeMap<String, f64>>,

    pub max_mae: Option<f64>,
    pub max_calibration_error: Option<f64>,
    pub weight_grid_step: Option<f64>,
    pub concurrency: Option<usize>,

    /// Labelled JSON lines dataset; unset uses the synthetic generator
    pub dataset_path: Option<PathBuf>,

    pub synthetic_size: Option<usize>,
    pub synthetic_seed: Option<u64>,

    /// Append-only history file; unset keeps history in memory
    pub history_path: Option<PathBuf>,
}

/// Benchmark section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkToml {
    pub iterations: Option<usize>,
    pub warmup: Option<usize>,
    pub concurrency: Option<usize>,
    pub sla_p95_ms: Option<f64>,
    pub sla_p99_ms: Option<f64>,
    pub max_error_rate: Option<f64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigToml {
    pub engine: EngineToml,
    pub breaker: BreakerToml,
    pub router: RouterToml,
    pub models: ModelsToml,
    pub cache: CacheToml,
    pub prefetch: PrefetchToml,
    pub validation: ValidationToml,
    pub benchmark: BenchmarkToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Where the scoring models come from
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ModelsConfig {
    pub short_artifact: Option<PathBuf>,
    pub long_artifact: Option<PathBuf>,
    pub allow_synthetic: bool,
    pub synthetic_latency: Duration,
}

/// Everything [`bootstrap::build`](crate::bootstrap::build) needs
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct EngineConfigFile {
    pub engine: EngineConfig,
    pub router: RouterConfig,
    pub models: ModelsConfig,
    pub cache: CacheConfig,
    /// Shared L2 service; `None` keeps L2 in-process
    pub l2_url: Option<String>,
    pub validation: ValidationConfig,
    /// `None` keeps validation history in memory
    pub history_path: Option<PathBuf>,
    pub benchmark: BenchmarkConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for EngineConfigFile {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            router: RouterConfig::default(),
            models: ModelsConfig::default(),
            cache: CacheConfig::default(),
            l2_url: None,
            validation: ValidationConfig::default(),
            history_path: None,
            benchmark: BenchmarkConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Cross-field checks
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
        let engine = &self.engine;

        if engine.max_concurrent == 0 {
            return invalid("engine.max_concurrent must be positive".into());
        }
        if engine.request_timeout.is_zero() {
            return invalid("engine.request_timeout_ms must be positive".into());
        }
        if engine.limits.supported_horizons.is_empty() {
            return invalid("engine.supported_horizons must not be empty".into());
        }
        if engine.limits.supported_horizons.contains(&0) {
            return invalid("engine.supported_horizons must be positive".into());
        }
        if engine.limits.max_horizons == 0 {
            return invalid("engine.max_horizons must be positive".into());
        }
        if engine.degraded_ttl > engine.result_ttl {
            return invalid(format!(
                "engine.degraded_ttl ({:?}) must not exceed engine.result_ttl ({:?})",
                engine.degraded_ttl, engine.result_ttl
            ));
        }
        if engine.breaker.failure_threshold == 0 || engine.breaker.half_open_max_calls == 0 {
            return invalid("breaker thresholds must be positive".into());
        }
        if engine.prefetch.enabled && engine.prefetch.interval.is_zero() {
            return invalid("prefetch.interval_secs must be positive when prefetch is enabled".into());
        }
        if engine.prefetch.concurrency == 0 {
            return invalid("prefetch.concurrency must be positive".into());
        }
        if self.cache.l1_capacity == 0 {
            return invalid("cache.l1_capacity must be positive".into());
        }
        if self.cache.l2_timeout.is_zero() {
            return invalid("cache.l2_timeout_ms must be positive".into());
        }

        self.router.validate().map_err(ConfigError::ValidationError)?;
        self.validation
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if let Some(unsupported) = self
            .validation
            .horizons
            .iter()
            .find(|h| !engine.limits.supported_horizons.contains(h))
        {
            return invalid(format!("validation horizon {unsupported} is not a supported horizon"));
        }
        self.benchmark.validate().map_err(ConfigError::ValidationError)?;
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/risk-engine/engine.toml` or
/// `~/.config/risk-engine/engine.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("risk-engine").join("engine.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<EngineConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfigFile, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment values through `env`
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<EngineConfigFile, ConfigError> {
    // Start with defaults
    let mut config = EngineConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: EngineConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Environment overrides file values
    apply_env_config(&mut config, env)?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut EngineConfigFile, toml: &EngineConfigToml) -> Result<(), ConfigError> {
    // Engine settings
    let engine = &mut config.engine;
    if let Some(n) = toml.engine.max_concurrent {
        engine.max_concurrent = n;
    }
    if let Some(ms) = toml.engine.request_timeout_ms {
        engine.request_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.engine.result_ttl_secs {
        engine.result_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.engine.degraded_ttl_secs {
        engine.degraded_ttl = Duration::from_secs(secs);
    }
    if let Some(ref horizons) = toml.engine.supported_horizons {
        engine.limits.supported_horizons = horizons.clone();
    }
    if let Some(n) = toml.engine.max_horizons {
        engine.limits.max_horizons = n;
    }
    if let Some(n) = toml.engine.max_history_len {
        engine.limits.max_history_len = n;
    }

    // Breaker settings
    if let Some(n) = toml.breaker.failure_threshold {
        engine.breaker.failure_threshold = n;
    }
    if let Some(secs) = toml.breaker.recovery_timeout_secs {
        engine.breaker.recovery_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = toml.breaker.half_open_max_calls {
        engine.breaker.half_open_max_calls = n;
    }

    // Prefetch settings
    apply_prefetch(&mut engine.prefetch, &toml.prefetch);

    // Router settings
    let router = &mut config.router;
    if let Some(v) = toml.router.short_horizon_max {
        router.short_horizon_max = v;
    }
    if let Some(v) = toml.router.long_horizon_min {
        router.long_horizon_min = v;
    }
    if let Some(v) = toml.router.blend_long_horizons {
        router.blend_long_horizons = v;
    }
    if let Some(v) = toml.router.disagreement_penalty_scale {
        router.disagreement_penalty_scale = v;
    }
    if let Some(v) = toml.router.fallback_confidence_penalty {
        router.fallback_confidence_penalty = v;
    }
    if let Some(v) = toml.router.uncertainty_scale {
        router.uncertainty_scale = v;
    }

    // Model settings
    if toml.models.short_artifact.is_some() {
        config.models.short_artifact = toml.models.short_artifact.clone();
    }
    if toml.models.long_artifact.is_some() {
        config.models.long_artifact = toml.models.long_artifact.clone();
    }
    if let Some(allow) = toml.models.allow_synthetic {
        config.models.allow_synthetic = allow;
    }
    if let Some(ms) = toml.models.synthetic_latency_ms {
        config.models.synthetic_latency = Duration::from_millis(ms);
    }

    // Cache settings
    if let Some(n) = toml.cache.l1_capacity {
        config.cache.l1_capacity = n;
    }
    if let Some(secs) = toml.cache.l1_ttl_secs {
        config.cache.l1_ttl = Duration::from_secs(secs);
    }
    if let Some(ref namespace) = toml.cache.namespace {
        config.cache.namespace = namespace.clone();
    }
    if toml.cache.l2_url.is_some() {
        config.l2_url = toml.cache.l2_url.clone();
    }
    if let Some(ms) = toml.cache.l2_timeout_ms {
        config.cache.l2_timeout = Duration::from_millis(ms);
    }

    apply_validation(config, &toml.validation)?;

    // Benchmark settings
    let bench = &mut config.benchmark;
    if let Some(n) = toml.benchmark.iterations {
        bench.iterations = n;
    }
    if let Some(n) = toml.benchmark.warmup {
        bench.warmup = n;
    }
    if let Some(n) = toml.benchmark.concurrency {
        bench.concurrency = n;
    }
    if let Some(ms) = toml.benchmark.sla_p95_ms {
        bench.sla_p95_ms = ms;
    }
    if let Some(ms) = toml.benchmark.sla_p99_ms {
        bench.sla_p99_ms = ms;
    }
    if let Some(rate) = toml.benchmark.max_error_rate {
        bench.max_error_rate = rate;
    }
    Ok(())
}

fn apply_prefetch(prefetch: &mut PrefetchConfig, toml: &PrefetchToml) {
    if let Some(enabled) = toml.enabled {
        prefetch.enabled = enabled;
    }
    if let Some(secs) = toml.interval_secs {
        prefetch.interval = Duration::from_secs(secs);
    }
    if let Some(n) = toml.popularity_threshold {
        prefetch.popularity_threshold = n;
    }
    if let Some(secs) = toml.refresh_window_secs {
        prefetch.refresh_window = Duration::from_secs(secs);
    }
    if let Some(n) = toml.max_items {
        prefetch.max_items = n;
    }
    if let Some(n) = toml.concurrency {
        prefetch.concurrency = n;
    }
}

fn apply_validation(config: &mut EngineConfigFile, toml: &ValidationToml) -> Result<(), ConfigError> {
    let validation = &mut config.validation;
    if let Some(n) = toml.folds {
        validation.folds = n;
    }
    if let Some(seed) = toml.seed {
        validation.seed = seed;
    }
    if let Some(ref horizons) = toml.horizons {
        validation.horizons = horizons.clone();
    }
    if let Some(target) = toml.default_accuracy_target {
        validation.default_accuracy_target = target;
    }
    if let Some(ref targets) = toml.accuracy_targets {
        for (horizon, target) in targets {
            let months: u32 = horizon.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "validation.accuracy_targets key `{horizon}` is not a horizon in months"
                ))
            })?;
            validation.accuracy_targets.insert(months, *target);
        }
    }
    if toml.max_mae.is_some() {
        validation.max_mae = toml.max_mae;
    }
    if toml.max_calibration_error.is_some() {
        validation.max_calibration_error = toml.max_calibration_error;
    }
    if let Some(step) = toml.weight_grid_step {
        validation.weight_grid_step = step;
    }
    if let Some(n) = toml.concurrency {
        validation.concurrency = n;
    }

    if let Some(ref path) = toml.dataset_path {
        validation.dataset = DatasetSource::Jsonl { path: path.clone() };
    } else if toml.synthetic_size.is_some() || toml.synthetic_seed.is_some() {
        let mut spec = SyntheticSpec::default();
        if let Some(size) = toml.synthetic_size {
            spec.size = size;
        }
        if let Some(seed) = toml.synthetic_seed {
            spec.seed = seed;
        }
        validation.dataset = DatasetSource::Synthetic(spec);
    }

    if toml.history_path.is_some() {
        config.history_path = toml.history_path.clone();
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{ENV_PREFIX}{key}={raw:?} could not be parsed"))
    })
}

fn parse_flag(raw: &str) -> bool {
    raw != "0" && !raw.eq_ignore_ascii_case("false")
}

/// Apply environment variable overrides to the config
///
/// A set but unparsable variable is an error, not a silent fallback.
fn apply_env_config(
    config: &mut EngineConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |key: &str| env(&format!("{ENV_PREFIX}{key}"));
    let mut touched = false;

    if let Some(raw) = var("MAX_CONCURRENT") {
        config.engine.max_concurrent = parse_env("MAX_CONCURRENT", &raw)?;
        touched = true;
    }
    if let Some(raw) = var("REQUEST_TIMEOUT_MS") {
        config.engine.request_timeout = Duration::from_millis(parse_env("REQUEST_TIMEOUT_MS", &raw)?);
        touched = true;
    }
    if let Some(raw) = var("BREAKER_THRESHOLD") {
        config.engine.breaker.failure_threshold = parse_env("BREAKER_THRESHOLD", &raw)?;
        touched = true;
    }
    if let Some(raw) = var("PREFETCH") {
        config.engine.prefetch.enabled = parse_flag(&raw);
        touched = true;
    }
    if let Some(raw) = var("L1_CAPACITY") {
        config.cache.l1_capacity = parse_env("L1_CAPACITY", &raw)?;
        touched = true;
    }
    if let Some(url) = var("L2_URL") {
        config.l2_url = Some(url).filter(|u| !u.is_empty());
        touched = true;
    }
    if let Some(path) = var("SHORT_MODEL") {
        config.models.short_artifact = Some(PathBuf::from(path));
        touched = true;
    }
    if let Some(path) = var("LONG_MODEL") {
        config.models.long_artifact = Some(PathBuf::from(path));
        touched = true;
    }
    if let Some(raw) = var("ALLOW_SYNTHETIC") {
        config.models.allow_synthetic = parse_flag(&raw);
        touched = true;
    }
    if let Some(path) = var("HISTORY_PATH") {
        config.history_path = Some(PathBuf::from(path));
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub max_concurrent: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub l2_url: Option<String>,
    pub short_artifact: Option<PathBuf>,
    pub long_artifact: Option<PathBuf>,
    pub allow_synthetic: Option<bool>,
    pub synthetic_latency_ms: Option<u64>,
    pub history_path: Option<PathBuf>,
    pub prefetch_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    #[must_use]
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_l2_url(mut self, url: String) -> Self {
        self.l2_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_short_artifact(mut self, path: PathBuf) -> Self {
        self.short_artifact = Some(path);
        self
    }

    #[must_use]
    pub fn with_long_artifact(mut self, path: PathBuf) -> Self {
        self.long_artifact = Some(path);
        self
    }

    #[must_use]
    pub fn with_allow_synthetic(mut self, allow: bool) -> Self {
        self.allow_synthetic = Some(allow);
        self
    }

    #[must_use]
    pub fn with_synthetic_latency_ms(mut self, ms: u64) -> Self {
        self.synthetic_latency_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_history_path(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_prefetch_enabled(mut self, enabled: bool) -> Self {
        self.prefetch_enabled = Some(enabled);
        self
    }

    fn is_empty(&self) -> bool {
        self.max_concurrent.is_none()
            && self.request_timeout_ms.is_none()
            && self.l2_url.is_none()
            && self.short_artifact.is_none()
            && self.long_artifact.is_none()
            && self.allow_synthetic.is_none()
            && self.synthetic_latency_ms.is_none()
            && self.history_path.is_none()
            && self.prefetch_enabled.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut EngineConfigFile) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(n) = self.max_concurrent {
            config.engine.max_concurrent = n;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.engine.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ref url) = self.l2_url {
            config.l2_url = Some(url.clone());
        }
        if let Some(ref path) = self.short_artifact {
            config.models.short_artifact = Some(path.clone());
        }
        if let Some(ref path) = self.long_artifact {
            config.models.long_artifact = Some(path.clone());
        }
        if let Some(allow) = self.allow_synthetic {
            config.models.allow_synthetic = allow;
        }
        if let Some(ms) = self.synthetic_latency_ms {
            config.models.synthetic_latency = Duration::from_millis(ms);
        }
        if let Some(ref path) = self.history_path {
            config.history_path = Some(path.clone());
        }
        if let Some(enabled) = self.prefetch_enabled {
            config.engine.prefetch.enabled = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
