//! Risk Engine - Command-Line Host
//!
//! Hosts the scoring core as a JSON-lines service and exposes the offline
//! certification tools.
//!
//! # Usage
//!
//! ```bash
//! # Serve JSON-lines commands on stdin/stdout
//! risk-engine serve
//!
//! # Serve with weights from a previous validation run
//! risk-engine serve --weights weights.json
//!
//! # One-off assessment
//! risk-engine assess --business-id acme --horizons 3,12
//!
//! # Accuracy certification; exits 2 when a target is missed
//! risk-engine validate --folds 5 --horizons 6 --weights-out weights.json
//!
//! # Latency certification; exits 2 when the SLA is missed
//! risk-engine benchmark --iterations 1000 --concurrency 10
//!
//! # Verbose logging (always on stderr)
//! RUST_LOG=debug risk-engine serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop reading commands, finish in-flight ones, exit

mod server;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use risk_engine_core::config::{load_config_from_path, ConfigOverrides};
use risk_engine_core::validation::{DatasetSource, EngineTarget, LabeledDataset, SyntheticSpec};
use risk_engine_core::{
    bootstrap, BenchmarkRunner, BusinessSignals, EngineConfigFile, EngineHandle, ModelType, RiskAssessmentRequest,
    WeightTable,
};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit code for a run that completed but missed its targets
const TARGETS_MISSED: u8 = 2;

/// Risk Engine - multi-horizon business risk scoring
#[derive(Parser, Debug)]
#[command(name = "risk-engine")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RISK_ENGINE_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RISK_ENGINE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Command,
}

/// Settings that take precedence over file and environment
#[derive(ClapArgs, Debug, Default)]
struct OverrideArgs {
    /// Concurrent assessments admitted
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Per-request deadline in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Shared L2 cache service URL
    #[arg(long, global = true)]
    l2_url: Option<String>,

    /// Short-horizon model artifact
    #[arg(long, global = true, value_name = "FILE")]
    short_model: Option<PathBuf>,

    /// Long-horizon model artifact
    #[arg(long, global = true, value_name = "FILE")]
    long_model: Option<PathBuf>,

    /// Serve synthetic models when no artifact is configured
    #[arg(long, global = true)]
    allow_synthetic: bool,

    /// Simulated latency for synthetic models
    #[arg(long, global = true)]
    synthetic_latency_ms: Option<u64>,

    /// Validation history file (JSON lines)
    #[arg(long, global = true, value_name = "FILE")]
    history_path: Option<PathBuf>,

    /// Disable prefetch of hot cache entries
    #[arg(long, global = true)]
    no_prefetch: bool,
}

impl OverrideArgs {
    fn to_overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(n) = self.max_concurrent {
            overrides = overrides.with_max_concurrent(n);
        }
        if let Some(ms) = self.request_timeout_ms {
            overrides = overrides.with_request_timeout_ms(ms);
        }
        if let Some(url) = &self.l2_url {
            overrides = overrides.with_l2_url(url.clone());
        }
        if let Some(path) = &self.short_model {
            overrides = overrides.with_short_artifact(path.clone());
        }
        if let Some(path) = &self.long_model {
            overrides = overrides.with_long_artifact(path.clone());
        }
        if self.allow_synthetic {
            overrides = overrides.with_allow_synthetic(true);
        }
        if let Some(ms) = self.synthetic_latency_ms {
            overrides = overrides.with_synthetic_latency_ms(ms);
        }
        if let Some(path) = &self.history_path {
            overrides = overrides.with_history_path(path.clone());
        }
        if self.no_prefetch {
            overrides = overrides.with_prefetch_enabled(false);
        }
        overrides
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve JSON-lines commands on stdin, replies on stdout
    Serve {
        /// Weight table written by `validate --weights-out`
        #[arg(long, value_name = "FILE")]
        weights: Option<PathBuf>,
    },

    /// Assess one business and print the result
    Assess(AssessArgs),

    /// Cross-validate the ensemble against labelled outcomes
    Validate(ValidateArgs),

    /// Measure assessment latency against the SLA
    Benchmark(BenchmarkArgs),

    /// Print bootstrap and engine health
    Health,
}

#[derive(ClapArgs, Debug)]
struct AssessArgs {
    #[arg(long)]
    business_id: String,

    /// Horizons in months
    #[arg(long, value_delimiter = ',', default_value = "3,6,9,12")]
    horizons: Vec<u32>,

    /// auto, model_a, model_b or ensemble
    #[arg(long, default_value = "auto")]
    model_type: ModelType,

    /// JSON file with business signals
    #[arg(long, value_name = "FILE")]
    signals: Option<PathBuf>,

    #[arg(long)]
    uncertainty: bool,

    #[arg(long)]
    comparison: bool,
}

#[derive(ClapArgs, Debug)]
struct ValidateArgs {
    #[arg(long)]
    folds: Option<usize>,

    #[arg(long, value_delimiter = ',')]
    horizons: Option<Vec<u32>>,

    /// JSON-lines dataset; synthetic data when omitted
    #[arg(long, value_name = "FILE")]
    dataset: Option<PathBuf>,

    /// Synthetic dataset size
    #[arg(long)]
    samples: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the recommended weight table here
    #[arg(long, value_name = "FILE")]
    weights_out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct BenchmarkArgs {
    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    warmup: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Distinct businesses to cycle through
    #[arg(long, default_value_t = 500)]
    businesses: usize,

    #[arg(long, value_delimiter = ',', default_value = "3,6,9,12")]
    horizons: Vec<u32>,

    /// Bypass the cache so every call reaches the models
    #[arg(long)]
    cold: bool,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries results.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("risk_engine={level},risk_engine_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> Result<EngineConfigFile> {
    let mut config = load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides.to_overrides().apply(&mut config);
    info!(
        source = %config.source(),
        file = ?config.config_file_path,
        "Configuration loaded"
    );
    Ok(config)
}

async fn read_weights(path: &Path) -> Result<WeightTable> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read weights: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid weight table: {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Flip `shutdown` on SIGTERM or SIGINT
fn spawn_signal_handler() -> Result<watch::Receiver<bool>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}

async fn serve(handle: EngineHandle, weights: Option<PathBuf>) -> Result<ExitCode> {
    if let Some(path) = weights {
        let table = read_weights(&path).await?;
        let source = table.source.clone();
        let version = handle.engine.apply_weights(table);
        info!(%source, version, "Applied weight table");
    }

    let shutdown = spawn_signal_handler()?;
    handle.start_background();
    info!(
        routing_version = %handle.router.routing_version(),
        "Serving JSON-lines commands on stdin"
    );

    let result = server::serve(
        handle.clone(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await;
    handle.shutdown().await;
    result.map(|_| ExitCode::SUCCESS)
}

async fn assess(handle: &EngineHandle, args: AssessArgs) -> Result<ExitCode> {
    let AssessArgs {
        business_id,
        horizons,
        model_type,
        signals,
        uncertainty,
        comparison,
    } = args;

    let signals = match signals {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read signals: {}", path.display()))?;
            serde_json::from_str::<BusinessSignals>(&raw)
                .with_context(|| format!("Invalid signals: {}", path.display()))?
        }
        None => BusinessSignals::default(),
    };

    let request = RiskAssessmentRequest::new(business_id, horizons)
        .with_model_type(model_type)
        .with_signals(signals)
        .with_uncertainty(uncertainty)
        .with_model_comparison(comparison);
    let result = handle.engine.assess(&request).await.context("Assessment failed")?;
    print_json(&result)?;
    Ok(ExitCode::SUCCESS)
}

async fn validate(handle: &EngineHandle, args: ValidateArgs) -> Result<ExitCode> {
    let ValidateArgs {
        folds,
        horizons,
        dataset,
        samples,
        seed,
        weights_out,
    } = args;
    let mut config = handle.config.validation.clone();
    if let Some(folds) = folds {
        config.folds = folds;
    }
    if let Some(horizons) = horizons {
        config.horizons = horizons;
    }
    if let Some(seed) = seed {
        config.seed = seed;
    }
    if let Some(path) = dataset {
        config.dataset = DatasetSource::Jsonl { path };
    } else if let DatasetSource::Synthetic(spec) = &mut config.dataset {
        if let Some(size) = samples {
            spec.size = size;
        }
    }

    let result = handle.harness.validate(&config).await.context("Validation failed")?;
    print_json(&result)?;

    if let Some(path) = weights_out {
        let table = result.weight_table();
        tokio::fs::write(&path, serde_json::to_vec_pretty(&table)?)
            .await
            .with_context(|| format!("Failed to write weights: {}", path.display()))?;
        info!(path = %path.display(), "Wrote recommended weights");
    }

    match result.ensure_targets() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            warn!(error = %e, "Validation targets missed");
            Ok(ExitCode::from(TARGETS_MISSED))
        }
    }
}

async fn benchmark(handle: &EngineHandle, args: BenchmarkArgs) -> Result<ExitCode> {
    let BenchmarkArgs {
        iterations,
        warmup,
        concurrency,
        businesses,
        horizons,
        cold,
    } = args;
    let mut config = handle.config.benchmark.clone();
    if let Some(n) = iterations {
        config.iterations = n;
    }
    if let Some(n) = warmup {
        config.warmup = n;
    }
    if let Some(n) = concurrency {
        config.concurrency = n;
    }

    let dataset = LabeledDataset::synthetic(&SyntheticSpec {
        size: businesses.max(1),
        ..SyntheticSpec::default()
    })
    .context("Failed to build benchmark requests")?;
    let requests = dataset
        .samples
        .iter()
        .map(|s| s.to_request(horizons.iter().copied()).with_force_refresh(cold))
        .collect();

    let target = EngineTarget::new(handle.engine.clone(), requests).map_err(anyhow::Error::msg)?;
    let runner = BenchmarkRunner::new(config).map_err(anyhow::Error::msg)?;
    let report = runner.run(Arc::new(target)).await;
    print_json(&report)?;

    if report.sla_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(p95 = report.latency.p95, p99 = report.latency.p99, "SLA missed");
        Ok(ExitCode::from(TARGETS_MISSED))
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let handle = bootstrap::build(config).await.context("Failed to start engine")?;
    for reason in &handle.degraded.reasons {
        warn!(reason = %reason, "Degraded");
    }

    match args.command {
        Command::Serve { weights } => serve(handle, weights).await,
        Command::Assess(args) => assess(&handle, args).await,
        Command::Validate(args) => validate(&handle, args).await,
        Command::Benchmark(args) => benchmark(&handle, args).await,
        Command::Health => {
            let health = handle.engine.health().await;
            print_json(&serde_json::json!({
                "engine": health,
                "degraded": handle.degraded,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Risk engine starting");

    match run(args).await {
        Ok(code) => Ok(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Risk engine stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use risk_engine_core::routing::BlendWeights;

    #[test]
    fn test_global_overrides_after_subcommand() {
        let args = Args::try_parse_from([
            "risk-engine",
            "benchmark",
            "--cold",
            "--max-concurrent",
            "8",
            "--allow-synthetic",
        ])
        .unwrap();

        assert_eq!(args.overrides.max_concurrent, Some(8));
        assert!(args.overrides.allow_synthetic);
        match args.command {
            Command::Benchmark(bench) => {
                assert!(bench.cold);
                assert_eq!(bench.horizons, vec![3, 6, 9, 12]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_assess_parses_model_type() {
        let args = Args::try_parse_from([
            "risk-engine",
            "assess",
            "--business-id",
            "acme",
            "--horizons",
            "3,12",
            "--model-type",
            "ensemble",
        ])
        .unwrap();

        match args.command {
            Command::Assess(assess) => {
                assert_eq!(assess.horizons, vec![3, 12]);
                assert_eq!(assess.model_type, ModelType::Ensemble);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Args::try_parse_from(["risk-engine", "assess", "--business-id", "a", "--model-type", "x"]).is_err());
    }

    #[tokio::test]
    async fn test_read_weights_from_validate_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let table = WeightTable::equal().with_horizon(6, BlendWeights::from_short_share(0.7));
        tokio::fs::write(&path, serde_json::to_vec(&table).unwrap()).await.unwrap();

        let loaded = read_weights(&path).await.unwrap();
        assert_eq!(loaded, table);

        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(read_weights(&path).await.is_err());
    }
}
