//! Engine Bootstrap
//!
//! The one place that turns an [`EngineConfigFile`] into running
//! components. Optional infrastructure that cannot be reached is replaced by
//! an in-process stand-in and reported in [`DegradedMode`]; the engine keeps
//! serving, with a cache that is not shared and history that does not
//! survive a restart.
//!
//! ```text
//!   config ──► models (artifacts | synthetic)
//!          ──► router ──────────────┐
//!          ──► L2 check ──► cache ──┼──► RiskEngine
//!          ──► history check ───────┴──► ValidationHarness
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheBackend, CacheBackendError, HttpKvBackend, InMemoryBackend, ResultCache};
use crate::config::{ConfigError, EngineConfigFile, ModelsConfig};
use crate::engine::RiskEngine;
use crate::metrics::EngineMetrics;
use crate::model::{ModelAdapter, ModelError, ModelSet, SequenceModel, SyntheticModel, TreeEnsembleModel};
use crate::prediction::ModelSlot;
use crate::routing::ModelEnsembleRouter;
use crate::validation::{InMemoryHistory, JsonlHistoryStore, ValidationHarness, ValidationHistoryStore};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no artifact configured for the {slot} model and synthetic models are not allowed")]
    MissingModel { slot: &'static str },

    #[error("failed to load the {slot} model: {source}")]
    ModelLoad {
        slot: &'static str,
        #[source]
        source: ModelError,
    },

    #[error("invalid L2 cache configuration: {0}")]
    CacheClient(#[source] CacheBackendError),
}

/// Why a component runs on its fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "component", rename_all = "snake_case")]
pub enum DegradedReason {
    /// Closed-form models stand in for a missing artifact
    SyntheticModels { slot: &'static str },
    /// L2 is configured but unhealthy; results are cached per process
    L2Unavailable { url: String },
    /// History file cannot be written; runs are kept in memory
    HistoryUnavailable { path: PathBuf, error: String },
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyntheticModels { slot } => write!(f, "{slot} model is synthetic"),
            Self::L2Unavailable { url } => write!(f, "L2 cache at {url} unavailable, using in-memory L2"),
            Self::HistoryUnavailable { path, error } => write!(
                f,
                "validation history at {} unavailable ({error}), keeping history in memory",
                path.display()
            ),
        }
    }
}

/// Every fallback bootstrap took
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DegradedMode {
    pub reasons: Vec<DegradedReason>,
}

impl DegradedMode {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.reasons.is_empty()
    }

    #[must_use]
    pub fn synthetic_models(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, DegradedReason::SyntheticModels { .. }))
    }

    #[must_use]
    pub fn in_memory_l2(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, DegradedReason::L2Unavailable { .. }))
    }

    #[must_use]
    pub fn in_memory_history(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, DegradedReason::HistoryUnavailable { .. }))
    }
}

/// Wired components
#[derive(Clone)]
pub struct EngineHandle {
    pub engine: RiskEngine,
    pub router: Arc<ModelEnsembleRouter>,
    pub harness: Arc<ValidationHarness>,
    pub metrics: Arc<EngineMetrics>,
    pub degraded: DegradedMode,
    pub config: Arc<EngineConfigFile>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Start cache maintenance; with prefetch disabled it only sweeps TTLs
    pub fn start_background(&self) {
        self.engine.start_background();
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

async fn load_slot(
    slot: ModelSlot,
    models: &ModelsConfig,
    degraded: &mut DegradedMode,
) -> Result<Arc<dyn ModelAdapter>, BootstrapError> {
    let name = slot.as_str();
    let artifact = match slot {
        ModelSlot::Short => models.short_artifact.as_ref(),
        ModelSlot::Long => models.long_artifact.as_ref(),
    };

    match artifact {
        Some(path) => {
            let adapter: Arc<dyn ModelAdapter> = match slot {
                ModelSlot::Short => Arc::new(TreeEnsembleModel::new("gbt-short")),
                ModelSlot::Long => Arc::new(SequenceModel::new("gru-long")),
            };
            adapter
                .load_model(path)
                .await
                .map_err(|source| BootstrapError::ModelLoad { slot: name, source })?;
            Ok(adapter)
        }
        None if models.allow_synthetic => {
            warn!(slot = name, "No artifact configured, serving synthetic model");
            degraded.reasons.push(DegradedReason::SyntheticModels { slot: name });
            let model = match slot {
                ModelSlot::Short => SyntheticModel::short_horizon(),
                ModelSlot::Long => SyntheticModel::long_horizon(),
            };
            Ok(Arc::new(model.with_latency(models.synthetic_latency)))
        }
        None => Err(BootstrapError::MissingModel { slot: name }),
    }
}

async fn connect_l2(
    config: &EngineConfigFile,
    degraded: &mut DegradedMode,
) -> Result<Arc<dyn CacheBackend>, BootstrapError> {
    let Some(url) = config.l2_url.as_deref() else {
        info!("No L2 service configured, using in-process L2");
        return Ok(Arc::new(InMemoryBackend::new()));
    };

    let backend = HttpKvBackend::new(url, config.cache.l2_timeout).map_err(BootstrapError::CacheClient)?;
    if backend.health_check().await {
        info!(url, "L2 cache reachable");
        Ok(Arc::new(backend))
    } else {
        warn!(url, "L2 cache unreachable, falling back to in-memory L2");
        degraded.reasons.push(DegradedReason::L2Unavailable { url: url.to_string() });
        Ok(Arc::new(InMemoryBackend::new()))
    }
}

async fn open_history(
    config: &EngineConfigFile,
    degraded: &mut DegradedMode,
) -> Arc<dyn ValidationHistoryStore> {
    let Some(path) = config.history_path.as_ref() else {
        return Arc::new(InMemoryHistory::new());
    };

    let store = JsonlHistoryStore::new(path);
    match store.ping().await {
        Ok(()) => Arc::new(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Validation history unavailable, keeping it in memory");
            degraded.reasons.push(DegradedReason::HistoryUnavailable {
                path: path.clone(),
                error: e.to_string(),
            });
            Arc::new(InMemoryHistory::new())
        }
    }
}

/// Build every component from `config`
///
/// Fails only for problems an operator must fix (invalid config, missing or
/// broken model artifacts, malformed L2 URL).
pub async fn build(config: EngineConfigFile) -> Result<EngineHandle, BootstrapError> {
    config.validate()?;
    let mut degraded = DegradedMode::default();
    let metrics = Arc::new(EngineMetrics::new());

    let short = load_slot(ModelSlot::Short, &config.models, &mut degraded).await?;
    let long = load_slot(ModelSlot::Long, &config.models, &mut degraded).await?;
    let router = Arc::new(ModelEnsembleRouter::new(
        ModelSet::new(short, long),
        config.router.clone(),
        metrics.clone(),
    ));

    let l2 = connect_l2(&config, &mut degraded).await?;
    let cache = Arc::new(ResultCache::new(config.cache.clone(), Some(l2), metrics.clone()));
    let history = open_history(&config, &mut degraded).await;

    let engine = RiskEngine::new(config.engine.clone(), router.clone(), cache, metrics.clone());
    let harness = Arc::new(ValidationHarness::new(router.clone(), history, metrics.clone()));

    if degraded.is_degraded() {
        for reason in &degraded.reasons {
            warn!(reason = %reason, "Running degraded");
        }
    }
    info!(
        routing_version = %router.routing_version(),
        max_concurrent = config.engine.max_concurrent,
        degraded = degraded.is_degraded(),
        source = %config.source(),
        "Risk engine ready"
    );

    Ok(EngineHandle {
        engine,
        router,
        harness,
        metrics,
        degraded,
        config: Arc::new(config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RiskAssessmentRequest;

    fn synthetic_config() -> EngineConfigFile {
        let mut config = EngineConfigFile::default();
        config.models.allow_synthetic = true;
        config
    }

    #[tokio::test]
    async fn test_missing_models_are_fatal_without_synthetic() {
        let err = build(EngineConfigFile::default()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::MissingModel { slot: "short" }));
    }

    #[tokio::test]
    async fn test_broken_artifact_is_fatal() {
        let mut config = synthetic_config();
        config.models.short_artifact = Some(PathBuf::from("/nonexistent/short.json"));
        let err = build(config).await.unwrap_err();
        assert!(matches!(err, BootstrapError::ModelLoad { slot: "short", .. }));
    }

    #[tokio::test]
    async fn test_synthetic_build_serves_requests() {
        let handle = build(synthetic_config()).await.unwrap();
        assert!(handle.degraded.synthetic_models());
        assert!(!handle.degraded.in_memory_l2());

        let request = RiskAssessmentRequest::new("acme", [3, 12]);
        let result = handle.engine.assess(&request).await.unwrap();
        assert_eq!(result.horizons.len(), 2);
        assert_eq!(result.failed_horizons(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_l2_and_history_degrade() {
        let mut config = synthetic_config();
        config.l2_url = Some("http://127.0.0.1:9".into());
        config.history_path = Some(PathBuf::from("/proc/risk-engine/history.jsonl"));

        let handle = build(config).await.unwrap();
        assert!(handle.degraded.in_memory_l2());
        assert!(handle.degraded.in_memory_history());
        assert_eq!(handle.degraded.reasons.len(), 4);

        let request = RiskAssessmentRequest::new("acme", [6]);
        assert!(handle.engine.assess(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_l2_url_is_fatal() {
        let mut config = synthetic_config();
        config.l2_url = Some("not a url".into());
        assert!(matches!(build(config).await, Err(BootstrapError::CacheClient(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = synthetic_config();
        config.engine.max_concurrent = 0;
        assert!(matches!(build(config).await, Err(BootstrapError::Config(_))));
    }
}
