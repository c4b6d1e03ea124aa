//! JSON-lines front end
//!
//! Reads one command per line and writes one reply per line. Commands run
//! concurrently; replies carry the caller's `id` so they can be matched up
//! when they come back out of order.
//!
//! ```text
//! {"op":"assess","id":"1","request":{"business_id":"acme","horizons":[3,12]}}
//! {"op":"invalidate","business_id":"acme"}
//! {"op":"health"}
//! {"op":"metrics"}
//! ```

use anyhow::{Context, Result};
use risk_engine_core::{EngineError, EngineHandle, RiskAssessmentRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// One line of input
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Assess {
        #[serde(default)]
        id: Option<String>,
        request: RiskAssessmentRequest,
    },
    Invalidate {
        #[serde(default)]
        id: Option<String>,
        business_id: String,
    },
    Health {
        #[serde(default)]
        id: Option<String>,
    },
    Metrics {
        #[serde(default)]
        id: Option<String>,
    },
}

impl Command {
    fn id(&self) -> Option<String> {
        match self {
            Self::Assess { id, .. }
            | Self::Invalidate { id, .. }
            | Self::Health { id }
            | Self::Metrics { id } => id.clone(),
        }
    }
}

/// One line of output
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        result: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl Reply {
    fn engine_error(id: Option<String>, error: &EngineError) -> Self {
        Self::Error {
            id,
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    fn bad_request(message: String) -> Self {
        Self::Error {
            id: None,
            kind: "invalid_input".into(),
            message,
            retryable: false,
        }
    }
}

/// Execute one command against the engine
pub async fn execute(handle: &EngineHandle, command: Command) -> Reply {
    let id = command.id();
    match command {
        Command::Assess { request, .. } => match handle.engine.assess(&request).await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(result) => Reply::Ok { id, result },
                Err(e) => Reply::Error {
                    id,
                    kind: "internal".into(),
                    message: format!("failed to encode result: {e}"),
                    retryable: false,
                },
            },
            Err(e) => Reply::engine_error(id, &e),
        },
        Command::Invalidate { business_id, .. } => match handle.engine.invalidate_business(&business_id).await {
            Ok(report) => Reply::Ok {
                id,
                result: json!({
                    "l1_removed": report.l1_removed,
                    "l2_removed": report.l2_removed,
                    "l2_error": report.l2_error.map(|e| e.to_string()),
                }),
            },
            Err(e) => Reply::engine_error(id, &e),
        },
        Command::Health { .. } => {
            let health = handle.engine.health().await;
            Reply::Ok {
                id,
                result: json!({
                    "engine": health,
                    "degraded": handle.degraded,
                }),
            }
        }
        Command::Metrics { .. } => Reply::Ok {
            id,
            result: Value::String(handle.metrics.to_prometheus()),
        },
    }
}

/// What a finished command loop handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub commands: u64,
    /// Most command tasks held at once
    pub peak_pending: usize,
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Command task failed");
    }
}

/// Serve commands from `input` until EOF or shutdown
///
/// Finished commands are reaped as they complete. Commands still running
/// when input ends are allowed to finish.
pub async fn serve<R, W>(
    handle: EngineHandle,
    input: R,
    mut output: W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Reply>(256);
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let mut line = serde_json::to_vec(&reply)?;
            line.push(b'\n');
            output.write_all(&line).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut summary = ServeSummary::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read command")?,
            Some(joined) = tasks.join_next() => {
                reap(joined);
                continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, draining in-flight commands");
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        summary.commands += 1;
        match serde_json::from_str::<Command>(&line) {
            Ok(command) => {
                let handle = handle.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let reply = execute(&handle, command).await;
                    let _ = tx.send(reply).await;
                });
                summary.peak_pending = summary.peak_pending.max(tasks.len());
            }
            Err(e) => {
                warn!(error = %e, "Rejected malformed command");
                let _ = tx.send(Reply::bad_request(format!("malformed command: {e}"))).await;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        reap(joined);
    }
    drop(tx);
    writer.await.context("Reply writer panicked")??;

    info!(commands = summary.commands, "Command loop finished");
    Ok(summary)
}
