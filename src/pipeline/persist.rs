// Persistence-merge stage: one worker per owner node, strictly sequential
// read-merge-write of each delivered entity and its coarser down-samples.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{MAX_CONFLICT_RETRIES, PipelineError, PipelineStats, RetryPolicy};
use crate::collaborators::ErrorReporter;
use crate::metrics::{MetricRegistry, Metrics, Stage};
use crate::storage::model::Model;
use crate::storage::{Row, StorageDriver, StorageError, StorageModels, WriteOutcome};
use crate::time_bucket::Granularity;

/// What a persistence worker reads and writes through.
#[derive(Clone)]
pub struct PersistDeps {
    pub registry: Arc<MetricRegistry>,
    pub models: Arc<StorageModels>,
    pub storage: Arc<dyn StorageDriver>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub stats: Arc<PipelineStats>,
}

/// Spawns the worker of `node`. It finishes every frame already delivered
/// before exiting on channel close.
pub(crate) fn spawn_persist_worker(
    node: usize,
    mut rx: mpsc::Receiver<Bytes>,
    deps: PersistDeps,
    retry: RetryPolicy,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut metrics = match deps.registry.decode_remote(&frame) {
                Ok(m) => m,
                Err(e) => {
                    deps.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    deps.reporter
                        .report_failure(Stage::Routed, &format!("node-{node}"), &e);
                    continue;
                }
            };
            if let Err(e) = metrics.advance(Stage::Routed) {
                warn!(error = %e, node, operation = "persist", "unexpected stage");
            }
            persist(&deps, metrics, retry).await;
        }
        debug!(node, "Persist worker shutting down");
    })
}

/// Persists `metrics` and its hour/day/month down-samples. Each granularity
/// fails independently.
pub async fn persist(deps: &PersistDeps, mut metrics: Metrics, retry: RetryPolicy) {
    let mut deltas = vec![metrics.clone()];
    deltas.extend(
        [Granularity::Hour, Granularity::Day, Granularity::Month]
            .into_iter()
            .filter_map(|g| metrics.to_granularity(g)),
    );

    let mut failed = false;
    for delta in deltas {
        let key = delta.routing_key();
        if let Err(e) = persist_with_retry(deps, &delta, retry).await {
            failed = true;
            deps.reporter.report_failure(Stage::Persisted, &key, &e);
        }
    }

    if failed {
        deps.stats.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if let Err(e) = metrics.advance(Stage::Persisted) {
        warn!(error = %e, operation = "persist", "unexpected stage");
    }
    deps.stats.persisted.fetch_add(1, Ordering::Relaxed);
}

/// A merged row ready to be written at the version it was read at.
struct PendingWrite {
    row: Row,
    expected_version: Option<u64>,
    /// Set once a write of this row failed without telling whether it landed.
    uncertain: bool,
}

/// Writes one delta. A storage error re-sends the already merged row instead
/// of merging the delta again, so a write that landed before its error is
/// never counted twice.
async fn persist_with_retry(
    deps: &PersistDeps,
    delta: &Metrics,
    retry: RetryPolicy,
) -> Result<(), PipelineError> {
    let model_name = delta.model_name();
    let model = deps
        .models
        .get(&model_name)
        .ok_or(PipelineError::UnknownModel(model_name))?;
    let id = delta.id();

    let mut attempt = 1;
    let mut conflicts = 0;
    let mut pending: Option<PendingWrite> = None;
    loop {
        let write = match pending.take() {
            Some(write) => write,
            None => match merge(deps, &model, &id, delta).await {
                Ok(write) => write,
                Err(PipelineError::Storage(e)) => {
                    backoff(&model, &mut attempt, retry, e).await?;
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        if write.uncertain {
            match deps.storage.load_by_identity(&model, &id).await {
                Ok(Some(stored)) if stored.row == write.row => {
                    debug!(model = %model.name, id = %id, "earlier write had landed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    pending = Some(write);
                    backoff(&model, &mut attempt, retry, e).await?;
                    continue;
                }
            }
        }

        match deps
            .storage
            .write_by_identity(&model, &id, write.row.clone(), write.expected_version)
            .await
        {
            Ok(WriteOutcome::Written) => return Ok(()),
            Ok(WriteOutcome::VersionConflict) => {
                conflicts += 1;
                if conflicts >= MAX_CONFLICT_RETRIES {
                    return Err(PipelineError::ConflictRetriesExhausted(MAX_CONFLICT_RETRIES));
                }
                debug!(model = %model.name, id = %id, "version conflict, re-reading");
            }
            Err(e) => {
                pending = Some(PendingWrite {
                    uncertain: true,
                    ..write
                });
                backoff(&model, &mut attempt, retry, e).await?;
            }
        }
    }
}

/// Sleeps before the next attempt, or gives up once attempts run out.
async fn backoff(
    model: &Model,
    attempt: &mut u32,
    retry: RetryPolicy,
    error: StorageError,
) -> Result<(), PipelineError> {
    if *attempt >= retry.max_attempts {
        return Err(error.into());
    }
    warn!(
        error = %error,
        model = %model.name,
        attempt = *attempt,
        operation = "persist",
        "storage access failed, retrying"
    );
    tokio::time::sleep(retry.delay(*attempt)).await;
    *attempt += 1;
    Ok(())
}

/// Loads the stored state and merges the delta into it.
async fn merge(
    deps: &PersistDeps,
    model: &Model,
    id: &str,
    delta: &Metrics,
) -> Result<PendingWrite, PipelineError> {
    let stored = deps.storage.load_by_identity(model, id).await?;
    let mut merged = delta.clone();
    let expected_version = match stored {
        Some(stored) => {
            let existing = deps.registry.decode_row(model, &stored.row)?;
            merged.combine(&existing)?;
            Some(stored.version)
        }
        None => None,
    };
    merged.calculate();
    Ok(PendingWrite {
        row: merged.to_row(model)?,
        expected_version,
        uncertain: false,
    })
}
