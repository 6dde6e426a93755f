// Dispatch pipeline: decompose -> local fold -> route -> persist.
// Stages talk over bounded channels; dropping the ingest side shuts the whole
// chain down in order.

pub mod local;
pub mod persist;
pub mod router;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::Duration;

pub use crate::metrics::Stage;
pub use persist::PersistDeps;
pub use router::owner_node;
pub use transport::{ChannelTransport, RemoteTransport, TransportError};

use crate::collaborators::{ErrorReporter, Inventory};
use crate::metrics::{MetricRegistry, Metrics, MetricsError};
use crate::source::{DecodedRecord, decompose};
use crate::storage::{StorageDriver, StorageError, StorageModels};

/// Version conflicts tolerated per write before the write counts as failed.
pub const MAX_CONFLICT_RETRIES: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline is shut down")]
    Closed,
    #[error("no model registered as {0}")]
    UnknownModel(String),
    #[error("version conflict persisted after {0} attempts")]
    ConflictRetriesExhausted(u32),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Linear backoff: attempt `n` waits `n * backoff`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub local_workers: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
    pub nodes: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            local_workers: 4,
            flush_interval: Duration::from_secs(1),
            channel_capacity: 1024,
            nodes: 1,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(100),
            },
        }
    }
}

/// Running totals, logged periodically by the binary.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub records: AtomicU64,
    pub events: AtomicU64,
    pub entities: AtomicU64,
    pub routed: AtomicU64,
    pub persisted: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records: u64,
    pub events: u64,
    pub entities: u64,
    pub routed: u64,
    pub persisted: u64,
    pub dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            entities: self.entities.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared collaborators of every stage.
#[derive(Clone)]
pub struct PipelineDeps {
    pub registry: Arc<MetricRegistry>,
    pub models: Arc<StorageModels>,
    pub storage: Arc<dyn StorageDriver>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub inventory: Arc<dyn Inventory>,
}

pub struct Pipeline;

impl Pipeline {
    /// Spawns every stage over the in-process channel transport.
    pub fn start(deps: PipelineDeps, config: PipelineConfig) -> PipelineHandle {
        let stats = Arc::new(PipelineStats::default());
        let capacity = config.channel_capacity.max(1);

        let (transport, node_receivers) = ChannelTransport::new(config.nodes, capacity);
        let persist_deps = PersistDeps {
            registry: deps.registry.clone(),
            models: deps.models.clone(),
            storage: deps.storage.clone(),
            reporter: deps.reporter.clone(),
            stats: stats.clone(),
        };
        let persist_tasks: Vec<_> = node_receivers
            .into_iter()
            .enumerate()
            .map(|(node, rx)| {
                persist::spawn_persist_worker(node, rx, persist_deps.clone(), config.retry)
            })
            .collect();

        let (router_tx, router_rx) = mpsc::channel(capacity);
        let router_task = router::spawn_router(
            router_rx,
            Arc::new(transport),
            config.retry,
            deps.reporter.clone(),
            stats.clone(),
        );

        let (local_txs, local_tasks): (Vec<_>, Vec<_>) = (0..config.local_workers.max(1))
            .map(|worker| {
                let (tx, rx) = mpsc::channel(capacity);
                let task = local::spawn_local_worker(
                    worker,
                    rx,
                    router_tx.clone(),
                    config.flush_interval,
                    deps.reporter.clone(),
                    stats.clone(),
                );
                (tx, task)
            })
            .unzip();
        drop(router_tx);

        tracing::info!(
            local_workers = local_txs.len(),
            nodes = persist_tasks.len(),
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "pipeline started"
        );

        PipelineHandle {
            local_txs,
            registry: deps.registry,
            inventory: deps.inventory,
            stats,
            local_tasks,
            router_task,
            persist_tasks,
        }
    }
}

/// Ingest side of a running pipeline.
pub struct PipelineHandle {
    local_txs: Vec<mpsc::Sender<Metrics>>,
    registry: Arc<MetricRegistry>,
    inventory: Arc<dyn Inventory>,
    stats: Arc<PipelineStats>,
    local_tasks: Vec<tokio::task::JoinHandle<()>>,
    router_task: tokio::task::JoinHandle<()>,
    persist_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Decomposes one record and hands its entities to their local workers.
    /// Returns the number of entities created.
    pub async fn ingest(&self, record: &DecodedRecord) -> Result<usize, PipelineError> {
        self.stats.records.fetch_add(1, Ordering::Relaxed);
        let events = decompose(record);
        self.stats
            .events
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        let mut created = 0;
        for event in &events {
            self.inventory.observe(event);
            for metrics in self.registry.build(event) {
                let worker = owner_node(&metrics.routing_key(), self.local_txs.len());
                self.local_txs[worker]
                    .send(metrics)
                    .await
                    .map_err(|_| PipelineError::Closed)?;
                created += 1;
            }
        }
        self.stats
            .entities
            .fetch_add(created as u64, Ordering::Relaxed);
        Ok(created)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Stops accepting records, flushes every stage and waits until all
    /// delivered entities are persisted.
    pub async fn shutdown(self) -> StatsSnapshot {
        let PipelineHandle {
            local_txs,
            stats,
            local_tasks,
            router_task,
            persist_tasks,
            ..
        } = self;
        drop(local_txs);
        for task in local_tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, operation = "shutdown", "local worker panicked");
            }
        }
        if let Err(e) = router_task.await {
            tracing::warn!(error = %e, operation = "shutdown", "router panicked");
        }
        for task in persist_tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, operation = "shutdown", "persist worker panicked");
            }
        }
        let snapshot = stats.snapshot();
        tracing::info!(
            records = snapshot.records,
            persisted = snapshot.persisted,
            dropped = snapshot.dropped,
            "pipeline stopped"
        );
        snapshot
    }
}
