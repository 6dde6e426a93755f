// Local aggregation: each worker owns the entities of its shard and folds
// same-identity entities until the next flush.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use super::PipelineStats;
use crate::collaborators::ErrorReporter;
use crate::metrics::{Metrics, Stage};

/// Spawns one local worker. Flushes every `flush_interval` and once more when
/// its input closes, then exits.
pub(crate) fn spawn_local_worker(
    worker: usize,
    mut rx: mpsc::Receiver<Metrics>,
    router_tx: mpsc::Sender<Metrics>,
    flush_interval: Duration,
    reporter: Arc<dyn ErrorReporter>,
    stats: Arc<PipelineStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: HashMap<String, Metrics> = HashMap::new();
        let mut flush_tick = interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Some(metrics) => fold(&mut buffer, metrics, reporter.as_ref(), &stats),
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    flush(worker, &mut buffer, &router_tx, reporter.as_ref()).await;
                }
            }
        }
        flush(worker, &mut buffer, &router_tx, reporter.as_ref()).await;
        tracing::debug!(worker, "Local worker shutting down");
    })
}

fn fold(
    buffer: &mut HashMap<String, Metrics>,
    metrics: Metrics,
    reporter: &dyn ErrorReporter,
    stats: &PipelineStats,
) {
    match buffer.entry(metrics.routing_key()) {
        Entry::Occupied(mut existing) => {
            if let Err(e) = existing.get_mut().combine(&metrics) {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                reporter.report_failure(Stage::Created, existing.key(), &e);
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(metrics);
        }
    }
}

async fn flush(
    worker: usize,
    buffer: &mut HashMap<String, Metrics>,
    router_tx: &mpsc::Sender<Metrics>,
    reporter: &dyn ErrorReporter,
) {
    if buffer.is_empty() {
        return;
    }
    let n = buffer.len();
    for (key, mut metrics) in buffer.drain() {
        if let Err(e) = metrics.advance(Stage::LocallyFolded) {
            reporter.report_failure(Stage::LocallyFolded, &key, &e);
            continue;
        }
        if router_tx.send(metrics).await.is_err() {
            tracing::warn!(worker, operation = "local_flush", "router channel closed");
            return;
        }
    }
    tracing::debug!(worker, operation = "local_flush", entities = n, "Local buffer flushed");
}
