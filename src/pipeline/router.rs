// Deterministic router: routing key -> owner node, then hand-off to the
// transport with bounded retries.

use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use fnv::FnvHasher;
use tokio::sync::mpsc;

use super::transport::RemoteTransport;
use super::{PipelineStats, RetryPolicy};
use crate::collaborators::ErrorReporter;
use crate::metrics::{Metrics, Stage};

/// 64-bit FNV-1a of the routing key. Stable across processes and restarts.
pub fn routing_hash(routing_key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(routing_key.as_bytes());
    hasher.finish()
}

/// Owner node of an identity; `nodes` of 0 is treated as 1.
pub fn owner_node(routing_key: &str, nodes: usize) -> usize {
    (routing_hash(routing_key) % nodes.max(1) as u64) as usize
}

/// Drains locally folded entities and delivers each to its owner node.
/// Exits when every local worker has dropped its sender.
pub(crate) fn spawn_router(
    mut rx: mpsc::Receiver<Metrics>,
    transport: Arc<dyn RemoteTransport>,
    retry: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
    stats: Arc<PipelineStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(metrics) = rx.recv().await {
            let key = metrics.routing_key();
            let frame = match metrics.encode_remote() {
                Ok(frame) => frame,
                Err(e) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    reporter.report_failure(Stage::LocallyFolded, &key, &e);
                    continue;
                }
            };
            let node = owner_node(&key, transport.nodes());
            if deliver(transport.as_ref(), node, frame, retry, reporter.as_ref(), &key).await {
                stats.routed.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!("Router shutting down");
    })
}

/// Sends with linear backoff; reports and gives up after `retry.max_attempts`.
pub(crate) async fn deliver(
    transport: &dyn RemoteTransport,
    node: usize,
    frame: Bytes,
    retry: RetryPolicy,
    reporter: &dyn ErrorReporter,
    key: &str,
) -> bool {
    let mut attempt = 1;
    loop {
        match transport.send(node, frame.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt >= retry.max_attempts => {
                reporter.report_failure(Stage::Routed, key, &e);
                return false;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    node,
                    attempt,
                    operation = "route",
                    "delivery failed, retrying"
                );
                tokio::time::sleep(retry.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
