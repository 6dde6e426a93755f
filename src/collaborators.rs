// External collaborators of the pipeline: threshold dictionary, error reporter,
// node inventory. Each has a trait seam plus the in-process default.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::Stage;
use crate::source::{Entity, SourceEvent, USER_SERVICE, endpoint_id, service_id};

/// Per-name apdex threshold lookup, in milliseconds.
pub trait ThresholdDictionary: Send + Sync {
    fn lookup_threshold(&self, name: &str) -> i64;
}

impl<F> ThresholdDictionary for F
where
    F: Fn(&str) -> i64 + Send + Sync,
{
    fn lookup_threshold(&self, name: &str) -> i64 {
        self(name)
    }
}

/// Thresholds from configuration with a default for unlisted names.
#[derive(Debug, Clone)]
pub struct StaticThresholds {
    default: i64,
    thresholds: HashMap<String, i64>,
}

impl StaticThresholds {
    pub fn new(default: i64, thresholds: HashMap<String, i64>) -> Self {
        Self {
            default,
            thresholds,
        }
    }
}

impl ThresholdDictionary for StaticThresholds {
    fn lookup_threshold(&self, name: &str) -> i64 {
        self.thresholds.get(name).copied().unwrap_or(self.default)
    }
}

/// Receives entities the pipeline gave up on.
pub trait ErrorReporter: Send + Sync {
    fn report_failure(&self, stage: Stage, identity: &str, cause: &dyn std::error::Error);
}

/// Logs each failure at error level and counts them.
#[derive(Debug, Default)]
pub struct LogReporter {
    failures: AtomicU64,
}

impl LogReporter {
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl ErrorReporter for LogReporter {
    fn report_failure(&self, stage: Stage, identity: &str, cause: &dyn std::error::Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            error = %cause,
            stage = ?stage,
            identity,
            operation = "report_failure",
            "entity dropped"
        );
    }
}

/// What topology needs to render a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// Whether the node runs an agent; conjectural peers are not real.
    pub is_real: bool,
}

/// Lookup of services and endpoints by node id.
pub trait Inventory: Send + Sync {
    fn service(&self, id: &str) -> Option<NodeInfo>;
    fn endpoint(&self, id: &str) -> Option<NodeInfo>;
    /// Records the nodes an event reveals.
    fn observe(&self, _event: &SourceEvent) {}
}

/// Inventory filled from the event stream.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    services: RwLock<HashMap<String, NodeInfo>>,
    endpoints: RwLock<HashMap<String, NodeInfo>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service by name. A real registration upgrades a conjectural one.
    pub fn register_service(&self, name: &str, is_real: bool) {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = services.entry(service_id(name)).or_insert_with(|| NodeInfo {
            name: name.to_string(),
            is_real,
        });
        entry.is_real |= is_real;
    }

    pub fn register_endpoint(&self, service: &str, endpoint: &str) {
        let id = endpoint_id(service, endpoint);
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.entry(id).or_insert_with(|| NodeInfo {
            name: endpoint.to_string(),
            is_real: true,
        });
    }
}

impl Inventory for MemoryInventory {
    fn service(&self, id: &str) -> Option<NodeInfo> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    fn endpoint(&self, id: &str) -> Option<NodeInfo> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    fn observe(&self, event: &SourceEvent) {
        match &event.entity {
            Entity::Service { name } => self.register_service(name, true),
            Entity::Endpoint { service, endpoint } => self.register_endpoint(service, endpoint),
            Entity::ServiceRelation { source, dest, .. } => {
                self.register_service(source, source != USER_SERVICE);
                self.register_service(dest, false);
            }
            _ => {}
        }
    }
}
