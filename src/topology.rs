// Topology queries: relation rows in a time range -> deduplicated nodes and
// calls. Scope filtering happens before assembly.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use crate::collaborators::{Inventory, NodeInfo};
use crate::metrics::{MetricRegistry, MetricsError};
use crate::source::{DetectPoint, USER_SERVICE, relation_id};
use crate::storage::{StorageDriver, StorageError, StorageModels};
use crate::time_bucket::Granularity;

/// Name of nodes the inventory does not know.
pub const UNKNOWN_NODE_NAME: &str = "Unknown";
pub const USER_NODE_TYPE: &str = "USER";

const SERVICE_RELATION_METRICS: &[&str] =
    &["service_relation_server_cpm", "service_relation_client_cpm"];
const ENDPOINT_RELATION_METRICS: &[&str] = &["endpoint_relation_cpm"];

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyScope {
    Global,
    /// Calls into or out of one service.
    Service(String),
    /// Calls into or out of one endpoint (`service.endpoint`).
    Endpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub is_real: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: String,
    pub source: String,
    pub target: String,
    pub component_id: i32,
    pub detect_points: Vec<DetectPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub calls: Vec<Call>,
}

/// One relation as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDetail {
    pub source: String,
    pub target: String,
    pub component_id: i32,
    pub detect_point: DetectPoint,
}

/// Component id -> display name.
#[derive(Debug, Clone, Default)]
pub struct ComponentLibrary {
    names: HashMap<i32, String>,
}

impl ComponentLibrary {
    pub fn new(names: HashMap<i32, String>) -> Self {
        Self { names }
    }

    pub fn name(&self, component_id: i32) -> Option<&str> {
        self.names.get(&component_id).map(String::as_str)
    }
}

/// Builds a topology from relation details.
///
/// With `typed`, node types come from the components of the calls: server
/// side calls type their target, client side calls type conjectural targets.
pub fn assemble(
    calls: &[CallDetail],
    lookup: impl Fn(&str) -> Option<NodeInfo>,
    components: &ComponentLibrary,
    typed: bool,
) -> Topology {
    let mut topology = Topology::default();
    let mut node_index: HashMap<String, usize> = HashMap::new();
    let mut call_index: HashMap<(String, String), usize> = HashMap::new();

    for detail in calls {
        for id in [&detail.source, &detail.target] {
            if let Entry::Vacant(slot) = node_index.entry(id.clone()) {
                slot.insert(topology.nodes.len());
                topology.nodes.push(build_node(id, &lookup));
            }
        }

        match call_index.entry((detail.source.clone(), detail.target.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(topology.calls.len());
                topology.calls.push(Call {
                    id: relation_id(&detail.source, &detail.target),
                    source: detail.source.clone(),
                    target: detail.target.clone(),
                    component_id: detail.component_id,
                    detect_points: vec![detail.detect_point],
                });
            }
            Entry::Occupied(existing) => {
                let call = &mut topology.calls[*existing.get()];
                if !call.detect_points.contains(&detail.detect_point) {
                    call.detect_points.push(detail.detect_point);
                }
                if detail.detect_point == DetectPoint::Server {
                    call.component_id = detail.component_id;
                }
            }
        }

        if !typed {
            continue;
        }
        let target = &mut topology.nodes[node_index[&detail.target]];
        let applies = match detail.detect_point {
            DetectPoint::Server => true,
            DetectPoint::Client => !target.is_real,
        };
        if applies
            && target.node_type.is_empty()
            && target.id != USER_SERVICE
            && let Some(name) = components.name(detail.component_id)
        {
            target.node_type = name.to_string();
        }
    }
    topology
}

/// Gives every still untyped node the component of a server side call into
/// it, looked up in `calls`.
pub fn type_from_inbound_calls(
    topology: &mut Topology,
    calls: &[CallDetail],
    components: &ComponentLibrary,
) {
    for node in topology
        .nodes
        .iter_mut()
        .filter(|n| n.node_type.is_empty() && n.id != USER_SERVICE)
    {
        let component = calls
            .iter()
            .filter(|c| c.detect_point == DetectPoint::Server && c.target == node.id)
            .find_map(|c| components.name(c.component_id));
        if let Some(name) = component {
            node.node_type = name.to_string();
        }
    }
}

fn build_node(id: &str, lookup: &impl Fn(&str) -> Option<NodeInfo>) -> Node {
    if id == USER_SERVICE {
        return Node {
            id: id.to_string(),
            name: USER_SERVICE.to_string(),
            node_type: USER_NODE_TYPE.to_string(),
            is_real: false,
        };
    }
    match lookup(id) {
        Some(info) => Node {
            id: id.to_string(),
            name: info.name,
            node_type: String::new(),
            is_real: info.is_real,
        },
        None => Node {
            id: id.to_string(),
            name: UNKNOWN_NODE_NAME.to_string(),
            node_type: String::new(),
            is_real: false,
        },
    }
}

pub struct TopologyQueryService {
    storage: Arc<dyn StorageDriver>,
    models: Arc<StorageModels>,
    registry: Arc<MetricRegistry>,
    inventory: Arc<dyn Inventory>,
    components: ComponentLibrary,
}

impl TopologyQueryService {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        models: Arc<StorageModels>,
        registry: Arc<MetricRegistry>,
        inventory: Arc<dyn Inventory>,
        components: ComponentLibrary,
    ) -> Self {
        Self {
            storage,
            models,
            registry,
            inventory,
            components,
        }
    }

    #[instrument(skip(self), fields(operation = "assemble_topology"))]
    pub async fn assemble_topology(
        &self,
        step: Granularity,
        start_bucket: i64,
        end_bucket: i64,
        scope: TopologyScope,
    ) -> Result<Topology, TopologyError> {
        let (metrics, focus): (&[&str], Option<&str>) = match &scope {
            TopologyScope::Global => (SERVICE_RELATION_METRICS, None),
            TopologyScope::Service(id) => (SERVICE_RELATION_METRICS, Some(id.as_str())),
            TopologyScope::Endpoint(id) => (ENDPOINT_RELATION_METRICS, Some(id.as_str())),
        };

        let loaded = self
            .load_calls(metrics, step, start_bucket, end_bucket)
            .await?;
        let calls: Vec<CallDetail> = match focus {
            Some(id) => loaded
                .iter()
                .filter(|c| c.source == id || c.target == id)
                .cloned()
                .collect(),
            None => loaded.clone(),
        };

        let mut topology = match &scope {
            TopologyScope::Endpoint(_) => assemble(
                &calls,
                |id| self.inventory.endpoint(id),
                &self.components,
                false,
            ),
            _ => assemble(
                &calls,
                |id| self.inventory.service(id),
                &self.components,
                true,
            ),
        };
        if matches!(scope, TopologyScope::Service(_)) {
            // Callers of the focus service only show up as sources here
            type_from_inbound_calls(&mut topology, &loaded, &self.components);
        }
        tracing::debug!(
            nodes = topology.nodes.len(),
            calls = topology.calls.len(),
            "topology assembled"
        );
        Ok(topology)
    }

    async fn load_calls(
        &self,
        metrics: &[&str],
        step: Granularity,
        start_bucket: i64,
        end_bucket: i64,
    ) -> Result<Vec<CallDetail>, TopologyError> {
        let mut calls = Vec::new();
        for metric in metrics {
            let Some(definition) = self.registry.get(metric) else {
                continue;
            };
            let Some(detect_point) = definition.filter.detect_point else {
                continue;
            };
            let Some(model) = self.models.get(&definition.model_name(step)) else {
                continue;
            };
            for row in self
                .storage
                .scan_time_range(&model, start_bucket, end_bucket)
                .await?
            {
                let decoded = self.registry.decode_row(&model, &row)?;
                let relation = decoded.relation();
                calls.push(CallDetail {
                    source: relation.source_id.clone(),
                    target: relation.dest_id.clone(),
                    component_id: relation.component_id,
                    detect_point,
                });
            }
        }
        Ok(calls)
    }
}
