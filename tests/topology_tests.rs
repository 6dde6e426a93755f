// Topology assembly and scoped queries over stored relation rows

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use metricflow::collaborators::{Inventory, MemoryInventory, NodeInfo};
use metricflow::source::{DetectPoint, Entity, SourceEvent};
use metricflow::storage::StorageDriver;
use metricflow::time_bucket::Granularity;
use metricflow::topology::{
    CallDetail, ComponentLibrary, TopologyQueryService, TopologyScope, UNKNOWN_NODE_NAME,
    USER_NODE_TYPE, assemble, type_from_inbound_calls,
};

fn detail(source: &str, target: &str, component_id: i32, detect_point: DetectPoint) -> CallDetail {
    CallDetail {
        source: source.into(),
        target: target.into(),
        component_id,
        detect_point,
    }
}

fn lookup(id: &str) -> Option<NodeInfo> {
    match id {
        "100" => Some(NodeInfo {
            name: "gateway".into(),
            is_real: true,
        }),
        "0" => Some(NodeInfo {
            name: "order".into(),
            is_real: true,
        }),
        _ => None,
    }
}

#[test]
fn duplicate_calls_collapse() {
    let calls = vec![
        detail("100", "0", 1, DetectPoint::Server),
        detail("100", "0", 1, DetectPoint::Server),
        detail("100", "0", 1, DetectPoint::Client),
        detail("100", "200", 1, DetectPoint::Client),
    ];
    let topology = assemble(&calls, lookup, &ComponentLibrary::default(), true);

    assert_eq!(topology.nodes.len(), 3);
    assert_eq!(topology.calls.len(), 2);
    let call = &topology.calls[0];
    assert_eq!(call.id, "100|0");
    assert_eq!(
        call.detect_points,
        vec![DetectPoint::Server, DetectPoint::Client]
    );

    let unknown = topology.nodes.iter().find(|n| n.id == "200").unwrap();
    assert_eq!(unknown.name, UNKNOWN_NODE_NAME);
    assert_eq!(unknown.node_type, "");
    assert!(!unknown.is_real);
}

#[test]
fn server_side_component_wins() {
    let components = ComponentLibrary::new(HashMap::from([
        (1, "HttpClient".to_string()),
        (7, "Tomcat".to_string()),
    ]));
    for calls in [
        vec![
            detail("100", "0", 1, DetectPoint::Client),
            detail("100", "0", 7, DetectPoint::Server),
        ],
        vec![
            detail("100", "0", 7, DetectPoint::Server),
            detail("100", "0", 1, DetectPoint::Client),
        ],
    ] {
        let topology = assemble(&calls, lookup, &components, true);
        assert_eq!(topology.calls.len(), 1);
        assert_eq!(topology.calls[0].component_id, 7);
        let target = topology.nodes.iter().find(|n| n.id == "0").unwrap();
        assert_eq!(target.node_type, "Tomcat");
    }
}

#[test]
fn conjectural_peer_typed_by_client_component() {
    let components = ComponentLibrary::new(HashMap::from([(5, "Mysql".to_string())]));
    let calls = vec![
        detail("User", "100", 0, DetectPoint::Server),
        detail("100", "db:3306", 5, DetectPoint::Client),
    ];
    let topology = assemble(&calls, lookup, &components, true);
    let user = topology.nodes.iter().find(|n| n.id == "User").unwrap();
    assert_eq!(user.node_type, USER_NODE_TYPE);
    let db = topology.nodes.iter().find(|n| n.id == "db:3306").unwrap();
    assert_eq!(db.node_type, "Mysql");

    let json = serde_json::to_value(db).unwrap();
    assert_eq!(json["type"], "Mysql");
    assert_eq!(json["isReal"], false);
}

async fn store_relations(events: &[SourceEvent]) -> TopologyQueryService {
    store_relations_with(events, ComponentLibrary::default()).await
}

async fn store_relations_with(
    events: &[SourceEvent],
    components: ComponentLibrary,
) -> TopologyQueryService {
    let registry = registry();
    let models = models(&registry);
    let storage = memory_storage(&models).await;
    let inventory = Arc::new(MemoryInventory::new());

    for event in events {
        inventory.observe(event);
        for minute in registry.build(event) {
            let mut day = minute.to_day().unwrap();
            day.calculate();
            let model = models.get(&day.model_name()).unwrap();
            let row = day.to_row(&model).unwrap();
            storage
                .write_by_identity(&model, &day.id(), row, None)
                .await
                .unwrap();
        }
    }

    TopologyQueryService::new(
        storage,
        models,
        registry,
        inventory,
        components,
    )
}

fn relation(source: &str, dest: &str, detect_point: DetectPoint) -> SourceEvent {
    relation_via(source, dest, 1, detect_point)
}

fn relation_via(
    source: &str,
    dest: &str,
    component_id: i32,
    detect_point: DetectPoint,
) -> SourceEvent {
    SourceEvent {
        entity: Entity::ServiceRelation {
            source: source.into(),
            dest: dest.into(),
            component_id,
            detect_point,
        },
        timestamp: TS,
        latency: 10,
        status_code: Some(200),
        is_error: false,
        meter: None,
    }
}

#[tokio::test]
async fn scoped_query_keeps_only_touching_calls() {
    let service = store_relations(&[
        relation("User", "gateway", DetectPoint::Server),
        relation("gateway", "order", DetectPoint::Server),
        relation("gateway", "order", DetectPoint::Client),
        relation("order", "payment", DetectPoint::Client),
        relation("inventory", "stock", DetectPoint::Server),
    ])
    .await;

    let global = service
        .assemble_topology(Granularity::Day, DAY, DAY, TopologyScope::Global)
        .await
        .unwrap();
    assert_eq!(global.calls.len(), 4);
    assert_eq!(global.nodes.len(), 6);

    let scoped = service
        .assemble_topology(
            Granularity::Day,
            DAY,
            DAY,
            TopologyScope::Service("order".into()),
        )
        .await
        .unwrap();
    let mut ids: Vec<_> = scoped.calls.iter().map(|c| c.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["gateway|order", "order|payment"]);
    assert_eq!(scoped.nodes.len(), 3);

    let order = scoped.nodes.iter().find(|n| n.id == "order").unwrap();
    assert!(order.is_real);
    let payment = scoped.nodes.iter().find(|n| n.id == "payment").unwrap();
    assert!(!payment.is_real);

    let empty = service
        .assemble_topology(Granularity::Day, DAY + 1, DAY + 1, TopologyScope::Global)
        .await
        .unwrap();
    assert!(empty.calls.is_empty());
}

#[tokio::test]
async fn service_scope_types_callers_from_their_inbound_calls() {
    let components = ComponentLibrary::new(HashMap::from([
        (1, "Tomcat".to_string()),
        (2, "SpringMVC".to_string()),
        (3, "Dubbo".to_string()),
    ]));
    let service = store_relations_with(
        &[
            relation_via("User", "gateway", 2, DetectPoint::Server),
            relation_via("gateway", "order", 3, DetectPoint::Server),
            relation_via("order", "payment", 1, DetectPoint::Client),
        ],
        components,
    )
    .await;

    let scoped = service
        .assemble_topology(
            Granularity::Day,
            DAY,
            DAY,
            TopologyScope::Service("order".into()),
        )
        .await
        .unwrap();
    assert_eq!(scoped.calls.len(), 2);
    assert!(scoped.nodes.iter().all(|n| n.id != "User"));
    let node_type = |id: &str| {
        scoped
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.node_type.clone())
            .unwrap()
    };
    assert_eq!(node_type("gateway"), "SpringMVC");
    assert_eq!(node_type("order"), "Dubbo");
    assert_eq!(node_type("payment"), "Tomcat");
}

#[test]
fn inbound_typing_leaves_typed_and_user_nodes_alone() {
    let components = ComponentLibrary::new(HashMap::from([(7, "Tomcat".to_string())]));
    let mut topology = assemble(
        &[detail("User", "100", 7, DetectPoint::Server)],
        lookup,
        &components,
        false,
    );
    topology.nodes[1].node_type = "Jetty".into();
    type_from_inbound_calls(
        &mut topology,
        &[
            detail("0", "User", 7, DetectPoint::Server),
            detail("0", "100", 7, DetectPoint::Server),
        ],
        &components,
    );
    assert_eq!(topology.nodes[0].node_type, USER_NODE_TYPE);
    assert_eq!(topology.nodes[1].node_type, "Jetty");
}
