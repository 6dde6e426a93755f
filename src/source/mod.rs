// Source events: one typed observation per monitored dimension.

pub mod decompose;
pub mod record;

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

pub use decompose::{DecomposeError, decompose};
pub use record::{
    DecodedRecord, MeterBucket, MeterRecord, MeterValue, SegmentRecord, SegmentReference,
    SpanKind, SpanRecord,
};

/// Name of the virtual caller used when an entry span has no upstream reference.
pub const USER_SERVICE: &str = "User";
/// Separator between a service and its child (instance, endpoint) in entity ids.
pub const ID_SPLIT: &str = ".";
/// Separator between the two ends of a relation in entity ids.
pub const RELATION_SPLIT: &str = "|";

/// Percent-escapes the separators (and `%` itself) inside one id component,
/// so distinct dimensions never join into the same id.
pub fn encode_id_part(part: &str) -> Cow<'_, str> {
    if !part.contains(['%', '.', '|']) {
        return Cow::Borrowed(part);
    }
    let mut out = String::with_capacity(part.len() + 6);
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '|' => out.push_str("%7C"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Node id of a service.
pub fn service_id(name: &str) -> String {
    encode_id_part(name).into_owned()
}

/// Node id of an endpoint, scoped by its service.
pub fn endpoint_id(service: &str, endpoint: &str) -> String {
    format!(
        "{}{ID_SPLIT}{}",
        encode_id_part(service),
        encode_id_part(endpoint)
    )
}

/// Joins two node ids into a relation id.
pub fn relation_id(source_id: &str, dest_id: &str) -> String {
    format!("{source_id}{RELATION_SPLIT}{dest_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Service,
    ServiceInstance,
    Endpoint,
    ServiceRelation,
    EndpointRelation,
    Meter,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Service => "service",
            Scope::ServiceInstance => "service_instance",
            Scope::Endpoint => "endpoint",
            Scope::ServiceRelation => "service_relation",
            Scope::EndpointRelation => "endpoint_relation",
            Scope::Meter => "meter",
        }
    }

    pub fn is_relation(self) -> bool {
        matches!(self, Scope::ServiceRelation | Scope::EndpointRelation)
    }
}

/// Which side of a call observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectPoint {
    Client,
    Server,
}

/// The monitored dimension an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Service {
        name: String,
    },
    ServiceInstance {
        service: String,
        instance: String,
    },
    Endpoint {
        service: String,
        endpoint: String,
    },
    ServiceRelation {
        source: String,
        dest: String,
        component_id: i32,
        detect_point: DetectPoint,
    },
    EndpointRelation {
        source_service: String,
        source_endpoint: String,
        dest_service: String,
        dest_endpoint: String,
        component_id: i32,
        detect_point: DetectPoint,
    },
    Meter {
        service: String,
        instance: String,
        name: String,
    },
}

impl Entity {
    pub fn scope(&self) -> Scope {
        match self {
            Entity::Service { .. } => Scope::Service,
            Entity::ServiceInstance { .. } => Scope::ServiceInstance,
            Entity::Endpoint { .. } => Scope::Endpoint,
            Entity::ServiceRelation { .. } => Scope::ServiceRelation,
            Entity::EndpointRelation { .. } => Scope::EndpointRelation,
            Entity::Meter { .. } => Scope::Meter,
        }
    }

    /// Stable dimension key. Combined with the time bucket it forms the identity.
    pub fn entity_id(&self) -> String {
        match self {
            Entity::Service { name } => service_id(name),
            Entity::ServiceInstance { service, instance } => endpoint_id(service, instance),
            Entity::Endpoint { service, endpoint } => endpoint_id(service, endpoint),
            Entity::ServiceRelation { source, dest, .. } => {
                relation_id(&service_id(source), &service_id(dest))
            }
            Entity::EndpointRelation {
                source_service,
                source_endpoint,
                dest_service,
                dest_endpoint,
                ..
            } => relation_id(
                &endpoint_id(source_service, source_endpoint),
                &endpoint_id(dest_service, dest_endpoint),
            ),
            Entity::Meter {
                service,
                instance,
                name,
            } => format!(
                "{}{ID_SPLIT}{}",
                endpoint_id(service, instance),
                encode_id_part(name)
            ),
        }
    }

    /// Name used for per-operation lookups (health index thresholds).
    pub fn name(&self) -> &str {
        match self {
            Entity::Service { name } => name,
            Entity::ServiceInstance { instance, .. } => instance,
            Entity::Endpoint { endpoint, .. } => endpoint,
            Entity::ServiceRelation { dest, .. } => dest,
            Entity::EndpointRelation { dest_endpoint, .. } => dest_endpoint,
            Entity::Meter { name, .. } => name,
        }
    }

    /// Both ends of a relation as node ids, `None` for non-relation scopes.
    pub fn relation(&self) -> Option<RelationEnds> {
        match self {
            Entity::ServiceRelation {
                source,
                dest,
                component_id,
                ..
            } => Some(RelationEnds {
                source_id: service_id(source),
                dest_id: service_id(dest),
                component_id: *component_id,
            }),
            Entity::EndpointRelation {
                source_service,
                source_endpoint,
                dest_service,
                dest_endpoint,
                component_id,
                ..
            } => Some(RelationEnds {
                source_id: endpoint_id(source_service, source_endpoint),
                dest_id: endpoint_id(dest_service, dest_endpoint),
                component_id: *component_id,
            }),
            _ => None,
        }
    }

    pub fn detect_point(&self) -> Option<DetectPoint> {
        match self {
            Entity::ServiceRelation { detect_point, .. }
            | Entity::EndpointRelation { detect_point, .. } => Some(*detect_point),
            _ => None,
        }
    }
}

/// Node ids of a relation plus the component that carried the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RelationEnds {
    pub source_id: String,
    pub dest_id: String,
    pub component_id: i32,
}

/// One immutable observation of one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    pub entity: Entity,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Latency in milliseconds; 0 for meter events.
    pub latency: i64,
    pub status_code: Option<u16>,
    pub is_error: bool,
    pub meter: Option<MeterValue>,
}

impl SourceEvent {
    pub fn scope(&self) -> Scope {
        self.entity.scope()
    }

    /// An event fails when the span was flagged or the protocol status is an error.
    pub fn is_failure(&self) -> bool {
        self.is_error || self.status_code.is_some_and(|code| code >= 400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_inside_names_do_not_collide() {
        let a = Entity::Endpoint {
            service: "shop.api".into(),
            endpoint: "v1".into(),
        };
        let b = Entity::Endpoint {
            service: "shop".into(),
            endpoint: "api.v1".into(),
        };
        assert_ne!(a.entity_id(), b.entity_id());
        assert_eq!(a.entity_id(), "shop%2Eapi.v1");
        assert_eq!(b.entity_id(), "shop.api%2Ev1");

        let pipe = Entity::ServiceRelation {
            source: "a|b".into(),
            dest: "c".into(),
            component_id: 0,
            detect_point: DetectPoint::Server,
        };
        let split = Entity::ServiceRelation {
            source: "a".into(),
            dest: "b|c".into(),
            component_id: 0,
            detect_point: DetectPoint::Server,
        };
        assert_ne!(pipe.entity_id(), split.entity_id());
        assert_eq!(encode_id_part("100%"), "100%25");
    }

    #[test]
    fn plain_names_keep_readable_ids() {
        let relation = Entity::EndpointRelation {
            source_service: "gateway".into(),
            source_endpoint: "/checkout".into(),
            dest_service: "order".into(),
            dest_endpoint: "/pay".into(),
            component_id: 1,
            detect_point: DetectPoint::Server,
        };
        assert_eq!(relation.entity_id(), "gateway./checkout|order./pay");
        let ends = relation.relation().unwrap();
        assert_eq!(ends.source_id, "gateway./checkout");
        assert_eq!(ends.dest_id, "order./pay");
    }
}
