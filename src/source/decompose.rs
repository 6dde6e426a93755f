// Segment / meter record -> source events, one per monitored dimension.
// Each span and each reference is extracted on its own; a malformed one is
// logged and skipped without affecting the others.

use tracing::{debug, warn};

use super::{
    DecodedRecord, DetectPoint, Entity, MeterRecord, SegmentRecord, SegmentReference, SourceEvent,
    SpanKind, SpanRecord, USER_SERVICE,
};

/// Why one dimension of a record could not be extracted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecomposeError {
    #[error("segment {segment_id} has no service name")]
    MissingService { segment_id: String },
    #[error("span {span_id} has an empty operation name")]
    EmptyOperationName { span_id: i32 },
    #[error("span {span_id} ends before it starts ({start} > {end})")]
    NegativeDuration { span_id: i32, start: i64, end: i64 },
    #[error("span {span_id} duration overflows ({start}..{end})")]
    LatencyOverflow { span_id: i32, start: i64, end: i64 },
    #[error("exit span {span_id} has no peer")]
    MissingPeer { span_id: i32 },
    #[error("reference on span {span_id} has no parent service")]
    MissingParentService { span_id: i32 },
    #[error("meter sample of {service} has an empty name")]
    EmptyMeterName { service: String },
}

/// Splits one decoded record into source events.
///
/// Ordering of the returned events carries no meaning.
pub fn decompose(record: &DecodedRecord) -> Vec<SourceEvent> {
    match record {
        DecodedRecord::Segment(segment) => decompose_segment(segment),
        DecodedRecord::Meter(meter) => match decompose_meter(meter) {
            Ok(event) => vec![event],
            Err(e) => {
                warn!(error = %e, operation = "decompose_meter", "skipping meter sample");
                Vec::new()
            }
        },
    }
}

fn decompose_segment(segment: &SegmentRecord) -> Vec<SourceEvent> {
    let mut events = Vec::new();
    if segment.service.is_empty() {
        let e = DecomposeError::MissingService {
            segment_id: segment.segment_id.clone(),
        };
        warn!(error = %e, operation = "decompose_segment", "skipping segment");
        return events;
    }

    for span in &segment.spans {
        let result = match span.kind {
            SpanKind::Entry => entry_events(segment, span, &mut events),
            SpanKind::Exit => exit_events(segment, span, &mut events),
            SpanKind::Local => Ok(()),
        };
        if let Err(e) = result {
            warn!(
                error = %e,
                segment_id = %segment.segment_id,
                span_id = span.span_id,
                operation = "decompose_segment",
                "skipping span"
            );
        }
    }

    debug!(
        segment_id = %segment.segment_id,
        events = events.len(),
        "segment decomposed"
    );
    events
}

/// Checks the span and returns its latency.
fn validate_span(span: &SpanRecord) -> Result<i64, DecomposeError> {
    if span.operation_name.is_empty() {
        return Err(DecomposeError::EmptyOperationName {
            span_id: span.span_id,
        });
    }
    if span.end_time < span.start_time {
        return Err(DecomposeError::NegativeDuration {
            span_id: span.span_id,
            start: span.start_time,
            end: span.end_time,
        });
    }
    span.latency().ok_or(DecomposeError::LatencyOverflow {
        span_id: span.span_id,
        start: span.start_time,
        end: span.end_time,
    })
}

fn observe(span: &SpanRecord, latency: i64, entity: Entity) -> SourceEvent {
    SourceEvent {
        entity,
        timestamp: span.start_time,
        latency,
        status_code: span.status_code,
        is_error: span.is_error,
        meter: None,
    }
}

fn entry_events(
    segment: &SegmentRecord,
    span: &SpanRecord,
    events: &mut Vec<SourceEvent>,
) -> Result<(), DecomposeError> {
    let latency = validate_span(span)?;

    events.push(observe(
        span,
        latency,
        Entity::Service {
            name: segment.service.clone(),
        },
    ));
    events.push(observe(
        span,
        latency,
        Entity::ServiceInstance {
            service: segment.service.clone(),
            instance: segment.service_instance.clone(),
        },
    ));
    events.push(observe(
        span,
        latency,
        Entity::Endpoint {
            service: segment.service.clone(),
            endpoint: span.operation_name.clone(),
        },
    ));

    if span.refs.is_empty() {
        let user = SegmentReference {
            parent_service: USER_SERVICE.to_string(),
            parent_service_instance: String::new(),
            parent_endpoint: USER_SERVICE.to_string(),
            network_address: String::new(),
        };
        events.extend(server_relations(segment, span, latency, &user)?);
        return Ok(());
    }

    for reference in &span.refs {
        match server_relations(segment, span, latency, reference) {
            Ok(relations) => events.extend(relations),
            Err(e) => warn!(
                error = %e,
                segment_id = %segment.segment_id,
                operation = "decompose_reference",
                "skipping reference"
            ),
        }
    }
    Ok(())
}

fn server_relations(
    segment: &SegmentRecord,
    span: &SpanRecord,
    latency: i64,
    reference: &SegmentReference,
) -> Result<[SourceEvent; 2], DecomposeError> {
    if reference.parent_service.is_empty() {
        return Err(DecomposeError::MissingParentService {
            span_id: span.span_id,
        });
    }
    Ok([
        observe(
            span,
            latency,
            Entity::ServiceRelation {
                source: reference.parent_service.clone(),
                dest: segment.service.clone(),
                component_id: span.component_id,
                detect_point: DetectPoint::Server,
            },
        ),
        observe(
            span,
            latency,
            Entity::EndpointRelation {
                source_service: reference.parent_service.clone(),
                source_endpoint: reference.parent_endpoint.clone(),
                dest_service: segment.service.clone(),
                dest_endpoint: span.operation_name.clone(),
                component_id: span.component_id,
                detect_point: DetectPoint::Server,
            },
        ),
    ])
}

fn exit_events(
    segment: &SegmentRecord,
    span: &SpanRecord,
    events: &mut Vec<SourceEvent>,
) -> Result<(), DecomposeError> {
    let latency = validate_span(span)?;
    let peer = span
        .peer
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or(DecomposeError::MissingPeer {
            span_id: span.span_id,
        })?;

    events.push(observe(
        span,
        latency,
        Entity::ServiceRelation {
            source: segment.service.clone(),
            dest: peer.to_string(),
            component_id: span.component_id,
            detect_point: DetectPoint::Client,
        },
    ));
    Ok(())
}

fn decompose_meter(meter: &MeterRecord) -> Result<SourceEvent, DecomposeError> {
    if meter.name.is_empty() {
        return Err(DecomposeError::EmptyMeterName {
            service: meter.service.clone(),
        });
    }
    Ok(SourceEvent {
        entity: Entity::Meter {
            service: meter.service.clone(),
            instance: meter.service_instance.clone(),
            name: meter.name.clone(),
        },
        timestamp: meter.timestamp,
        latency: 0,
        status_code: None,
        is_error: false,
        meter: Some(meter.value.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MeterValue, Scope};

    fn span(span_id: i32, kind: SpanKind, op: &str, start: i64, end: i64) -> SpanRecord {
        SpanRecord {
            span_id,
            parent_span_id: -1,
            kind,
            operation_name: op.into(),
            start_time: start,
            end_time: end,
            is_error: false,
            status_code: Some(200),
            component_id: 1,
            peer: None,
            refs: vec![],
        }
    }

    fn segment(spans: Vec<SpanRecord>) -> DecodedRecord {
        DecodedRecord::Segment(SegmentRecord {
            trace_id: "t1".into(),
            segment_id: "s1".into(),
            service: "order".into(),
            service_instance: "order-1".into(),
            spans,
        })
    }

    fn scopes(events: &[SourceEvent]) -> Vec<Scope> {
        events.iter().map(|e| e.scope()).collect()
    }

    #[test]
    fn entry_without_reference_relates_to_user() {
        let events = decompose(&segment(vec![span(0, SpanKind::Entry, "/order", 1000, 1250)]));
        assert_eq!(
            scopes(&events),
            vec![
                Scope::Service,
                Scope::ServiceInstance,
                Scope::Endpoint,
                Scope::ServiceRelation,
                Scope::EndpointRelation
            ]
        );
        assert_eq!(events[0].latency, 250);
        assert_eq!(events[3].entity.entity_id(), "User|order");
    }

    #[test]
    fn exit_span_emits_client_relation() {
        let mut exit = span(1, SpanKind::Exit, "db.query", 1000, 1010);
        exit.peer = Some("mysql:3306".into());
        let events = decompose(&segment(vec![exit]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity.detect_point(), Some(DetectPoint::Client));
        assert_eq!(events[0].entity.entity_id(), "order|mysql:3306");
    }

    #[test]
    fn malformed_span_does_not_abort_others() {
        let broken = span(0, SpanKind::Entry, "", 1000, 1100);
        let backwards = span(1, SpanKind::Entry, "/b", 2000, 1000);
        let mut exit_no_peer = span(2, SpanKind::Exit, "call", 1000, 1001);
        exit_no_peer.peer = None;
        let good = span(3, SpanKind::Entry, "/ok", 1000, 1100);
        let events = decompose(&segment(vec![broken, backwards, exit_no_peer, good]));
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.timestamp == 1000));
    }

    #[test]
    fn overflowing_duration_skips_only_that_span() {
        let huge = span(0, SpanKind::Entry, "/huge", i64::MIN + 10, i64::MAX - 10);
        let mut huge_exit = span(1, SpanKind::Exit, "call", i64::MIN, 0);
        huge_exit.peer = Some("cache:6379".into());
        let good = span(2, SpanKind::Entry, "/ok", 1000, 1100);
        let events = decompose(&segment(vec![huge, huge_exit, good]));
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.latency == 100));

        let huge = span(7, SpanKind::Entry, "/huge", i64::MIN + 10, i64::MAX - 10);
        assert!(matches!(
            validate_span(&huge),
            Err(DecomposeError::LatencyOverflow { span_id: 7, .. })
        ));
    }

    #[test]
    fn bad_reference_skips_only_that_relation() {
        let mut entry = span(0, SpanKind::Entry, "/pay", 1000, 1100);
        entry.refs = vec![
            SegmentReference {
                parent_service: String::new(),
                parent_service_instance: String::new(),
                parent_endpoint: "/x".into(),
                network_address: String::new(),
            },
            SegmentReference {
                parent_service: "gateway".into(),
                parent_service_instance: "gw-1".into(),
                parent_endpoint: "/checkout".into(),
                network_address: "order:8080".into(),
            },
        ];
        let events = decompose(&segment(vec![entry]));
        assert_eq!(events.len(), 5);
        assert_eq!(events[3].entity.entity_id(), "gateway|order");
        assert_eq!(events[4].entity.entity_id(), "gateway./checkout|order./pay");
    }

    #[test]
    fn meter_record_yields_one_event() {
        let record = DecodedRecord::Meter(MeterRecord {
            service: "order".into(),
            service_instance: "order-1".into(),
            name: "jvm_threads".into(),
            timestamp: 5000,
            value: MeterValue::Single(42),
        });
        let events = decompose(&record);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity.entity_id(), "order.order-1.jvm_threads");

        let empty = DecodedRecord::Meter(MeterRecord {
            service: "order".into(),
            service_instance: "order-1".into(),
            name: String::new(),
            timestamp: 5000,
            value: MeterValue::Single(1),
        });
        assert!(decompose(&empty).is_empty());
    }
}
