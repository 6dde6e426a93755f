// Decoded records handed over by the ingestion adapter.
// Wire decoding happens upstream; these are the typed objects it produces.

use serde::{Deserialize, Serialize};

/// One record from the ingestion adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DecodedRecord {
    Segment(SegmentRecord),
    Meter(MeterRecord),
}

/// A trace segment: all spans one service instance recorded for one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub trace_id: String,
    pub segment_id: String,
    pub service: String,
    pub service_instance: String,
    #[serde(default)]
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Entry,
    Exit,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    pub span_id: i32,
    #[serde(default = "default_parent_span_id")]
    pub parent_span_id: i32,
    pub kind: SpanKind,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub is_error: bool,
    /// Protocol status (e.g. HTTP status) when the plugin recorded one.
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub component_id: i32,
    /// Remote address of an exit span.
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub refs: Vec<SegmentReference>,
}

fn default_parent_span_id() -> i32 {
    -1
}

impl SpanRecord {
    /// `None` when the duration does not fit in an i64.
    pub fn latency(&self) -> Option<i64> {
        self.end_time.checked_sub(self.start_time)
    }
}

/// Cross-process reference from an entry span back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentReference {
    pub parent_service: String,
    #[serde(default)]
    pub parent_service_instance: String,
    #[serde(default)]
    pub parent_endpoint: String,
    /// Address the caller used to reach this service.
    #[serde(default)]
    pub network_address: String,
}

/// A runtime meter sample reported by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterRecord {
    pub service: String,
    pub service_instance: String,
    pub name: String,
    pub timestamp: i64,
    pub value: MeterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeterValue {
    Single(i64),
    Histogram(Vec<MeterBucket>),
}

/// One histogram bucket: lower bound and observation count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterBucket {
    pub bucket: i64,
    pub count: i64,
}
