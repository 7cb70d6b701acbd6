use crate::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of lifecycle events a run can produce. The set is closed: consumers
/// switch on the dotted tag and must not see kinds outside it. `run.error` is
/// an SSE frame name only, never a stored kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.finished")]
    RunFinished,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.finished")]
    NodeFinished,
    #[serde(rename = "node.output.delta")]
    NodeOutputDelta,
    #[serde(rename = "node.output.final")]
    NodeOutputFinal,
    #[serde(rename = "route.decision")]
    RouteDecision,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "human.request")]
    HumanRequest,
    #[serde(rename = "human.response")]
    HumanResponse,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::RunFinished => "run.finished",
            EventKind::NodeStarted => "node.started",
            EventKind::NodeFinished => "node.finished",
            EventKind::NodeOutputDelta => "node.output.delta",
            EventKind::NodeOutputFinal => "node.output.final",
            EventKind::RouteDecision => "route.decision",
            EventKind::ToolCall => "tool.call",
            EventKind::ToolResult => "tool.result",
            EventKind::HumanRequest => "human.request",
            EventKind::HumanResponse => "human.response",
        }
    }

    /// Run-level events carry no node identity.
    pub fn is_run_level(&self) -> bool {
        matches!(self, EventKind::RunStarted | EventKind::RunFinished)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::RunFinished)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record in a run's event log.
///
/// The JSON field names are a wire contract: the SSE stream and the stored
/// payload both serialize to exactly this shape, and consumers rely on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "RunID")]
    pub run_id: RunId,

    /// Strictly monotonically increasing per run, starting at 1. Unique
    /// under `(run_id, seq)`.
    #[serde(rename = "Seq")]
    pub seq: u64,

    #[serde(rename = "Kind")]
    pub kind: EventKind,

    /// Empty for run-level events
    #[serde(rename = "NodeID", default)]
    pub node_id: String,

    #[serde(rename = "NodeKind", default)]
    pub node_kind: String,

    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,

    #[serde(rename = "Attempt")]
    pub attempt: u32,

    /// Nanoseconds since the enclosing node or run began
    #[serde(rename = "Elapsed")]
    pub elapsed_ns: u64,

    /// Free-form JSON object. Never null at rest: absent payloads are `{}`.
    #[serde(rename = "Payload", default)]
    pub payload: Map<String, Value>,

    /// Empty when tracing is disabled
    #[serde(rename = "TraceID", default)]
    pub trace_id: String,

    #[serde(rename = "SpanID", default)]
    pub span_id: String,
}

impl Event {
    /// A run-level event with no node identity.
    pub fn run_level(run_id: RunId, seq: u64, kind: EventKind, payload: Map<String, Value>) -> Self {
        Self {
            run_id,
            seq,
            kind,
            node_id: String::new(),
            node_kind: String::new(),
            time: Utc::now(),
            attempt: 1,
            elapsed_ns: 0,
            payload,
            trace_id: String::new(),
            span_id: String::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trips_dotted_tags() {
        let json = serde_json::to_string(&EventKind::NodeOutputDelta).unwrap();
        assert_eq!(json, "\"node.output.delta\"");

        let kind: EventKind = serde_json::from_str("\"route.decision\"").unwrap();
        assert_eq!(kind, EventKind::RouteDecision);
    }

    #[test]
    fn test_wire_field_names() {
        let mut payload = Map::new();
        payload.insert("chunk".to_string(), json!(3));

        let mut event = Event::run_level(RunId::from("run-1".to_string()), 1, EventKind::RunStarted, payload);
        event.node_id = "node-a".to_string();
        event.trace_id = "trace-1".to_string();

        let value = event.to_json();
        let obj = value.as_object().unwrap();
        for field in [
            "RunID", "Seq", "Kind", "NodeID", "NodeKind", "Time", "Attempt", "Elapsed",
            "Payload", "TraceID", "SpanID",
        ] {
            assert!(obj.contains_key(field), "missing wire field {}", field);
        }
        assert_eq!(obj["Kind"], json!("run.started"));
        assert_eq!(obj["Payload"]["chunk"], json!(3));
    }

    #[test]
    fn test_payload_defaults_to_empty_object() {
        let raw = json!({
            "RunID": "run-1",
            "Seq": 1,
            "Kind": "node.started",
            "Time": "2025-01-01T00:00:00Z",
            "Attempt": 1,
            "Elapsed": 0,
        });

        let event: Event = serde_json::from_value(raw).unwrap();
        assert!(event.payload.is_empty());
        assert_eq!(event.to_json()["Payload"], json!({}));
    }

    #[test]
    fn test_nested_payload_round_trip() {
        let mut payload = Map::new();
        payload.insert(
            "nested".to_string(),
            json!({"list": [1, 2.5, true, null], "inner": {"k": "v"}}),
        );
        let event = Event::run_level(RunId::from("run-1".to_string()), 2, EventKind::ToolResult, payload.clone());

        let bytes = serde_json::to_vec(&event).unwrap();
        let back: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.payload, payload);
    }
}
