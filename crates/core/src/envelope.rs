use crate::types::RunId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity a run carries through every node and event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInfo {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
}

/// A single conversational message carried in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// The mutable workflow state passed between nodes: a free-form variable bag
/// plus messages, artifacts, and trace identity. Variable values are opaque
/// JSON — nothing at this layer enforces a schema over them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    #[serde(default)]
    pub trace: TraceInfo,
}

impl Envelope {
    /// Project a request's JSON input into an envelope. An object becomes the
    /// variable bag directly; null becomes an empty bag; any other value is
    /// stored under `input`.
    pub fn from_input(input: Value) -> Self {
        let vars = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        Self {
            vars,
            ..Default::default()
        }
    }

    pub fn with_run_id(mut self, run_id: &RunId) -> Self {
        self.trace.run_id = run_id.to_string();
        self
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
