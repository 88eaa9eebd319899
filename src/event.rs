//! The per-run event log entry and its SSE wire framing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Well-known event `type` values the core itself emits; custom types from
/// a node's NDJSON stdout pass through opaquely.
pub mod event_type {
    pub const HELLO: &str = "hello";
    pub const STATUS: &str = "status";
    pub const NODE_STATUS: &str = "node_status";
    pub const LOG: &str = "log";
}

/// A single monotonically-numbered record in a run's event stream.
///
/// `id` is kept as `u64` internally (per-run counter, starting at 1) and
/// rendered to its decimal string form only at the serialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub level: Option<EventLevel>,
    pub data: Value,
}

impl Event {
    /// Build an event, ensuring `data` is an object and carries `runId`
    /// (and `nodeId`, when node-scoped).
    pub fn new(
        id: u64,
        run_id: impl Into<String>,
        event_type: impl Into<String>,
        mut data: Value,
        node_id: Option<String>,
        level: Option<EventLevel>,
    ) -> Self {
        let run_id = run_id.into();
        if !data.is_object() {
            data = Value::Object(Map::new());
        }
        let obj = data.as_object_mut().expect("coerced to object above");
        obj.entry("runId").or_insert_with(|| Value::String(run_id.clone()));
        if let Some(node_id) = &node_id {
            obj.entry("nodeId")
                .or_insert_with(|| Value::String(node_id.clone()));
        }
        Self {
            id,
            ts: Utc::now(),
            event_type: event_type.into(),
            run_id,
            node_id,
            level,
            data,
        }
    }

    /// Render to the wire shape clients deserialize: `id`/`ts` as strings,
    /// snake_case field names.
    pub fn to_wire(&self) -> EventWire<'_> {
        EventWire {
            id: self.id.to_string(),
            ts: self.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            event_type: &self.event_type,
            run_id: &self.run_id,
            node_id: self.node_id.as_deref(),
            level: self.level,
            data: &self.data,
        }
    }

    /// SSE framing: `id:`/`event:`/`data:` lines followed by a blank line,
    /// `data:` carrying the compact JSON of `data` (not the whole envelope —
    /// only the payload is sent as `data:`).
    pub fn to_sse_frame(&self) -> String {
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_type,
            serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".to_string())
        )
    }
}

/// Serializable wire projection of [`Event`]: `id` and `ts` as strings,
/// snake_case field names.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventWire<'a> {
    pub id: String,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    pub data: &'a Value,
}
