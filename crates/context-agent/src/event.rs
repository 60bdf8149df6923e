//! Typed events raised from snapshot transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The five kinds of event the classifier can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModelChanged,
    WorkspaceChanged,
    BranchChanged,
    ContextThreshold,
    StateUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::ModelChanged,
        EventKind::WorkspaceChanged,
        EventKind::BranchChanged,
        EventKind::ContextThreshold,
        EventKind::StateUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ModelChanged => "model_changed",
            EventKind::WorkspaceChanged => "workspace_changed",
            EventKind::BranchChanged => "branch_changed",
            EventKind::ContextThreshold => "context_threshold",
            EventKind::StateUpdated => "state_updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    /// Accepts the snake_case wire name, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

/// One observable transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub old_value: Value,
    pub new_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Event {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>, old_value: Value, new_value: Value) -> Self {
        Self {
            kind,
            timestamp,
            old_value,
            new_value,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Metadata lookup; `None` when absent.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Wire form. `metadata` is always present and defaults to `{}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("event_type".into(), Value::String(self.kind.as_str().into()));
        map.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        map.insert("old_value".into(), self.old_value.clone());
        map.insert("new_value".into(), self.new_value.clone());
        map.insert(
            "metadata".into(),
            Value::Object(self.metadata.clone().unwrap_or_default()),
        );
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names() {
        assert_eq!(EventKind::ContextThreshold.to_string(), "context_threshold");
        assert_eq!(
            serde_json::to_value(EventKind::StateUpdated).unwrap(),
            json!("state_updated")
        );
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("BRANCH_CHANGED".parse::<EventKind>(), Ok(EventKind::BranchChanged));
        assert!("nope".parse::<EventKind>().is_err());
    }

    #[test]
    fn to_value_defaults_metadata() {
        let event = Event::new(EventKind::ModelChanged, Utc::now(), json!("a"), json!("b"));
        let value = event.to_value();
        assert_eq!(value["event_type"], "model_changed");
        assert_eq!(value["old_value"], "a");
        assert_eq!(value["metadata"], json!({}));
    }

    #[test]
    fn meta_reads_metadata() {
        let mut meta = Map::new();
        meta.insert("threshold".into(), json!(80));
        let event = Event::new(EventKind::ContextThreshold, Utc::now(), json!(70), json!(85))
            .with_metadata(meta);
        assert_eq!(event.meta("threshold"), Some(&json!(80)));
        assert_eq!(event.meta("missing"), None);
    }
}
