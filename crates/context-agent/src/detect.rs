//! Change detection between consecutive snapshots.
//!
//! Only five fields are significant: model name, workspace display name,
//! workspace path, git branch, and usage percent. Everything else (timestamps,
//! sensor version, token counts, display text) is noise for detection purposes.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::snapshot::Snapshot;

/// One field's transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

impl<T> Change<T> {
    pub fn new(old: T, new: T) -> Self {
        Self { old, new }
    }
}

/// The differing significant fields between two snapshots.
///
/// Serialized as a map containing only the present entries, keyed
/// `model`, `workspace`, `workspace_path`, `branch`, `context_usage`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Change<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Change<String>>,
    /// Tracked for consumers; no dedicated event is raised for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<Change<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<Change<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<Change<u8>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.workspace.is_none()
            && self.workspace_path.is_none()
            && self.branch.is_none()
            && self.context_usage.is_none()
    }

    /// Number of differing fields.
    pub fn len(&self) -> usize {
        [
            self.model.is_some(),
            self.workspace.is_some(),
            self.workspace_path.is_some(),
            self.branch.is_some(),
            self.context_usage.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Result of [`get_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    /// There was no previous snapshot to compare against.
    Initial,
    Diff(ChangeSet),
}

impl Changes {
    pub fn is_initial(&self) -> bool {
        matches!(self, Changes::Initial)
    }

    /// The diff, or `None` for [`Changes::Initial`].
    pub fn diff(&self) -> Option<&ChangeSet> {
        match self {
            Changes::Initial => None,
            Changes::Diff(set) => Some(set),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Changes::Initial => json!({ "initial": true }),
            Changes::Diff(set) => set.to_value(),
        }
    }
}

impl Serialize for Changes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Whether `new` differs from `previous` in any significant field.
///
/// Always `true` when there is no previous snapshot.
pub fn has_changed(new: &Snapshot, previous: Option<&Snapshot>) -> bool {
    match previous {
        None => true,
        Some(prev) => !diff(new, prev).is_empty(),
    }
}

/// The per-field diff between `new` and `previous`.
pub fn get_changes(new: &Snapshot, previous: Option<&Snapshot>) -> Changes {
    match previous {
        None => Changes::Initial,
        Some(prev) => Changes::Diff(diff(new, prev)),
    }
}

fn diff(new: &Snapshot, prev: &Snapshot) -> ChangeSet {
    let new_ws = new.workspace();
    let old_ws = prev.workspace();
    ChangeSet {
        model: changed(prev.model_name(), new.model_name()),
        workspace: changed(&old_ws.display_name, &new_ws.display_name),
        workspace_path: changed(&old_ws.absolute_path, &new_ws.absolute_path),
        branch: changed(&old_ws.git.branch, &new_ws.git.branch),
        context_usage: {
            let (old, new) = (prev.context().usage_percent(), new.context().usage_percent());
            (old != new).then(|| Change::new(old, new))
        },
    }
}

fn changed(old: &str, new: &str) -> Option<Change<String>> {
    (old != new).then(|| Change::new(old.to_string(), new.to_string()))
}
