//! Turns a snapshot transition into an ordered list of events.
//!
//! Ordering within one classification is fixed: model, workspace, branch,
//! threshold, then a trailing `StateUpdated` that carries the whole diff.
//! The threshold alert is one-shot: once raised it stays quiet until usage
//! drops back below the threshold.

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::detect::{Change, Changes};
use crate::event::{Event, EventKind};
use crate::snapshot::Snapshot;

/// Hysteresis flag for the context threshold alert.
///
/// Owned by one agent; independent agents keep independent latches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdLatch {
    alerted: bool,
}

impl ThresholdLatch {
    /// Whether an alert has fired and not yet been cleared.
    pub fn is_set(&self) -> bool {
        self.alerted
    }

    pub fn reset(&mut self) {
        self.alerted = false;
    }
}

/// Classify the transition `previous -> new`.
///
/// `changes` must be the result of `get_changes(new, previous)`. Every event
/// returned shares one timestamp.
pub fn classify(
    new: &Snapshot,
    previous: Option<&Snapshot>,
    changes: &Changes,
    threshold: u8,
    latch: &mut ThresholdLatch,
) -> Vec<Event> {
    let now = Utc::now();

    let (Some(previous), Some(diff)) = (previous, changes.diff()) else {
        return vec![Event::new(EventKind::StateUpdated, now, Value::Null, new.to_value())];
    };

    let mut events = Vec::new();

    let string_event = |kind, change: &Change<String>| {
        Event::new(kind, now, json!(change.old), json!(change.new))
    };
    if let Some(change) = &diff.model {
        events.push(string_event(EventKind::ModelChanged, change));
    }
    if let Some(change) = &diff.workspace {
        events.push(string_event(EventKind::WorkspaceChanged, change));
    }
    if let Some(change) = &diff.branch {
        events.push(string_event(EventKind::BranchChanged, change));
    }

    if let Some(usage) = &diff.context_usage {
        let (old, new_pct) = (usage.old, usage.new);
        let crossed = old < threshold && threshold <= new_pct;
        if crossed {
            if !latch.alerted {
                let mut meta = Map::new();
                meta.insert("threshold".into(), json!(threshold));
                meta.insert("exceeded".into(), json!(true));
                events.push(
                    Event::new(EventKind::ContextThreshold, now, json!(old), json!(new_pct))
                        .with_metadata(meta),
                );
                latch.alerted = true;
            }
        } else if new_pct < threshold {
            latch.alerted = false;
        }
    }

    if !diff.is_empty() {
        let mut meta = Map::new();
        meta.insert("changes".into(), diff.to_value());
        events.push(
            Event::new(EventKind::StateUpdated, now, previous.to_value(), new.to_value())
                .with_metadata(meta),
        );
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::get_changes;

    fn snap(branch: &str, pct: i64) -> Snapshot {
        Snapshot::builder()
            .model("Claude")
            .workspace_name("ainative")
            .workspace_path("/home/dev/ainative")
            .branch(branch)
            .usage_percent(pct)
            .build()
    }

    /// Run a sequence of usage percentages through the classifier and count
    /// threshold events.
    fn threshold_events(sequence: &[i64], threshold: u8) -> usize {
        let mut latch = ThresholdLatch::default();
        let mut previous: Option<Snapshot> = None;
        let mut count = 0;
        for &pct in sequence {
            let next = snap("main", pct);
            let changes = get_changes(&next, previous.as_ref());
            count += classify(&next, previous.as_ref(), &changes, threshold, &mut latch)
                .iter()
                .filter(|e| e.kind == EventKind::ContextThreshold)
                .count();
            previous = Some(next);
        }
        count
    }

    #[test]
    fn first_snapshot_yields_single_state_update() {
        let new = snap("main", 10);
        let mut latch = ThresholdLatch::default();
        let events = classify(&new, None, &Changes::Initial, 80, &mut latch);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StateUpdated);
        assert_eq!(events[0].old_value, Value::Null);
        assert_eq!(events[0].new_value["model"], "Claude");
        assert!(events[0].metadata.is_none());
    }

    #[test]
    fn branch_change_emits_branch_then_state_update() {
        let old = snap("main", 13);
        let new = snap("feature-x", 13);
        let changes = get_changes(&new, Some(&old));
        let mut latch = ThresholdLatch::default();
        let events = classify(&new, Some(&old), &changes, 80, &mut latch);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::BranchChanged);
        assert_eq!(events[0].old_value, json!("main"));
        assert_eq!(events[0].new_value, json!("feature-x"));
        assert_eq!(events[1].kind, EventKind::StateUpdated);
        assert_eq!(
            events[1].meta("changes"),
            Some(&json!({ "branch": { "old": "main", "new": "feature-x" } }))
        );
        assert_eq!(events[0].timestamp, events[1].timestamp);
    }

    #[test]
    fn ordering_is_model_workspace_branch_threshold_state() {
        let old = snap("main", 70);
        let new = Snapshot::builder()
            .model("GPT-4")
            .workspace_name("other")
            .workspace_path("/home/dev/other")
            .branch("dev")
            .usage_percent(90)
            .build();
        let changes = get_changes(&new, Some(&old));
        let mut latch = ThresholdLatch::default();
        let kinds: Vec<_> = classify(&new, Some(&old), &changes, 80, &mut latch)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ModelChanged,
                EventKind::WorkspaceChanged,
                EventKind::BranchChanged,
                EventKind::ContextThreshold,
                EventKind::StateUpdated,
            ]
        );
    }

    #[test]
    fn path_only_change_raises_state_update_only() {
        let old = snap("main", 13);
        let new = Snapshot::builder()
            .model("Claude")
            .workspace_name("ainative")
            .workspace_path("/elsewhere")
            .branch("main")
            .usage_percent(13)
            .build();
        let changes = get_changes(&new, Some(&old));
        let mut latch = ThresholdLatch::default();
        let events = classify(&new, Some(&old), &changes, 80, &mut latch);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StateUpdated);
    }

    #[test]
    fn threshold_metadata() {
        let old = snap("main", 70);
        let new = snap("main", 85);
        let changes = get_changes(&new, Some(&old));
        let mut latch = ThresholdLatch::default();
        let events = classify(&new, Some(&old), &changes, 80, &mut latch);
        let alert = &events[0];
        assert_eq!(alert.kind, EventKind::ContextThreshold);
        assert_eq!(alert.old_value, json!(70));
        assert_eq!(alert.new_value, json!(85));
        assert_eq!(alert.meta("threshold"), Some(&json!(80)));
        assert_eq!(alert.meta("exceeded"), Some(&json!(true)));
        assert!(latch.is_set());
    }

    #[test]
    fn climbing_past_threshold_alerts_once() {
        assert_eq!(threshold_events(&[70, 85, 90], 80), 1);
    }

    #[test]
    fn dropping_below_rearms_the_alert() {
        assert_eq!(threshold_events(&[70, 85, 90, 75, 85], 80), 2);
    }

    #[test]
    fn landing_exactly_on_threshold_counts() {
        assert_eq!(threshold_events(&[79, 80], 80), 1);
    }

    #[test]
    fn starting_above_threshold_does_not_alert() {
        // The first snapshot only produces a state update, and 85 -> 90 never crosses.
        assert_eq!(threshold_events(&[85, 90], 80), 0);
    }

    #[test]
    fn hovering_at_threshold_clears_only_below() {
        let mut latch = ThresholdLatch::default();
        let a = snap("main", 70);
        let b = snap("main", 80);
        classify(&b, Some(&a), &get_changes(&b, Some(&a)), 80, &mut latch);
        assert!(latch.is_set());

        let c = snap("main", 95);
        classify(&c, Some(&b), &get_changes(&c, Some(&b)), 80, &mut latch);
        assert!(latch.is_set());

        let d = snap("main", 79);
        classify(&d, Some(&c), &get_changes(&d, Some(&c)), 80, &mut latch);
        assert!(!latch.is_set());
    }

    #[test]
    fn empty_diff_yields_nothing() {
        let a = snap("main", 10);
        let b = snap("main", 10);
        let mut latch = ThresholdLatch::default();
        let events = classify(&b, Some(&a), &get_changes(&b, Some(&a)), 80, &mut latch);
        assert!(events.is_empty());
    }
}
