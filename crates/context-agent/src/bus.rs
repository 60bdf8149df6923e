//! Synchronous event dispatch with per-listener failure isolation.
//!
//! Listeners register per [`EventKind`] and are invoked in registration
//! order on the dispatching thread. A listener that returns an error or
//! panics is logged and skipped; the remaining listeners still run.
//!
//! # Choosing a listener
//!
//! | Listener | Use case |
//! |----------|----------|
//! | [`FnListener`] | Quick closures for simple callbacks |
//! | [`LoggingListener`] | Structured logging via `tracing` |
//! | [`PersistenceListener`](crate::persistence::PersistenceListener) | Mirror events to the record store |
//! | Custom `impl EventListener` | Full control |

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::event::{Event, EventKind};

/// Error type listeners may return. Never propagates past the bus.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = Result<(), ListenerError>;

/// Receives dispatched events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event) -> ListenerResult;
}

/// A listener backed by a closure.
///
/// ```ignore
/// let listener = FnListener::new(|event| {
///     println!("{}", event.kind);
///     Ok(())
/// });
/// ```
pub struct FnListener<F>(F)
where
    F: Fn(&Event) -> ListenerResult + Send + Sync;

impl<F> FnListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &Event) -> ListenerResult {
        (self.0)(event)
    }
}

/// Logs every event through `tracing`.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &Event) -> ListenerResult {
        match event.kind {
            EventKind::ModelChanged => {
                info!("Model changed: {} -> {}", event.old_value, event.new_value);
            }
            EventKind::WorkspaceChanged => {
                info!("Workspace changed: {} -> {}", event.old_value, event.new_value);
            }
            EventKind::BranchChanged => {
                info!("Branch changed: {} -> {}", event.old_value, event.new_value);
            }
            EventKind::ContextThreshold => {
                warn!(
                    "Context usage crossed threshold: {}% -> {}% (threshold {})",
                    event.old_value,
                    event.new_value,
                    event.meta("threshold").cloned().unwrap_or_default()
                );
            }
            EventKind::StateUpdated => {
                debug!(
                    "State updated: {}",
                    event.meta("changes").cloned().unwrap_or_default()
                );
            }
        }
        Ok(())
    }
}

/// Handle returned by subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of one [`EventBus::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

type Registration = (ListenerId, Arc<dyn EventListener>);

/// Per-kind listener registry.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventKind, usize> = EventKind::ALL
            .into_iter()
            .map(|kind| (kind, self.listener_count(kind)))
            .filter(|(_, n)| *n > 0)
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.subscribe_listener(kind, Arc::new(FnListener::new(f)))
    }

    pub fn subscribe_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        table.entry(kind).or_default().push((id, listener));
        id
    }

    /// Register one listener for every kind; returns one id per kind, in
    /// [`EventKind::ALL`] order.
    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> Vec<ListenerId> {
        EventKind::ALL
            .into_iter()
            .map(|kind| self.subscribe_listener(kind, Arc::clone(&listener)))
            .collect()
    }

    /// Remove a registration. Returns `false` if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut table = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = table.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Invoke every listener registered for the event's kind, in order.
    ///
    /// The listener list is copied before invocation, so listeners may
    /// subscribe or unsubscribe during dispatch; such changes take effect
    /// from the next dispatch.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let targets: Vec<Registration> = {
            let table = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            table.get(&event.kind).cloned().unwrap_or_default()
        };

        let mut report = DispatchReport::default();
        for (id, listener) in targets {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("Listener {:?} failed on {}: {e}", id, event.kind);
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        "Listener {:?} panicked on {}: {}",
                        id,
                        event.kind,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        report
    }

    /// Remove all listeners for `kind`, or every listener when `None`.
    pub fn clear(&self, kind: Option<EventKind>) {
        let mut table = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        match kind {
            Some(kind) => {
                table.remove(&kind);
            }
            None => table.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        let table = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        table.get(&kind).map_or(0, Vec::len)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Utc::now(), json!("a"), json!("b"))
    }

    #[test]
    fn invokes_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::ModelChanged, move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }
        let report = bus.dispatch(&event(EventKind::ModelChanged));
        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_kind_is_invoked() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::BranchChanged, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.dispatch(&event(EventKind::ModelChanged));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.dispatch(&event(EventKind::BranchChanged));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_and_panicking_listeners_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        bus.subscribe(EventKind::StateUpdated, |_| Err("boom".into()));
        bus.subscribe(EventKind::StateUpdated, |_| panic!("listener exploded"));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::StateUpdated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = bus.dispatch(&event(EventKind::StateUpdated));
        assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Faulty listeners stay registered and do not poison later dispatches.
        let report = bus.dispatch(&event(EventKind::StateUpdated));
        assert_eq!(report.failed, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let bus = EventBus::new();
        let a = bus.subscribe(EventKind::ModelChanged, |_| Ok(()));
        let _b = bus.subscribe(EventKind::ModelChanged, |_| Ok(()));
        assert!(bus.unsubscribe(EventKind::ModelChanged, a));
        assert_eq!(bus.listener_count(EventKind::ModelChanged), 1);
        assert!(!bus.unsubscribe(EventKind::ModelChanged, a));
        assert!(!bus.unsubscribe(EventKind::BranchChanged, a));
    }

    #[test]
    fn subscribe_during_dispatch_applies_next_time() {
        let bus = Arc::new(EventBus::new());
        let late_hits = Arc::new(AtomicU64::new(0));
        let bus_inner = Arc::clone(&bus);
        let late = Arc::clone(&late_hits);
        bus.subscribe(EventKind::ModelChanged, move |_| {
            let late = Arc::clone(&late);
            bus_inner.subscribe(EventKind::ModelChanged, move |_| {
                late.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        let report = bus.dispatch(&event(EventKind::ModelChanged));
        assert_eq!(report.invoked, 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        bus.dispatch(&event(EventKind::ModelChanged));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_all_and_clear() {
        let bus = EventBus::new();
        let ids = bus.subscribe_all(Arc::new(LoggingListener));
        assert_eq!(ids.len(), EventKind::ALL.len());
        for kind in EventKind::ALL {
            assert_eq!(bus.listener_count(kind), 1);
        }
        bus.clear(Some(EventKind::ModelChanged));
        assert_eq!(bus.listener_count(EventKind::ModelChanged), 0);
        assert_eq!(bus.listener_count(EventKind::BranchChanged), 1);
        bus.clear(None);
        assert_eq!(bus.listener_count(EventKind::BranchChanged), 0);
    }

    #[test]
    fn dispatch_with_no_listeners_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.dispatch(&event(EventKind::StateUpdated)), DispatchReport::default());
    }
}
