//! The polling orchestrator.
//!
//! [`ContextAgent`] owns the sensor, the current/previous snapshot pair, the
//! threshold latch, and the event bus. One poll cycle runs the sensor with no
//! lock held, parses its output, swaps the snapshot pair under the state
//! lock, classifies the transition, and then dispatches the resulting events
//! after the state lock is released.
//!
//! ```text
//!   start() ──▶ poll ──▶ [loop: poll ─▶ wait(interval | cancel)] ──▶ stop()
//! ```
//!
//! Listeners run synchronously on the polling task. They must not call back
//! into [`ContextAgent::refresh`] while handling an event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, EventListener, ListenerId, ListenerResult};
use crate::classify::{ThresholdLatch, classify};
use crate::config::AgentConfig;
use crate::detect::{get_changes, has_changed};
use crate::error::{AgentError, ConfigError};
use crate::event::{Event, EventKind};
use crate::persistence::{PersistenceHandle, PersistenceListener};
use crate::sensor::{ProcessSensor, SensorSource, parse_output};
use crate::snapshot::Snapshot;

/// Extra time `stop()` allows beyond the sensor timeout.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SnapshotState {
    current: Option<Arc<Snapshot>>,
    previous: Option<Arc<Snapshot>>,
    latch: ThresholdLatch,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: AgentConfig,
    sensor: Arc<dyn SensorSource>,
    bus: EventBus,
    state: Mutex<SnapshotState>,
    /// Held from the snapshot swap until dispatch finishes, so each cycle's
    /// events reach listeners contiguously and in cycle order.
    dispatch_gate: Mutex<()>,
    persistence: RwLock<Option<PersistenceHandle>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    running: AtomicBool,
}

/// Context-monitoring agent. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ContextAgent {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContextAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAgent")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("bus", &self.inner.bus)
            .finish()
    }
}

impl ContextAgent {
    /// Build an agent that runs the configured sensor program.
    ///
    /// Fails if the configuration is invalid or the sensor does not exist.
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config.check_sensor()?;
        let sensor = ProcessSensor::new(&config.sensor_path, config.sensor_timeout());
        Ok(Self::build(config, Arc::new(sensor)))
    }

    /// Build an agent around any [`SensorSource`].
    pub fn with_sensor(config: AgentConfig, sensor: Arc<dyn SensorSource>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, sensor))
    }

    fn build(config: AgentConfig, sensor: Arc<dyn SensorSource>) -> Self {
        info!(
            "Context agent initialized: sensor={}, timeout={:?}, threshold={}%",
            config.sensor_path.display(),
            config.sensor_timeout(),
            config.threshold()
        );
        Self {
            inner: Arc::new(Inner {
                config,
                sensor,
                bus: EventBus::new(),
                state: Mutex::new(SnapshotState::default()),
                dispatch_gate: Mutex::new(()),
                persistence: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Attach the persistence side-channel.
    ///
    /// Every committed snapshot is queued for storage. When the
    /// side-channel logs events, a forwarding listener is registered for
    /// every event kind.
    pub fn with_persistence(self, handle: PersistenceHandle) -> Self {
        if handle.persistence().logs_events() {
            self.inner
                .bus
                .subscribe_all(Arc::new(PersistenceListener::new(handle.clone())));
        }
        *self.inner.persistence.write().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn persistence(&self) -> Option<PersistenceHandle> {
        self.inner
            .persistence
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Listener API ───────────────────────────────────────────────

    pub fn subscribe<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, f)
    }

    pub fn subscribe_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) -> ListenerId {
        self.inner.bus.subscribe_listener(kind, listener)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.bus.unsubscribe(kind, id)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Run one poll cycle with an empty request.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, AgentError> {
        self.inner.refresh_with(&Value::Object(Map::new())).await
    }

    /// Run one poll cycle, passing `request` to the sensor.
    ///
    /// On sensor failure, returns the last good snapshot if there is one.
    pub async fn refresh_with(&self, request: &Value) -> Result<Arc<Snapshot>, AgentError> {
        self.inner.refresh_with(request).await
    }

    /// The latest snapshot, without running the sensor.
    pub fn current(&self) -> Result<Arc<Snapshot>, AgentError> {
        self.inner.current().ok_or(AgentError::NotInitialized)
    }

    pub fn previous(&self) -> Option<Arc<Snapshot>> {
        self.inner.lock_state().previous.clone()
    }

    /// The latest snapshot serialized, without running the sensor.
    pub fn snapshot_value(&self) -> Result<Value, AgentError> {
        self.current().map(|s| s.to_value())
    }

    /// The latest display line, without running the sensor.
    pub fn display_text(&self) -> Result<String, AgentError> {
        self.current().map(|s| s.display_text().to_string())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Poll once, then keep polling every `polling_interval` on a
    /// background task.
    ///
    /// The initial poll's failure is returned and the agent stays idle.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.task.is_some() {
            return Err(AgentError::AlreadyRunning);
        }

        let interval = self.inner.config.polling_interval();
        info!("Starting agent with polling interval: {interval:?}");

        if let Err(e) = self.refresh().await {
            error!("Failed to initialize state: {e}");
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(Arc::clone(&self.inner), interval, cancel.clone()));
        lifecycle.cancel = Some(cancel);
        lifecycle.task = Some(task);
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Agent started");
        Ok(())
    }

    /// Signal the background loop to stop and wait for it.
    ///
    /// Waits at most the sensor timeout plus two seconds; an overrun is
    /// logged and the loop exits on its own once its sensor call finishes.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let (Some(cancel), Some(task)) = (lifecycle.cancel.take(), lifecycle.task.take()) else {
            debug!("Agent is not running, nothing to stop");
            return;
        };

        info!("Stopping agent...");
        self.inner.running.store(false, Ordering::SeqCst);
        cancel.cancel();

        let wait = self.inner.config.sensor_timeout() + STOP_GRACE;
        match tokio::time::timeout(wait, task).await {
            Ok(Ok(())) => info!("Agent stopped"),
            Ok(Err(e)) => warn!("Poll loop ended abnormally: {e}"),
            Err(_) => warn!("Poll loop did not stop within {wait:?}"),
        }
    }

    /// Stop polling and flush the persistence side-channel.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(handle) = self.persistence() {
            handle.shutdown().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SnapshotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.lock_state().current.clone()
    }

    async fn refresh_with(&self, request: &Value) -> Result<Arc<Snapshot>, AgentError> {
        match self.sensor.read(request).await {
            Ok(output) => {
                let snapshot = Arc::new(parse_output(&output.stdout, &output.stderr));
                self.commit(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(e) => {
                error!("Sensor execution failed: {e}");
                match self.current() {
                    Some(existing) => {
                        warn!("Returning cached snapshot due to sensor failure");
                        Ok(existing)
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Swap in `snapshot`, classify the transition, and dispatch.
    fn commit(&self, snapshot: Arc<Snapshot>) {
        let gate = self.dispatch_gate.lock().unwrap_or_else(|e| e.into_inner());

        let events = {
            let mut state = self.lock_state();
            let previous = state.current.replace(Arc::clone(&snapshot));
            state.previous.clone_from(&previous);

            let previous = previous.as_deref();
            if has_changed(&snapshot, previous) {
                let changes = get_changes(&snapshot, previous);
                classify(
                    &snapshot,
                    previous,
                    &changes,
                    self.config.threshold(),
                    &mut state.latch,
                )
            } else {
                Vec::new()
            }
        };

        if !events.is_empty() {
            debug!("Dispatching {} event(s)", events.len());
        }
        for event in &events {
            self.bus.dispatch(event);
        }
        drop(gate);

        let persistence = self.persistence.read().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = persistence.as_ref() {
            handle.store_snapshot(snapshot);
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, interval: Duration, cancel: CancellationToken) {
    debug!("Poll loop started with interval: {interval:?}");
    let request = Value::Object(Map::new());
    while !cancel.is_cancelled() {
        if let Err(e) = inner.refresh_with(&request).await {
            error!("Sensor execution failed in poll loop: {e}");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Poll loop exited");
}
