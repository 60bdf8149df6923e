//! Best-effort persistence of snapshots and events to a remote record store.
//!
//! Nothing in this module fails outward. Store errors are logged and turn
//! into `None` or empty results, and a disabled or misconfigured side-channel
//! simply does nothing. Writes from the polling path go through a
//! [`PersistenceHandle`], which enqueues onto a bounded channel drained by a
//! separate tokio task, so a slow store never delays polling or dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventListener, ListenerResult};
use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::event::{Event, EventKind};
use crate::snapshot::Snapshot;

pub const STATE_TABLE: &str = "context_agent_state";
pub const EVENTS_TABLE: &str = "context_agent_events";

/// Capacity of the worker queue; jobs beyond this are dropped.
pub const QUEUE_CAPACITY: usize = 256;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ── Store abstraction ──────────────────────────────────────────────

/// Boxed future returned by [`RecordStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Query against one table: equality filters plus sort order and row limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub filter: Map<String, Value>,
    pub sort: Map<String, Value>,
    pub limit: usize,
}

impl RecordQuery {
    /// Newest first by `timestamp`, no filter.
    pub fn newest(limit: usize) -> Self {
        let mut sort = Map::new();
        sort.insert("timestamp".into(), json!(-1));
        Self {
            filter: Map::new(),
            sort,
            limit,
        }
    }

    pub fn filter_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter.insert(field.to_string(), value.into());
        self
    }
}

/// Name, description and column schema of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

impl TableSpec {
    /// Snapshot rows, indexed by time, workspace and branch.
    pub fn state() -> Self {
        Self {
            name: STATE_TABLE,
            description: "Context agent state snapshots",
            schema: json!({
                "fields": {
                    "id": "string",
                    "timestamp": "string",
                    "agent_version": "string",
                    "model": "string",
                    "workspace_name": "string",
                    "workspace_path": "string",
                    "git_branch": "string",
                    "git_is_repo": "boolean",
                    "context_usage_pct": "number",
                    "context_tokens_used": "number",
                    "context_max_tokens": "number",
                    "full_state": "object",
                    "display": "string",
                    "created_at": "string",
                },
                "indexes": ["timestamp", "workspace_name", "git_branch"],
            }),
        }
    }

    pub fn events() -> Self {
        Self {
            name: EVENTS_TABLE,
            description: "Context agent state change events",
            schema: json!({
                "fields": {
                    "id": "string",
                    "timestamp": "string",
                    "event_type": "string",
                    "old_value": "string",
                    "new_value": "string",
                    "metadata": "object",
                    "created_at": "string",
                },
                "indexes": ["timestamp", "event_type"],
            }),
        }
    }
}

/// A table-oriented record store.
pub trait RecordStore: Send + Sync {
    /// Create `spec`'s table unless it already exists.
    ///
    /// Schemaless stores keep the default, which does nothing.
    fn ensure_table<'a>(&'a self, spec: &'a TableSpec) -> StoreFuture<'a, ()> {
        let _ = spec;
        Box::pin(async { Ok(()) })
    }

    fn insert<'a>(&'a self, table: &'a str, row: Value) -> StoreFuture<'a, ()>;

    fn query<'a>(&'a self, table: &'a str, query: RecordQuery) -> StoreFuture<'a, Vec<Value>>;

    fn count<'a>(&'a self, table: &'a str) -> StoreFuture<'a, u64>;
}

// ── HTTP store ─────────────────────────────────────────────────────

/// JSON REST client for the hosted record store.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: String,
}

impl HttpRecordStore {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("context-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            api_key: api_key.into(),
        })
    }

    fn tables_url(&self) -> String {
        format!("{}/v1/projects/{}/tables", self.base_url, self.project_id)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.tables_url())
    }

    fn rows_url(&self, table: &str) -> String {
        format!("{}/rows", self.table_url(table))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, StoreError> {
        let resp = request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!("Record store response: HTTP {status} ({} bytes)", text.len());
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl RecordStore for HttpRecordStore {
    fn ensure_table<'a>(&'a self, spec: &'a TableSpec) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self.send(self.client.get(self.table_url(spec.name))).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Status { status: 404, .. }) => {}
                Err(e) => return Err(e),
            }
            info!("Creating {} table...", spec.name);
            let body = json!({
                "table_name": spec.name,
                "description": spec.description,
                "schema": spec.schema,
            });
            self.send(self.client.post(self.tables_url()).json(&body)).await?;
            info!("Created {} table", spec.name);
            Ok(())
        })
    }

    fn insert<'a>(&'a self, table: &'a str, row: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let body = json!({ "rows": [row] });
            self.send(self.client.post(self.rows_url(table)).json(&body))
                .await
                .map(|_| ())
        })
    }

    fn query<'a>(&'a self, table: &'a str, query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let url = format!("{}/query", self.rows_url(table));
            let resp = self.send(self.client.post(url).json(&query)).await?;
            match resp.get("rows") {
                Some(Value::Array(rows)) => Ok(rows.clone()),
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(other) => Err(StoreError::Decode(format!("rows is not an array: {other}"))),
            }
        })
    }

    fn count<'a>(&'a self, table: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let url = format!("{}/count", self.rows_url(table));
            let resp = self.send(self.client.get(url)).await?;
            resp.get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| StoreError::Decode(format!("missing count in {resp}")))
        })
    }
}

// ── In-memory store ────────────────────────────────────────────────

/// Process-local store for tests and offline use.
///
/// Queries return rows newest-inserted first and support equality filters.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row in `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().unwrap_or_default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert<'a>(&'a self, table: &'a str, row: Value) -> StoreFuture<'a, ()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().push(row);
        Box::pin(async { Ok(()) })
    }

    fn query<'a>(&'a self, table: &'a str, query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
        let rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .rev()
            .filter(|row| query.filter.iter().all(|(k, v)| row.get(k) == Some(v)))
            .take(query.limit)
            .collect();
        Box::pin(async move { Ok(rows) })
    }

    fn count<'a>(&'a self, table: &'a str) -> StoreFuture<'a, u64> {
        let n = self.rows(table).len() as u64;
        Box::pin(async move { Ok(n) })
    }
}

// ── Facade ─────────────────────────────────────────────────────────

/// Filters for [`Persistence::query_snapshots`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub workspace_name: Option<String>,
    pub git_branch: Option<String>,
}

/// Summary of the side-channel's readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceStatus {
    pub enabled: bool,
    pub initialized: bool,
    pub error: Option<String>,
    pub project_id: Option<String>,
    pub api_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready,
    Failed(String),
}

/// Never-failing front for a [`RecordStore`].
///
/// Writes and queries are no-ops until [`Persistence::initialize`] has made
/// sure both tables exist. A [`PersistenceWorker`] does that as soon as it
/// starts.
pub struct Persistence {
    store: Option<Arc<dyn RecordStore>>,
    enabled: bool,
    project_id: Option<String>,
    api_configured: bool,
    log_events: bool,
    init: Mutex<InitState>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("enabled", &self.enabled)
            .field("init", &*self.init_state())
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl Persistence {
    /// A side-channel that does nothing.
    pub fn disabled() -> Self {
        Self {
            store: None,
            enabled: false,
            project_id: None,
            api_configured: false,
            log_events: false,
            init: Mutex::new(InitState::Pending),
        }
    }

    /// Build the HTTP-backed side-channel described by `config`.
    ///
    /// Missing credentials or a client that fails to build leave it
    /// disabled with the reason recorded in
    /// [`PersistenceStatus::error`]. The store is not contacted until
    /// [`Persistence::initialize`].
    pub fn from_config(config: &PersistenceConfig) -> Self {
        let api_configured = config.api_key.as_deref().is_some_and(|k| !k.is_empty());
        let mut this = Self {
            enabled: config.enabled,
            project_id: config.project_id.clone(),
            api_configured,
            log_events: config.log_events,
            ..Self::disabled()
        };
        if !config.enabled {
            info!("Persistence disabled by configuration");
            return this;
        }

        let missing = config.missing_credentials();
        if !missing.is_empty() {
            let reason = format!("missing {}", missing.join(", "));
            warn!("Persistence enabled but not configured: {reason}");
            this.enabled = false;
            this.init = Mutex::new(InitState::Failed(reason));
            return this;
        }

        let (Some(key), Some(project)) = (&config.api_key, &config.project_id) else {
            return this;
        };
        match HttpRecordStore::new(&config.base_url, project, key) {
            Ok(store) => this.store = Some(Arc::new(store)),
            Err(e) => {
                error!("Failed to initialize persistence: {e}");
                this.enabled = false;
                this.init = Mutex::new(InitState::Failed(e.to_string()));
            }
        }
        this
    }

    /// An enabled side-channel writing to `store`, pending initialization.
    pub fn with_store(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store: Some(store),
            enabled: true,
            api_configured: true,
            log_events: true,
            ..Self::disabled()
        }
    }

    pub fn with_log_events(mut self, log_events: bool) -> Self {
        self.log_events = log_events;
        self
    }

    fn init_state(&self) -> std::sync::MutexGuard<'_, InitState> {
        self.init.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn initialization_error(&self) -> Option<String> {
        match &*self.init_state() {
            InitState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Make sure both tables exist. Returns whether the side-channel is ready.
    ///
    /// A failure disables the side-channel for good and is reported through
    /// [`Persistence::status`]. Calling this again after success is free.
    pub async fn initialize(&self) -> bool {
        let Some(store) = self.store.as_ref().filter(|_| self.enabled) else {
            debug!("Persistence is disabled; skipping initialization");
            return false;
        };
        let state = self.init_state().clone();
        match state {
            InitState::Ready => return true,
            InitState::Failed(_) => return false,
            InitState::Pending => {}
        }

        let result = async {
            store.ensure_table(&TableSpec::state()).await?;
            store.ensure_table(&TableSpec::events()).await
        }
        .await;

        let mut state = self.init_state();
        match result {
            Ok(()) => {
                info!(
                    "Persistence initialized for project {}",
                    self.project_id.as_deref().unwrap_or("<unset>")
                );
                *state = InitState::Ready;
                true
            }
            Err(e) => {
                error!("Failed to ensure persistence tables exist: {e}");
                *state = InitState::Failed(e.to_string());
                false
            }
        }
    }

    /// Whether work handed to this side-channel can ever be written.
    ///
    /// True while initialization is still pending.
    pub fn is_available(&self) -> bool {
        self.enabled
            && self.store.is_some()
            && !matches!(*self.init_state(), InitState::Failed(_))
    }

    /// Whether events should be mirrored in addition to snapshots.
    pub fn logs_events(&self) -> bool {
        self.log_events
    }

    pub fn status(&self) -> PersistenceStatus {
        let state = self.init_state().clone();
        let enabled = self.enabled && !matches!(state, InitState::Failed(_));
        PersistenceStatus {
            enabled,
            initialized: state == InitState::Ready,
            error: match state {
                InitState::Failed(reason) => Some(reason),
                _ => None,
            },
            project_id: if enabled { self.project_id.clone() } else { None },
            api_configured: self.api_configured,
        }
    }

    fn active_store(&self) -> Option<&Arc<dyn RecordStore>> {
        let ready = *self.init_state() == InitState::Ready;
        self.store.as_ref().filter(|_| self.enabled && ready)
    }

    /// Write one snapshot row; returns its record id.
    pub async fn store_snapshot(&self, snapshot: &Snapshot) -> Option<String> {
        let store = self.active_store()?;
        let id = Uuid::new_v4().to_string();
        let row = snapshot_row(&id, snapshot);
        match store.insert(STATE_TABLE, row).await {
            Ok(()) => {
                debug!("Stored snapshot {id}");
                Some(id)
            }
            Err(e) => {
                error!("Failed to store snapshot: {e}");
                None
            }
        }
    }

    /// Write one event row; returns its record id.
    pub async fn log_event(&self, event: &Event) -> Option<String> {
        let store = self.active_store()?;
        let id = Uuid::new_v4().to_string();
        let row = event_row(&id, event);
        match store.insert(EVENTS_TABLE, row).await {
            Ok(()) => {
                debug!("Logged {} event {id}", event.kind);
                Some(id)
            }
            Err(e) => {
                error!("Failed to log event: {e}");
                None
            }
        }
    }

    /// Snapshot rows, newest first.
    pub async fn query_snapshots(&self, limit: usize, filter: &SnapshotFilter) -> Vec<Value> {
        let Some(store) = self.active_store() else {
            return Vec::new();
        };
        let mut query = RecordQuery::newest(limit);
        if let Some(name) = &filter.workspace_name {
            query = query.filter_eq("workspace_name", name.as_str());
        }
        if let Some(branch) = &filter.git_branch {
            query = query.filter_eq("git_branch", branch.as_str());
        }
        store.query(STATE_TABLE, query).await.unwrap_or_else(|e| {
            error!("Failed to query state history: {e}");
            Vec::new()
        })
    }

    /// Event rows, newest first, optionally of one kind.
    pub async fn query_events(&self, limit: usize, kind: Option<EventKind>) -> Vec<Value> {
        let Some(store) = self.active_store() else {
            return Vec::new();
        };
        let mut query = RecordQuery::newest(limit);
        if let Some(kind) = kind {
            query = query.filter_eq("event_type", kind.as_str());
        }
        store.query(EVENTS_TABLE, query).await.unwrap_or_else(|e| {
            error!("Failed to query event logs: {e}");
            Vec::new()
        })
    }

    /// Row counts per table, or the reason persistence is unavailable.
    pub async fn statistics(&self) -> Value {
        let Some(store) = self.active_store() else {
            return json!({
                "enabled": false,
                "initialization_error": self.initialization_error(),
            });
        };
        let counts = async {
            let snapshots = store.count(STATE_TABLE).await?;
            let events = store.count(EVENTS_TABLE).await?;
            Ok::<_, StoreError>((snapshots, events))
        };
        match counts.await {
            Ok((snapshots, events)) => json!({
                "enabled": true,
                "initialized": true,
                "project_id": self.project_id,
                "state_snapshots": snapshots,
                "event_logs": events,
                "tables": { "state": STATE_TABLE, "events": EVENTS_TABLE },
            }),
            Err(e) => {
                error!("Failed to get statistics: {e}");
                json!({ "enabled": true, "initialized": true, "error": e.to_string() })
            }
        }
    }
}

fn snapshot_row(id: &str, snapshot: &Snapshot) -> Value {
    let ws = snapshot.workspace();
    let ctx = snapshot.context();
    json!({
        "id": id,
        "timestamp": snapshot.captured_at().to_rfc3339(),
        "agent_version": snapshot.agent_version(),
        "model": snapshot.model_name(),
        "workspace_name": ws.display_name,
        "workspace_path": ws.absolute_path,
        "git_branch": ws.git.branch,
        "git_is_repo": ws.git.is_repository,
        "context_usage_pct": ctx.usage_percent(),
        "context_tokens_used": ctx.used_tokens(),
        "context_max_tokens": ctx.capacity_tokens(),
        "full_state": snapshot.to_value(),
        "display": snapshot.display_text(),
        "created_at": Utc::now().to_rfc3339(),
    })
}

fn event_row(id: &str, event: &Event) -> Value {
    json!({
        "id": id,
        "timestamp": event.timestamp.to_rfc3339(),
        "event_type": event.kind.as_str(),
        "old_value": stringify(&event.old_value),
        "new_value": stringify(&event.new_value),
        "metadata": event.metadata.clone().unwrap_or_default(),
        "created_at": Utc::now().to_rfc3339(),
    })
}

/// Strings pass through, null becomes `""`, anything else is compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Worker ─────────────────────────────────────────────────────────

enum Job {
    Snapshot(Arc<Snapshot>),
    Event(Event),
}

/// Background task that drains persistence jobs.
pub struct PersistenceWorker;

impl PersistenceWorker {
    /// Spawn the drain task on the current tokio runtime.
    pub fn spawn(persistence: Arc<Persistence>) -> PersistenceHandle {
        Self::spawn_with_capacity(persistence, QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(persistence: Arc<Persistence>, capacity: usize) -> PersistenceHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain(Arc::clone(&persistence), rx, cancel.clone()));
        PersistenceHandle {
            tx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
            persistence,
        }
    }
}

async fn drain(persistence: Arc<Persistence>, mut rx: mpsc::Receiver<Job>, cancel: CancellationToken) {
    debug!("Persistence worker started");
    persistence.initialize().await;
    loop {
        tokio::select! {
            biased;
            job = rx.recv() => match job {
                Some(job) => run_job(&persistence, job).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                while let Ok(job) = rx.try_recv() {
                    run_job(&persistence, job).await;
                }
                break;
            }
        }
    }
    debug!("Persistence worker exited");
}

async fn run_job(persistence: &Persistence, job: Job) {
    match job {
        Job::Snapshot(snapshot) => {
            persistence.store_snapshot(&snapshot).await;
        }
        Job::Event(event) => {
            persistence.log_event(&event).await;
        }
    }
}

/// Cheap, cloneable sender side of a [`PersistenceWorker`].
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    persistence: Arc<Persistence>,
}

impl std::fmt::Debug for PersistenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceHandle")
            .field("persistence", &self.persistence)
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

impl PersistenceHandle {
    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// Queue a snapshot write. Never blocks; drops the job if the queue is full.
    pub fn store_snapshot(&self, snapshot: Arc<Snapshot>) {
        if self.persistence.is_available() {
            self.enqueue(Job::Snapshot(snapshot));
        }
    }

    /// Queue an event write. Never blocks; drops the job if the queue is full.
    pub fn log_event(&self, event: Event) {
        if self.persistence.is_available() && self.persistence.logs_events() {
            self.enqueue(Job::Event(event));
        }
    }

    fn enqueue(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Persistence queue full; dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Persistence worker stopped; dropping job");
            }
        }
    }

    /// Stop accepting work, flush what is queued, and wait briefly for the
    /// worker to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
        {
            warn!("Persistence worker did not finish within {SHUTDOWN_GRACE:?}");
        }
    }
}

/// Forwards every dispatched event to a [`PersistenceHandle`].
pub struct PersistenceListener {
    handle: PersistenceHandle,
}

impl PersistenceListener {
    pub fn new(handle: PersistenceHandle) -> Self {
        Self { handle }
    }
}

impl EventListener for PersistenceListener {
    fn on_event(&self, event: &Event) -> ListenerResult {
        self.handle.log_event(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore;

    impl RecordStore for FailingStore {
        fn insert<'a>(&'a self, _table: &'a str, _row: Value) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(StoreError::Decode("down".into())) })
        }
        fn query<'a>(&'a self, _table: &'a str, _query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
            Box::pin(async { Err(StoreError::Decode("down".into())) })
        }
        fn count<'a>(&'a self, _table: &'a str) -> StoreFuture<'a, u64> {
            Box::pin(async { Err(StoreError::Decode("down".into())) })
        }
    }

    /// Store whose inserts never complete quickly, for queue tests.
    struct SlowStore(AtomicUsize);

    impl RecordStore for SlowStore {
        fn insert<'a>(&'a self, _table: &'a str, _row: Value) -> StoreFuture<'a, ()> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
        fn query<'a>(&'a self, _table: &'a str, _query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn count<'a>(&'a self, _table: &'a str) -> StoreFuture<'a, u64> {
            Box::pin(async { Ok(0) })
        }
    }

    /// Memory store whose table bootstrap always fails.
    #[derive(Default)]
    struct NoTablesStore {
        rows: MemoryRecordStore,
        ensured: Mutex<Vec<&'static str>>,
    }

    impl RecordStore for NoTablesStore {
        fn ensure_table<'a>(&'a self, spec: &'a TableSpec) -> StoreFuture<'a, ()> {
            self.ensured.lock().unwrap().push(spec.name);
            Box::pin(async {
                Err(StoreError::Status {
                    status: 403,
                    body: "table creation not allowed".into(),
                })
            })
        }
        fn insert<'a>(&'a self, table: &'a str, row: Value) -> StoreFuture<'a, ()> {
            self.rows.insert(table, row)
        }
        fn query<'a>(&'a self, table: &'a str, query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
            self.rows.query(table, query)
        }
        fn count<'a>(&'a self, table: &'a str) -> StoreFuture<'a, u64> {
            self.rows.count(table)
        }
    }

    /// Memory store that records which tables were ensured.
    #[derive(Default)]
    struct TrackingStore {
        rows: MemoryRecordStore,
        ensured: Mutex<Vec<&'static str>>,
    }

    impl RecordStore for TrackingStore {
        fn ensure_table<'a>(&'a self, spec: &'a TableSpec) -> StoreFuture<'a, ()> {
            self.ensured.lock().unwrap().push(spec.name);
            Box::pin(async { Ok(()) })
        }
        fn insert<'a>(&'a self, table: &'a str, row: Value) -> StoreFuture<'a, ()> {
            self.rows.insert(table, row)
        }
        fn query<'a>(&'a self, table: &'a str, query: RecordQuery) -> StoreFuture<'a, Vec<Value>> {
            self.rows.query(table, query)
        }
        fn count<'a>(&'a self, table: &'a str) -> StoreFuture<'a, u64> {
            self.rows.count(table)
        }
    }

    fn snapshot(name: &str, branch: &str) -> Snapshot {
        Snapshot::builder()
            .workspace_name(name)
            .branch(branch)
            .usage_percent(42)
            .display("line")
            .build()
    }

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Utc::now(), json!("main"), Value::Null)
    }

    #[tokio::test]
    async fn stores_snapshot_rows() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = Persistence::with_store(store.clone());
        assert!(persistence.initialize().await);
        let id = persistence.store_snapshot(&snapshot("ainative", "main")).await.unwrap();

        let rows = store.rows(STATE_TABLE);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["id"], id.as_str());
        assert_eq!(row["workspace_name"], "ainative");
        assert_eq!(row["git_branch"], "main");
        assert_eq!(row["git_is_repo"], true);
        assert_eq!(row["context_usage_pct"], 42);
        assert_eq!(row["full_state"]["display"], "line");
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn event_rows_stringify_values() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = Persistence::with_store(store.clone());
        assert!(persistence.initialize().await);
        let mut meta = Map::new();
        meta.insert("threshold".into(), json!(80));
        let threshold = Event::new(EventKind::ContextThreshold, Utc::now(), json!(70), json!(85))
            .with_metadata(meta);
        persistence.log_event(&threshold).await.unwrap();
        persistence.log_event(&event(EventKind::BranchChanged)).await.unwrap();

        let rows = store.rows(EVENTS_TABLE);
        assert_eq!(rows[0]["event_type"], "context_threshold");
        assert_eq!(rows[0]["old_value"], "70");
        assert_eq!(rows[0]["metadata"]["threshold"], 80);
        assert_eq!(rows[1]["old_value"], "main");
        assert_eq!(rows[1]["new_value"], "");
        assert_eq!(rows[1]["metadata"], json!({}));
    }

    #[tokio::test]
    async fn queries_are_newest_first_and_filtered() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = Persistence::with_store(store);
        assert!(persistence.initialize().await);
        for (name, branch) in [("a", "main"), ("b", "main"), ("a", "dev")] {
            persistence.store_snapshot(&snapshot(name, branch)).await;
        }

        let all = persistence.query_snapshots(10, &SnapshotFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["git_branch"], "dev");

        let filter = SnapshotFilter {
            workspace_name: Some("a".into()),
            ..SnapshotFilter::default()
        };
        let only_a = persistence.query_snapshots(10, &filter).await;
        assert_eq!(only_a.len(), 2);

        let limited = persistence.query_snapshots(1, &SnapshotFilter::default()).await;
        assert_eq!(limited.len(), 1);

        persistence.log_event(&event(EventKind::ModelChanged)).await;
        persistence.log_event(&event(EventKind::BranchChanged)).await;
        let branch_events = persistence.query_events(10, Some(EventKind::BranchChanged)).await;
        assert_eq!(branch_events.len(), 1);

        let stats = persistence.statistics().await;
        assert_eq!(stats["state_snapshots"], 3);
        assert_eq!(stats["event_logs"], 2);
    }

    #[tokio::test]
    async fn store_failures_degrade_to_none_and_empty() {
        let persistence = Persistence::with_store(Arc::new(FailingStore));
        assert!(persistence.initialize().await);
        assert!(persistence.store_snapshot(&snapshot("a", "main")).await.is_none());
        assert!(persistence.log_event(&event(EventKind::ModelChanged)).await.is_none());
        assert!(persistence.query_snapshots(5, &SnapshotFilter::default()).await.is_empty());
        assert!(persistence.query_events(5, None).await.is_empty());
        assert!(persistence.statistics().await["error"].is_string());
    }

    #[tokio::test]
    async fn initialize_ensures_both_tables_once() {
        let store = Arc::new(TrackingStore::default());
        let persistence = Persistence::with_store(store.clone());
        assert!(!persistence.status().initialized);
        assert!(persistence.store_snapshot(&snapshot("a", "main")).await.is_none());

        assert!(persistence.initialize().await);
        assert!(persistence.initialize().await);
        assert_eq!(*store.ensured.lock().unwrap(), vec![STATE_TABLE, EVENTS_TABLE]);

        let status = persistence.status();
        assert!(status.enabled);
        assert!(status.initialized);
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn failed_table_bootstrap_disables_persistence() {
        let store = Arc::new(NoTablesStore::default());
        let persistence = Persistence::with_store(store.clone());
        assert!(persistence.is_available());

        assert!(!persistence.initialize().await);
        assert!(!persistence.initialize().await);
        assert_eq!(*store.ensured.lock().unwrap(), vec![STATE_TABLE]);

        let status = persistence.status();
        assert!(!status.enabled);
        assert!(!status.initialized);
        assert!(status.error.as_deref().is_some_and(|e| e.contains("403")), "{status:?}");
        assert!(!persistence.is_available());
        assert!(persistence.store_snapshot(&snapshot("a", "main")).await.is_none());
        assert!(persistence.statistics().await["initialization_error"].is_string());
        assert!(store.rows.rows(STATE_TABLE).is_empty());
    }

    #[tokio::test]
    async fn worker_bootstraps_tables_before_writing() {
        let store = Arc::new(TrackingStore::default());
        let persistence = Arc::new(Persistence::with_store(store.clone()));
        let handle = PersistenceWorker::spawn(Arc::clone(&persistence));
        handle.store_snapshot(Arc::new(snapshot("a", "main")));
        handle.shutdown().await;

        assert!(persistence.status().initialized);
        assert_eq!(store.ensured.lock().unwrap().len(), 2);
        assert_eq!(store.rows.rows(STATE_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn worker_records_bootstrap_failure() {
        let store = Arc::new(NoTablesStore::default());
        let persistence = Arc::new(Persistence::with_store(store.clone()));
        let handle = PersistenceWorker::spawn(Arc::clone(&persistence));
        handle.store_snapshot(Arc::new(snapshot("a", "main")));
        handle.shutdown().await;

        assert!(persistence.status().error.is_some());
        assert!(store.rows.rows(STATE_TABLE).is_empty());

        // Once the failure is known, nothing is queued at all.
        handle.store_snapshot(Arc::new(snapshot("b", "main")));
        assert!(!persistence.is_available());
    }

    #[tokio::test]
    async fn disabled_persistence_is_inert() {
        let persistence = Persistence::from_config(&PersistenceConfig::default());
        assert!(!persistence.is_available());
        assert!(persistence.store_snapshot(&snapshot("a", "main")).await.is_none());
        assert_eq!(persistence.statistics().await["enabled"], false);
        let status = persistence.status();
        assert!(!status.enabled);
        assert!(!status.initialized);
    }

    #[test]
    fn enabled_without_credentials_records_error() {
        let config = PersistenceConfig {
            enabled: true,
            api_key: Some("k".into()),
            ..PersistenceConfig::default()
        };
        let persistence = Persistence::from_config(&config);
        let status = persistence.status();
        assert!(!status.enabled);
        assert!(status.api_configured);
        assert_eq!(status.error.as_deref(), Some("missing project_id"));
    }

    #[test]
    fn http_store_builds_row_urls() {
        let store = HttpRecordStore::new("https://api.example.com/", "p1", "k").unwrap();
        assert_eq!(
            store.rows_url(STATE_TABLE),
            "https://api.example.com/v1/projects/p1/tables/context_agent_state/rows"
        );
        assert_eq!(
            store.table_url(EVENTS_TABLE),
            "https://api.example.com/v1/projects/p1/tables/context_agent_events"
        );
        assert_eq!(store.tables_url(), "https://api.example.com/v1/projects/p1/tables");
    }

    #[test]
    fn record_query_serializes_sort_and_filter() {
        let query = RecordQuery::newest(5).filter_eq("event_type", "branch_changed");
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({ "filter": { "event_type": "branch_changed" }, "sort": { "timestamp": -1 }, "limit": 5 })
        );
        assert_eq!(
            serde_json::to_value(RecordQuery::newest(1)).unwrap(),
            json!({ "sort": { "timestamp": -1 }, "limit": 1 })
        );
    }

    #[tokio::test]
    async fn worker_drains_queue_on_shutdown() {
        let store = Arc::new(MemoryRecordStore::new());
        let handle = PersistenceWorker::spawn(Arc::new(Persistence::with_store(store.clone())));
        handle.store_snapshot(Arc::new(snapshot("a", "main")));
        let listener = PersistenceListener::new(handle.clone());
        listener.on_event(&event(EventKind::BranchChanged)).unwrap();
        handle.shutdown().await;

        assert_eq!(store.rows(STATE_TABLE).len(), 1);
        assert_eq!(store.rows(EVENTS_TABLE).len(), 1);

        // After shutdown, jobs are dropped without error.
        handle.store_snapshot(Arc::new(snapshot("b", "main")));
    }

    #[tokio::test]
    async fn event_logging_can_be_disabled() {
        let store = Arc::new(MemoryRecordStore::new());
        let persistence = Persistence::with_store(store.clone()).with_log_events(false);
        let handle = PersistenceWorker::spawn(Arc::new(persistence));
        handle.log_event(event(EventKind::ModelChanged));
        handle.store_snapshot(Arc::new(snapshot("a", "main")));
        handle.shutdown().await;
        assert!(store.rows(EVENTS_TABLE).is_empty());
        assert_eq!(store.rows(STATE_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let store = Arc::new(SlowStore(AtomicUsize::new(0)));
        let handle =
            PersistenceWorker::spawn_with_capacity(Arc::new(Persistence::with_store(store.clone())), 1);
        for _ in 0..20 {
            handle.store_snapshot(Arc::new(snapshot("a", "main")));
        }
        handle.shutdown().await;
        let written = store.0.load(Ordering::SeqCst);
        assert!(written >= 1 && written < 20, "wrote {written}");
    }
}
