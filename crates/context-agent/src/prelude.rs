//! Convenience re-exports for common `context-agent` types.
//!
//! ```ignore
//! use context_agent::prelude::*;
//! ```
//!
//! Store implementations and the persistence worker are left out; import
//! those from [`crate::persistence`] when needed.

// ── Model ───────────────────────────────────────────────────────────
pub use crate::detect::{Change, ChangeSet, Changes, get_changes, has_changed};
pub use crate::event::{Event, EventKind};
pub use crate::snapshot::{ContextUsage, GitStatus, Snapshot, WorkspaceIdentity};

// ── Runtime ─────────────────────────────────────────────────────────
pub use crate::agent::ContextAgent;
pub use crate::bus::{
    DispatchReport, EventBus, EventListener, FnListener, ListenerId, ListenerResult,
    LoggingListener,
};
pub use crate::config::{AgentConfig, LogFormat, PersistenceConfig};
pub use crate::sensor::{ProcessSensor, SensorOutput, SensorSource};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{AgentError, ConfigError, SensorError};
