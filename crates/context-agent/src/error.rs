//! Error types for each failure domain.
//!
//! Listener failures ([`ListenerError`](crate::bus::ListenerError)) and
//! record-store failures ([`StoreError`]) are absorbed inside the crate and
//! only ever logged. The others reach callers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The sensor program could not produce output.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor program not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied running sensor: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("failed to spawn sensor {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sensor i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("sensor exited with {}: {stderr}", .code.map_or("signal".to_string(), |c| format!("code {c}")))]
    Exit { code: Option<i32>, stderr: String },
}

/// Errors surfaced by [`ContextAgent`](crate::agent::ContextAgent).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no snapshot available yet")]
    NotInitialized,

    #[error("agent is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unsupported config format: {} (expected .toml or .json)", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("sensor script not found: {}", .0.display())]
    SensorMissing(PathBuf),
}

/// Record-store failures inside the persistence side-channel.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
