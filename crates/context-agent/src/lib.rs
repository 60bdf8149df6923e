//! Context-monitoring agent: polls an external sensor and turns its output
//! into typed change events.
//!
//! `context-agent` periodically runs a sensor program that reports the
//! current model, workspace, git branch, and context-window usage of a coding
//! session. Each reading becomes an immutable [`Snapshot`](snapshot::Snapshot).
//! Consecutive snapshots are compared, meaningful transitions are classified
//! into [`Event`](event::Event)s, and events are dispatched synchronously to
//! registered listeners. An optional side-channel mirrors snapshots and
//! events to a remote record store on a best-effort basis.
//!
//! # Getting started
//!
//! ```ignore
//! use context_agent::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::load(None)?;
//!     let agent = ContextAgent::new(config)?;
//!
//!     agent.subscribe(EventKind::BranchChanged, |event| {
//!         println!("branch: {} -> {}", event.old_value, event.new_value);
//!         Ok(())
//!     });
//!
//!     agent.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     agent.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **The data model:** [`snapshot`] ([`Snapshot`](snapshot::Snapshot),
//!   [`ContextUsage`](snapshot::ContextUsage), [`SnapshotBuilder`](snapshot::SnapshotBuilder)).
//! - **Change detection and classification:** [`detect`] and [`classify`],
//!   including the one-shot [`ThresholdLatch`](classify::ThresholdLatch).
//! - **Listening for events:** [`bus`] ([`EventListener`](bus::EventListener),
//!   [`FnListener`](bus::FnListener), [`LoggingListener`](bus::LoggingListener)).
//! - **Running the sensor:** [`sensor`] ([`SensorSource`](sensor::SensorSource),
//!   [`ProcessSensor`](sensor::ProcessSensor), [`parse_output`](sensor::parse_output)).
//! - **Polling:** [`agent`] ([`ContextAgent`](agent::ContextAgent)).
//! - **Persistence:** [`persistence`].
//! - **Configuration:** [`config`] ([`AgentConfig`](config::AgentConfig)).

pub mod agent;
pub mod bus;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod persistence;
pub mod prelude;
pub mod sensor;
pub mod snapshot;

pub use agent::ContextAgent;
pub use error::{AgentError, ConfigError, SensorError, StoreError};
pub use event::{Event, EventKind};
pub use snapshot::Snapshot;
