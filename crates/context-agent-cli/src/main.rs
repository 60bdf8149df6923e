//! Command-line front end for the context agent.
//!
//! # Examples
//!
//! ```sh
//! # Current display line, or the full snapshot as JSON
//! context-agent get
//! context-agent get --json
//!
//! # Stream branch changes
//! context-agent watch --event branch_changed
//!
//! # Threshold alerts with a live status line
//! context-agent monitor --threshold 80
//! ```

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use context_agent::EventKind;
use context_agent::config::AgentConfig;

use crate::commands::HistoryArgs;

/// Context agent command-line tool.
#[derive(Parser)]
#[command(name = "context-agent", version)]
struct Cli {
    /// Config file (.toml or .json). Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sensor program to run instead of the configured one.
    #[arg(long, global = true)]
    sensor: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sensor once and print the current state
    Get {
        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the sensor once and print every snapshot field
    Info,
    /// Print events as they happen
    Watch {
        /// Polling interval in seconds
        #[arg(long, default_value_t = 2.0)]
        interval: f64,
        /// Context threshold percent
        #[arg(long)]
        threshold: Option<i64>,
        /// Only print events of this kind (e.g. branch_changed)
        #[arg(long)]
        event: Option<EventKind>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Alert when context usage crosses the threshold
    Monitor {
        /// Polling interval in seconds
        #[arg(long)]
        interval: Option<f64>,
        /// Alert threshold percent
        #[arg(long)]
        threshold: Option<i64>,
        /// Only print alerts
        #[arg(long)]
        quiet: bool,
    },
    /// Query persisted snapshots or events
    History {
        /// Maximum number of records
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Show events instead of snapshots
        #[arg(long)]
        events: bool,
        /// Only events of this kind
        #[arg(long)]
        event_type: Option<EventKind>,
        /// Only snapshots from this workspace
        #[arg(long)]
        workspace: Option<String>,
        /// Only snapshots on this branch
        #[arg(long)]
        branch: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = logging::bootstrap(|| AgentConfig::load(cli.config.as_deref()))?;
    if let Some(sensor) = cli.sensor {
        config.sensor_path = sensor;
    }
    logging::init(&config.logging);
    tracing::debug!("Effective configuration: {config:?}");

    match cli.command {
        Command::Get { json } => commands::get(config, json).await,
        Command::Info => commands::info(config).await,
        Command::Watch {
            interval,
            threshold,
            event,
            json,
        } => {
            let config = commands::with_overrides(config, Some(interval), threshold)?;
            commands::watch(config, event, json).await
        }
        Command::Monitor {
            interval,
            threshold,
            quiet,
        } => {
            let config = commands::with_overrides(config, interval, threshold)?;
            commands::monitor(config, quiet).await
        }
        Command::History {
            limit,
            events,
            event_type,
            workspace,
            branch,
        } => {
            let args = HistoryArgs {
                limit,
                events,
                event_type,
                workspace,
                branch,
            };
            commands::history(config, args).await
        }
        Command::Config => commands::show_config(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_watch_with_event_filter() {
        let cli = Cli::try_parse_from([
            "context-agent",
            "--sensor",
            "/opt/sensor.sh",
            "watch",
            "--event",
            "branch_changed",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.sensor, Some(PathBuf::from("/opt/sensor.sh")));
        match cli.command {
            Command::Watch {
                event, json, interval, ..
            } => {
                assert_eq!(event, Some(EventKind::BranchChanged));
                assert!(json);
                assert!((interval - 2.0).abs() < f64::EPSILON);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn rejects_unknown_event_kind() {
        assert!(Cli::try_parse_from(["context-agent", "watch", "--event", "nope"]).is_err());
    }
}
