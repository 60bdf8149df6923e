//! Subcommand handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use context_agent::config::AgentConfig;
use context_agent::persistence::{Persistence, PersistenceWorker, SnapshotFilter};
use context_agent::snapshot::Snapshot;
use context_agent::{ContextAgent, Event, EventKind};
use serde_json::Value;

/// Usage percent at which `monitor` escalates to CRITICAL.
const CRITICAL_PERCENT: i64 = 90;

fn build_agent(config: AgentConfig) -> Result<ContextAgent> {
    let persistence = config.persistence.clone();
    let agent = ContextAgent::new(config).context("failed to create agent")?;
    if persistence.enabled {
        let handle = PersistenceWorker::spawn(Arc::new(Persistence::from_config(&persistence)));
        return Ok(agent.with_persistence(handle));
    }
    Ok(agent)
}

// ── get / info ─────────────────────────────────────────────────────

pub async fn get(config: AgentConfig, json: bool) -> Result<()> {
    let agent = build_agent(config)?;
    let snapshot = agent.refresh().await?;
    if json {
        println!("{}", snapshot.to_json_pretty());
    } else {
        println!("{}", snapshot.display_text());
    }
    agent.shutdown().await;
    Ok(())
}

pub async fn info(config: AgentConfig) -> Result<()> {
    let agent = build_agent(config)?;
    let snapshot = agent.refresh().await?;
    print_info(&snapshot);
    agent.shutdown().await;
    Ok(())
}

fn print_info(s: &Snapshot) {
    let ws = s.workspace();
    let ctx = s.context();
    println!("Context Agent Information");
    println!("{}", "=".repeat(50));
    println!("Agent Type:       {}", s.agent_kind());
    println!("Agent Version:    {}", s.agent_version());
    println!("Sensor Version:   {}", s.sensor_version());
    println!("Last Updated:     {}", s.captured_at().to_rfc3339());
    println!();
    println!("Current State");
    println!("{}", "-".repeat(50));
    println!("Model:            {}", s.model_name());
    println!("Workspace:        {}", ws.display_name);
    println!("Path:             {}", ws.absolute_path);
    println!("Git Repository:   {}", ws.git.is_repository);
    if ws.git.is_repository {
        println!("Git Branch:       {}", ws.git.branch);
    }
    println!();
    println!("Context Window");
    println!("{}", "-".repeat(50));
    println!("Max Tokens:       {}", group_thousands(ctx.capacity_tokens()));
    println!("Tokens Used:      {}", group_thousands(ctx.used_tokens()));
    println!("Usage:            {}%", ctx.usage_percent());
    println!();
    println!("Display");
    println!("{}", "-".repeat(50));
    println!("{}", s.display_text());
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ── watch / monitor ────────────────────────────────────────────────

pub async fn watch(config: AgentConfig, only: Option<EventKind>, json: bool) -> Result<()> {
    let interval = config.polling_interval();
    let agent = build_agent(config)?;

    let kinds: Vec<EventKind> = match only {
        Some(kind) => vec![kind],
        None => EventKind::ALL.to_vec(),
    };
    for kind in kinds {
        agent.subscribe(kind, move |event| {
            println!("{}", format_event(event, json));
            Ok(())
        });
    }

    agent.start().await?;
    println!("Watching for changes (polling every {interval:?})...");
    println!("Press Ctrl+C to stop\n");
    wait_for_interrupt(&agent).await
}

fn format_event(event: &Event, json: bool) -> String {
    if json {
        return event.to_value().to_string();
    }
    format!(
        "[{}] {}: {} → {}",
        event.timestamp.format("%H:%M:%S"),
        event.kind,
        brief(&event.old_value),
        brief(&event.new_value)
    )
}

/// Strings unquoted, whole snapshots shortened to their display line.
fn brief(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("display").and_then(Value::as_str) {
            Some(display) => format!("<{display}>"),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

pub async fn monitor(config: AgentConfig, quiet: bool) -> Result<()> {
    let threshold = i64::from(config.threshold());
    let agent = build_agent(config)?;

    agent.subscribe(EventKind::ContextThreshold, move |event| {
        let usage = event.new_value.as_i64().unwrap_or_default();
        if let Some(line) = alert_line(usage, threshold) {
            println!("\n{line}");
        }
        Ok(())
    });
    if !quiet {
        agent.subscribe(EventKind::StateUpdated, |event| {
            if let Some(display) = event.new_value.get("display").and_then(Value::as_str) {
                use std::io::Write;
                print!("\r{display}");
                std::io::stdout().flush()?;
            }
            Ok(())
        });
    }

    agent.start().await?;
    println!("Monitoring context usage (threshold: {threshold}%)...");
    println!("Press Ctrl+C to stop\n");
    wait_for_interrupt(&agent).await
}

fn alert_line(usage: i64, threshold: i64) -> Option<String> {
    if usage >= CRITICAL_PERCENT {
        Some(format!("CRITICAL: Context at {usage}%"))
    } else if usage >= threshold {
        Some(format!("WARNING: Context at {usage}%"))
    } else {
        None
    }
}

async fn wait_for_interrupt(agent: &ContextAgent) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    println!("\n\nStopping...");
    agent.shutdown().await;
    Ok(())
}

// ── history ────────────────────────────────────────────────────────

pub struct HistoryArgs {
    pub limit: usize,
    pub events: bool,
    pub event_type: Option<EventKind>,
    pub workspace: Option<String>,
    pub branch: Option<String>,
}

pub async fn history(config: AgentConfig, args: HistoryArgs) -> Result<()> {
    let persistence = Persistence::from_config(&config.persistence);
    if !persistence.initialize().await {
        println!("Persistence is not available:");
        println!("{}", serde_json::to_string_pretty(&persistence.status())?);
        return Ok(());
    }

    let rows = if args.events || args.event_type.is_some() {
        persistence.query_events(args.limit, args.event_type).await
    } else {
        let filter = SnapshotFilter {
            workspace_name: args.workspace,
            git_branch: args.branch,
        };
        persistence.query_snapshots(args.limit, &filter).await
    };

    if rows.is_empty() {
        println!("No records found");
    }
    for row in rows {
        println!("{}", serde_json::to_string(&without_full_state(row))?);
    }

    let stats = persistence.statistics().await;
    eprintln!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn without_full_state(mut row: Value) -> Value {
    if let Some(map) = row.as_object_mut() {
        map.remove("full_state");
    }
    row
}

// ── config ─────────────────────────────────────────────────────────

pub fn show_config(config: &AgentConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config.to_redacted_value())?);
    Ok(())
}

/// Apply per-command overrides on top of the loaded configuration.
pub fn with_overrides(
    mut config: AgentConfig,
    interval: Option<f64>,
    threshold: Option<i64>,
) -> Result<AgentConfig> {
    if let Some(secs) = interval {
        config.polling_interval_secs = secs;
    }
    if let Some(threshold) = threshold {
        config.context_threshold = threshold;
    }
    config.validate()?;
    Ok(config)
}
