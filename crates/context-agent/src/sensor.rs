//! Sensor gateway: runs the external sensor program and parses its output.
//!
//! The sensor speaks a two-channel protocol. It receives a JSON request on
//! stdin, prints a human-readable status line on stdout, and prints a JSON
//! status object on stderr. The gateway enforces a hard timeout and kills
//! the child when it expires.
//!
//! ```text
//!   request JSON ──stdin──▶ [sensor] ──stdout──▶ display line
//!                                    ──stderr──▶ status JSON
//! ```

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::error::SensorError;
use crate::snapshot::Snapshot;

/// Display text used when neither channel produced anything usable.
pub const PARSE_ERROR_DISPLAY: &str = "Error parsing sensor output";

/// Trimmed output of one successful sensor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorOutput {
    pub stdout: String,
    pub stderr: String,
}

impl SensorOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Boxed future returned by [`SensorSource::read`].
pub type SensorFuture<'a> = Pin<Box<dyn Future<Output = Result<SensorOutput, SensorError>> + Send + 'a>>;

/// Anything that can produce sensor output for a request.
///
/// [`ProcessSensor`] is the production implementation; tests and embedders
/// can supply their own. Uses a boxed future so the trait stays
/// dyn-compatible.
pub trait SensorSource: Send + Sync {
    fn read<'a>(&'a self, request: &'a Value) -> SensorFuture<'a>;
}

// ── ProcessSensor ──────────────────────────────────────────────────

/// Runs an executable as the sensor.
#[derive(Debug, Clone)]
pub struct ProcessSensor {
    program: PathBuf,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ProcessSensor {
    /// The program runs with its own directory as the working directory
    /// unless [`working_dir`](Self::working_dir) overrides it.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        let program = program.into();
        let program = std::path::absolute(&program).unwrap_or(program);
        Self {
            program,
            timeout,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn effective_dir(&self) -> Option<&Path> {
        self.working_dir
            .as_deref()
            .or_else(|| self.program.parent().filter(|p| !p.as_os_str().is_empty()))
    }

    async fn run(&self, request: &Value) -> Result<SensorOutput, SensorError> {
        let input = serde_json::to_string(request).unwrap_or_else(|_| "{}".to_string());
        debug!("Executing sensor: {}", self.program.display());
        debug!("Sensor input: {input}");

        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.effective_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => SensorError::NotFound(self.program.clone()),
            ErrorKind::PermissionDenied => SensorError::PermissionDenied(self.program.clone()),
            _ => SensorError::Spawn {
                path: self.program.clone(),
                source: e,
            },
        })?;

        // The request is fed while both output pipes are drained, so a sensor
        // that writes before it reads cannot fill a pipe and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A sensor that ignores stdin may exit before we finish writing.
                if let Err(e) = stdin.write_all(input.as_bytes()).await
                    && e.kind() != ErrorKind::BrokenPipe
                {
                    return Err(SensorError::Io(e));
                }
            }
            Ok(())
        };
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output.map_err(SensorError::Io)
        };

        // Dropping `exchange` on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SensorError::Timeout {
                timeout: self.timeout,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            warn!("Sensor exited with non-zero status: {}", output.status);
            warn!("Sensor stderr: {stderr}");
            return Err(SensorError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        debug!("Sensor stdout: {stdout}");
        debug!("Sensor stderr: {stderr}");
        Ok(SensorOutput { stdout, stderr })
    }
}

impl SensorSource for ProcessSensor {
    fn read<'a>(&'a self, request: &'a Value) -> SensorFuture<'a> {
        Box::pin(self.run(request))
    }
}

// ── Parsing ────────────────────────────────────────────────────────

/// Convert raw sensor output into a snapshot. Never fails.
///
/// Empty stderr is treated as `{}`. Malformed JSON is logged and yields a
/// degraded snapshot that keeps the display line.
pub fn parse_output(stdout: &str, stderr: &str) -> Snapshot {
    let stderr = stderr.trim();
    let data = if stderr.is_empty() {
        Ok(Value::Object(Default::default()))
    } else {
        serde_json::from_str::<Value>(stderr)
    };

    match data {
        Ok(data) => {
            if !data.is_object() {
                warn!("Sensor status is not a JSON object; using defaults");
            }
            let snapshot = Snapshot::from_sensor_output(&data, stdout);
            debug!("Parsed sensor output: {}", snapshot.to_value());
            snapshot
        }
        Err(e) => {
            error!("Failed to parse sensor JSON output: {e}");
            error!("Raw stderr: {stderr}");
            let display = stdout.trim();
            Snapshot::degraded(if display.is_empty() { PARSE_ERROR_DISPLAY } else { display })
        }
    }
}
