//! Agent configuration with layered loading and eager validation.
//!
//! Precedence, lowest to highest:
//!
//! 1. Built-in defaults ([`AgentConfig::default`]).
//! 2. An optional config file, `.toml` or `.json` chosen by extension. With
//!    no explicit file, `config/default.toml` or `config/default.json` under
//!    the working directory is used if present.
//! 3. `CONTEXT_AGENT_*` environment variables.
//!
//! ```toml
//! sensor_path = "scripts/context_sensor.sh"
//! polling_interval = 5.0
//! sensor_timeout = 5.0
//! context_threshold = 80
//!
//! [persistence]
//! enabled = true
//! project_id = "proj_123"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "CONTEXT_AGENT_";

pub const DEFAULT_SENSOR_PATH: &str = "scripts/context_sensor.sh";
pub const DEFAULT_POLLING_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_SENSOR_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_CONTEXT_THRESHOLD: i64 = 80;
pub const DEFAULT_PERSISTENCE_URL: &str = "https://api.ainative.studio";

/// Fallback config files, relative to the working directory. First match wins.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["config/default.toml", "config/default.json"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "warning", "error", "critical"];

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("log format must be text or json, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace/debug/info/warn/warning/error/critical. Default: `"info"`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// The level as a `tracing` filter directive (`warning` → `warn`,
    /// `critical` → `error`).
    pub fn filter_directive(&self) -> &'static str {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        }
    }
}

/// Settings for the persistence side-channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub base_url: String,
    /// Forward every event to the store as well as snapshots. Default: `true`.
    pub log_events: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            project_id: None,
            base_url: DEFAULT_PERSISTENCE_URL.to_string(),
            log_events: true,
        }
    }
}

impl fmt::Debug for PersistenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceConfig")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .field("log_events", &self.log_events)
            .finish()
    }
}

impl PersistenceConfig {
    /// Names of required settings that are missing while enabled.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            missing.push("api_key");
        }
        if self.project_id.as_deref().is_none_or(str::is_empty) {
            missing.push("project_id");
        }
        missing
    }
}

/// Complete agent configuration.
///
/// Durations are stored as seconds so a config file can say
/// `polling_interval = 2.5`; use [`polling_interval`](Self::polling_interval)
/// and [`sensor_timeout`](Self::sensor_timeout) for the typed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub sensor_path: PathBuf,
    #[serde(rename = "polling_interval")]
    pub polling_interval_secs: f64,
    #[serde(rename = "sensor_timeout")]
    pub sensor_timeout_secs: f64,
    /// Usage percent at which a threshold alert fires. Default: `80`.
    pub context_threshold: i64,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sensor_path: PathBuf::from(DEFAULT_SENSOR_PATH),
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            sensor_timeout_secs: DEFAULT_SENSOR_TIMEOUT_SECS,
            context_threshold: DEFAULT_CONTEXT_THRESHOLD,
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_sensor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sensor_path = path.into();
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_sensor_timeout(mut self, timeout: Duration) -> Self {
        self.sensor_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_context_threshold(mut self, threshold: i64) -> Self {
        self.context_threshold = threshold;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        secs_to_duration(self.polling_interval_secs, DEFAULT_POLLING_INTERVAL_SECS)
    }

    pub fn sensor_timeout(&self) -> Duration {
        secs_to_duration(self.sensor_timeout_secs, DEFAULT_SENSOR_TIMEOUT_SECS)
    }

    /// Threshold clamped into `0..=100`.
    pub fn threshold(&self) -> u8 {
        self.context_threshold.clamp(0, 100) as u8
    }

    /// Load defaults, then `file` (or a discovered default file), then
    /// environment overrides, and validate the result.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_file(file, Path::new(".")) {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a `.toml` or `.json` file on top of the defaults. Does not validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match extension.as_deref() {
            Some("toml") => toml::from_str(&contents).map_err(|e| parse_err(e.to_string())),
            Some("json") => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Apply `CONTEXT_AGENT_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup keyed by full variable name.
    ///
    /// Empty values are ignored. Values that fail to parse are logged and
    /// ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key, v))
        };

        if let Some((key, raw)) = get("POLLING_INTERVAL") {
            match raw.trim().parse::<f64>() {
                Ok(v) => self.polling_interval_secs = v,
                Err(e) => warn!("Ignoring {key}={raw}: {e}"),
            }
        }
        if let Some((key, raw)) = get("SENSOR_TIMEOUT") {
            match raw.trim().parse::<f64>() {
                Ok(v) => self.sensor_timeout_secs = v,
                Err(e) => warn!("Ignoring {key}={raw}: {e}"),
            }
        }
        if let Some((key, raw)) = get("CONTEXT_THRESHOLD") {
            match raw.trim().parse::<i64>() {
                Ok(v) => self.context_threshold = v,
                Err(e) => warn!("Ignoring {key}={raw}: {e}"),
            }
        }
        if let Some((_, raw)) = get("SENSOR_PATH") {
            self.sensor_path = PathBuf::from(raw.trim());
        }
        if let Some((_, raw)) = get("ENABLE_PERSISTENCE") {
            self.persistence.enabled = parse_bool(&raw);
        }
        if let Some((_, raw)) = get("PERSISTENCE_API_KEY") {
            self.persistence.api_key = Some(raw.trim().to_string());
        }
        if let Some((_, raw)) = get("PERSISTENCE_PROJECT_ID") {
            self.persistence.project_id = Some(raw.trim().to_string());
        }
        if let Some((_, raw)) = get("PERSISTENCE_BASE_URL") {
            self.persistence.base_url = raw.trim().to_string();
        }
        if let Some((_, raw)) = get("PERSISTENCE_LOG_EVENTS") {
            self.persistence.log_events = parse_bool(&raw);
        }
        if let Some((_, raw)) = get("LOG_LEVEL") {
            self.logging.level = raw.trim().to_string();
        }
        if let Some((key, raw)) = get("LOG_FORMAT") {
            match raw.parse::<LogFormat>() {
                Ok(format) => self.logging.format = format,
                Err(e) => warn!("Ignoring {key}: {e}"),
            }
        }
    }

    /// Check every setting and report all problems at once.
    ///
    /// Does not check that the sensor exists; that happens when a process
    /// sensor is built from this config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(self.polling_interval_secs.is_finite() && self.polling_interval_secs > 0.0) {
            errors.push(format!(
                "polling_interval must be > 0, got {}",
                self.polling_interval_secs
            ));
        }
        if !(self.sensor_timeout_secs.is_finite() && self.sensor_timeout_secs > 0.0) {
            errors.push(format!(
                "sensor_timeout must be > 0, got {}",
                self.sensor_timeout_secs
            ));
        }
        if !(0..=100).contains(&self.context_threshold) {
            errors.push(format!(
                "context_threshold must be between 0-100, got {}",
                self.context_threshold
            ));
        }
        let level = self.logging.level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            errors.push(format!(
                "log level must be one of {}, got {}",
                LOG_LEVELS.join("/"),
                self.logging.level
            ));
        }
        if self.persistence.base_url.trim().is_empty() {
            errors.push("persistence base_url must not be empty".to_string());
        }

        if self.persistence.enabled {
            let missing = self.persistence.missing_credentials();
            if !missing.is_empty() {
                warn!(
                    "Persistence is enabled but configuration is incomplete: missing {}",
                    missing.join(", ")
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Fail with [`ConfigError::SensorMissing`] unless the sensor path is a file.
    pub fn check_sensor(&self) -> Result<(), ConfigError> {
        if self.sensor_path.is_file() {
            Ok(())
        } else {
            Err(ConfigError::SensorMissing(self.sensor_path.clone()))
        }
    }

    /// Effective configuration as JSON with the API key redacted.
    pub fn to_redacted_value(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(key) = value.pointer_mut("/persistence/api_key")
            && !key.is_null()
        {
            *key = serde_json::Value::String("***".to_string());
        }
        value
    }
}

/// The explicit file if given, else the first default file under `base`.
fn config_file(file: Option<&Path>, base: &Path) -> Option<PathBuf> {
    if let Some(path) = file {
        return Some(path.to_path_buf());
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|rel| base.join(rel))
        .find(|candidate| candidate.is_file())
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn secs_to_duration(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}
