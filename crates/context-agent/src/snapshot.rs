//! Normalized, immutable snapshots of sensor observations.
//!
//! A [`Snapshot`] is built once per successful sensor read and never mutated
//! afterwards. The agent shares snapshots across threads as `Arc<Snapshot>`,
//! so readers never need a lock to look at one.
//!
//! Construction never fails: [`Snapshot::from_sensor_output`] falls back to a
//! named default for every missing or wrongly-typed field. The serialized
//! form (see [`Snapshot::to_value`]) keeps the sensor's wire names
//! (`model`, `context_window.usage_pct`, ...) so it can be handed straight to
//! listeners, the CLI, or the persistence side-channel.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Model name used when the sensor does not report one.
pub const DEFAULT_MODEL: &str = "Claude";

/// Context window capacity used when the sensor does not report one.
pub const DEFAULT_CAPACITY_TOKENS: u64 = 200_000;

/// Sensor version recorded when the sensor does not report one.
pub const DEFAULT_SENSOR_VERSION: &str = "1.0.0";

/// The only agent kind this crate produces.
pub const AGENT_KIND: &str = "context";

/// Version stamped into every snapshot.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Git / workspace ────────────────────────────────────────────────

/// Git repository information for the observed workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitStatus {
    #[serde(rename = "is_repo")]
    pub is_repository: bool,
    pub branch: String,
}

impl GitStatus {
    pub fn new(is_repository: bool, branch: impl Into<String>) -> Self {
        Self {
            is_repository,
            branch: branch.into(),
        }
    }
}

/// Identity of the workspace the sensor is looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceIdentity {
    #[serde(rename = "path")]
    pub absolute_path: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub git: GitStatus,
}

impl WorkspaceIdentity {
    pub fn new(
        absolute_path: impl Into<String>,
        display_name: impl Into<String>,
        git: GitStatus,
    ) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            display_name: display_name.into(),
            git,
        }
    }
}

// ── Context usage ──────────────────────────────────────────────────

/// Context window usage as reported by the sensor.
///
/// Values are normalized on construction: negative inputs become `0` and a
/// percentage above `100` becomes `100`. Out-of-range sensor data is
/// corrected, never rejected. Deserialization goes through the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawContextUsage")]
pub struct ContextUsage {
    #[serde(rename = "max_tokens")]
    capacity_tokens: u64,
    #[serde(rename = "tokens_used")]
    used_tokens: u64,
    #[serde(rename = "usage_pct")]
    usage_percent: u8,
}

impl ContextUsage {
    pub fn new(capacity_tokens: i64, used_tokens: i64, usage_percent: i64) -> Self {
        Self {
            capacity_tokens: clamp_non_negative(capacity_tokens),
            used_tokens: clamp_non_negative(used_tokens),
            usage_percent: usage_percent.clamp(0, 100) as u8,
        }
    }

    pub fn capacity_tokens(&self) -> u64 {
        self.capacity_tokens
    }

    pub fn used_tokens(&self) -> u64 {
        self.used_tokens
    }

    /// Usage percentage, always within `0..=100`.
    pub fn usage_percent(&self) -> u8 {
        self.usage_percent
    }
}

impl Default for ContextUsage {
    fn default() -> Self {
        Self {
            capacity_tokens: DEFAULT_CAPACITY_TOKENS,
            used_tokens: 0,
            usage_percent: 0,
        }
    }
}

fn clamp_non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Unvalidated wire form; funnels deserialization through [`ContextUsage::new`].
#[derive(Deserialize)]
#[serde(default)]
struct RawContextUsage {
    max_tokens: i64,
    tokens_used: i64,
    usage_pct: i64,
}

impl Default for RawContextUsage {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CAPACITY_TOKENS as i64,
            tokens_used: 0,
            usage_pct: 0,
        }
    }
}

impl From<RawContextUsage> for ContextUsage {
    fn from(raw: RawContextUsage) -> Self {
        ContextUsage::new(raw.max_tokens, raw.tokens_used, raw.usage_pct)
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// One normalized observation of agent, workspace, and context state.
///
/// Fields are private; a snapshot is read through accessors and replaced
/// (never edited) when the next observation arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(rename = "agent_type")]
    agent_kind: String,
    agent_version: String,
    #[serde(rename = "model")]
    model_name: String,
    workspace: WorkspaceIdentity,
    #[serde(rename = "context_window")]
    context: ContextUsage,
    #[serde(rename = "display")]
    display_text: String,
    #[serde(rename = "last_updated", deserialize_with = "deserialize_timestamp")]
    captured_at: DateTime<Utc>,
    sensor_version: String,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            agent_kind: AGENT_KIND.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            workspace: WorkspaceIdentity::default(),
            context: ContextUsage::default(),
            display_text: String::new(),
            captured_at: Utc::now(),
            sensor_version: DEFAULT_SENSOR_VERSION.to_string(),
        }
    }
}

impl Snapshot {
    /// Build a snapshot from the sensor's JSON status blob and display line.
    ///
    /// Every field is optional in `data`; anything missing or of the wrong
    /// JSON type takes its default. A `data` value that is not an object
    /// yields an all-default snapshot carrying only the display text.
    pub fn from_sensor_output(data: &Value, display: &str) -> Self {
        let workspace = data.get("workspace").unwrap_or(&Value::Null);
        let git = workspace.get("git").unwrap_or(&Value::Null);
        let context = data.get("context_window").unwrap_or(&Value::Null);

        Self {
            model_name: str_field(data, "model").unwrap_or(DEFAULT_MODEL).to_string(),
            workspace: WorkspaceIdentity {
                absolute_path: str_field(workspace, "path").unwrap_or_default().to_string(),
                display_name: str_field(workspace, "name").unwrap_or_default().to_string(),
                git: GitStatus {
                    is_repository: git.get("is_repo").and_then(Value::as_bool).unwrap_or(false),
                    branch: str_field(git, "branch").unwrap_or_default().to_string(),
                },
            },
            context: ContextUsage::new(
                int_field(context, "max_tokens").unwrap_or(DEFAULT_CAPACITY_TOKENS as i64),
                int_field(context, "tokens_used").unwrap_or(0),
                int_field(context, "usage_pct").unwrap_or(0),
            ),
            display_text: display.trim().to_string(),
            captured_at: Utc::now(),
            sensor_version: str_field(data, "version")
                .unwrap_or(DEFAULT_SENSOR_VERSION)
                .to_string(),
            ..Self::default()
        }
    }

    /// Minimal snapshot used when the sensor's status JSON is unusable.
    pub fn degraded(display: &str) -> Self {
        Self {
            display_text: display.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Serialize the complete snapshot tree.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a snapshot from the output of [`to_value`](Self::to_value).
    ///
    /// Missing keys take their defaults; a missing timestamp becomes "now".
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn agent_kind(&self) -> &str {
        &self.agent_kind
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn workspace(&self) -> &WorkspaceIdentity {
        &self.workspace
    }

    pub fn context(&self) -> &ContextUsage {
        &self.context
    }

    /// The sensor's human-readable status line, trimmed.
    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn sensor_version(&self) -> &str {
        &self.sensor_version
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Integer field that tolerates floats (truncated) and oversized unsigned values.
fn int_field(value: &Value, key: &str) -> Option<i64> {
    let field = value.get(key)?;
    field
        .as_i64()
        .or_else(|| field.as_u64().map(|_| i64::MAX))
        .or_else(|| field.as_f64().map(|f| f as i64))
}

/// Accepts RFC 3339 as well as the naive ISO-8601 form older sensors wrote.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

// ── Builder ────────────────────────────────────────────────────────

/// Field-by-field construction of a [`Snapshot`] without going through JSON.
///
/// ```ignore
/// let snap = Snapshot::builder()
///     .model("Claude")
///     .workspace_name("ainative")
///     .branch("main")
///     .usage_percent(13)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    snapshot: Option<Snapshot>,
}

impl SnapshotBuilder {
    fn inner(&mut self) -> &mut Snapshot {
        self.snapshot.get_or_insert_with(Snapshot::default)
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.inner().model_name = model.into();
        self
    }

    pub fn workspace_name(mut self, name: impl Into<String>) -> Self {
        self.inner().workspace.display_name = name.into();
        self
    }

    pub fn workspace_path(mut self, path: impl Into<String>) -> Self {
        self.inner().workspace.absolute_path = path.into();
        self
    }

    /// Set the branch; a non-empty branch also marks the workspace as a repository.
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        let git = &mut self.inner().workspace.git;
        git.is_repository = git.is_repository || !branch.is_empty();
        git.branch = branch;
        self
    }

    pub fn is_repository(mut self, is_repository: bool) -> Self {
        self.inner().workspace.git.is_repository = is_repository;
        self
    }

    pub fn context(mut self, context: ContextUsage) -> Self {
        self.inner().context = context;
        self
    }

    pub fn usage_percent(mut self, percent: i64) -> Self {
        let current = self.inner().context;
        self.inner().context = ContextUsage::new(
            current.capacity_tokens as i64,
            current.used_tokens as i64,
            percent,
        );
        self
    }

    pub fn display(mut self, display: &str) -> Self {
        self.inner().display_text = display.trim().to_string();
        self
    }

    pub fn sensor_version(mut self, version: impl Into<String>) -> Self {
        self.inner().sensor_version = version.into();
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.inner().captured_at = at;
        self
    }

    pub fn build(mut self) -> Snapshot {
        self.snapshot.take().unwrap_or_default()
    }
}
