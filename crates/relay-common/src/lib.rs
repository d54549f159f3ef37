//! Shared domain types for the relay pipeline.
//!
//! - Sources describe inbound routes
//! - Events are the durable unit of ingestion
//! - Endpoints are outbound delivery targets
//! - Tasks and Attempts track delivery work

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type WorkspaceId = String;
pub type SourceId = String;
pub type EndpointId = String;
pub type TaskId = String;
pub type AttemptId = String;

/// Generate a new time-ordered identifier
pub fn generate_id() -> String {
    Ulid::new().to_string()
}

/// Convert a std duration for timestamp arithmetic, saturating on overflow
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128 / 1_000) as i64)
}

/// `from + d`, clamped to the latest representable instant
pub fn later_by(from: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    from.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Sources
// ============================================================================

/// Inbound route definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: SourceId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
    pub methods: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stage the event in memory and return before it is persisted
    #[serde(default)]
    pub async_ingest: bool,
    #[serde(default)]
    pub response: Option<ResponseOverride>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    /// Static endpoint bindings. When set, fan-out ignores subscriptions.
    #[serde(default)]
    pub endpoints: Option<Vec<EndpointId>>,
}

impl Source {
    pub fn new(workspace_id: impl Into<String>, path: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            id: generate_id(),
            workspace_id: workspace_id.into(),
            name: None,
            path: path.into(),
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            enabled: true,
            async_ingest: false,
            response: None,
            plugins: Vec::new(),
            endpoints: None,
        }
    }

    pub fn with_plugin(mut self, plugin: PluginConfig) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_response(mut self, response: ResponseOverride) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointId>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Synchronous response returned to the inbound caller after admission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseOverride {
    pub code: u16,
    pub content_type: String,
    pub body: String,
}

/// Plugin attached to a source, with its raw configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Events
// ============================================================================

/// Time-ordered, lexicographically sortable event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// A persisted occurrence derived from an admitted inbound request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub workspace_id: WorkspaceId,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(workspace_id: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            workspace_id: workspace_id.into(),
            event_type: event_type.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Outbound HTTP delivery target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout. Capped by the worker's request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subscribed event types; "*" matches every type
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl Endpoint {
    pub fn new(workspace_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            workspace_id: workspace_id.into(),
            name: None,
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            timeout_ms: None,
            enabled: true,
            events: vec!["*".to_string()],
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event_type)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_method() -> String {
    "POST".to_string()
}

/// Retry and backoff settings for a delivery task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1_000,
            max_interval_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Longest allowed retry interval: 30 days
    pub const MAX_INTERVAL_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

    /// Check the policy's bounds; the error names the offending field
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("multiplier must be a finite number of at least 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0 and 1".into());
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err("initial_interval_ms must not exceed max_interval_ms".into());
        }
        if self.max_interval_ms > Self::MAX_INTERVAL_MS {
            return Err(format!("max_interval_ms must not exceed {}", Self::MAX_INTERVAL_MS));
        }
        Ok(())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// One queued (event, endpoint) delivery unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    /// Number of completed delivery attempts
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl Task {
    pub fn new(event_id: EventId, endpoint_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            event_id,
            endpoint_id: endpoint_id.into(),
            attempts: 0,
            scheduled_at: Utc::now(),
        }
    }
}

/// Opaque proof of lease ownership
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task held by a worker for the duration of its lease
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task: Task,
    pub token: LeaseToken,
    pub lease_expires_at: DateTime<Utc>,
}

// ============================================================================
// Attempts
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Endpoint answered with a success status
    Succeeded,
    /// Endpoint answered with a non-success status
    Failed,
    /// No response: connection error or timeout
    Errored,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "errored" => Ok(AttemptStatus::Errored),
            other => Err(format!("unknown attempt status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// One recorded delivery try. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub id: AttemptId,
    pub task_id: TaskId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub status_code: Option<u16>,
    pub request: AttemptRequest,
    pub response: Option<AttemptResponse>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Set on the final attempt of a task that ran out of retries
    pub exhausted: bool,
    pub created_at: DateTime<Utc>,
}
