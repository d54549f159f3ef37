//! Relay configuration
//!
//! Loaded from an optional TOML file, then overridden by `RELAY_*`
//! environment variables, then validated. Every section has defaults, so
//! an empty file (or no file) yields a runnable configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_common::{ResponseOverride, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Upper bound on `worker.lease_duration_ms`
pub const MAX_LEASE_DURATION_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub proxy: ProxyConfig,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://relay.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Maximum inbound body size in bytes
    pub max_request_body_size: usize,
    pub router_refresh_interval_ms: u64,
    /// Buffer size for sources that ingest asynchronously
    pub staging_capacity: usize,
    /// Response returned after admission when the source has no override
    pub response: ResponseOverride,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_request_body_size: 1024 * 1024,
            router_refresh_interval_ms: 1_000,
            staging_capacity: 1024,
            response: ResponseOverride {
                code: 200,
                content_type: "application/json".to_string(),
                body: r#"{"message":"OK"}"#.to_string(),
            },
        }
    }
}

impl ProxyConfig {
    pub fn router_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.router_refresh_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Number of independent lease loops
    pub concurrency: usize,
    pub batch_size: usize,
    pub lease_duration_ms: u64,
    pub poll_interval_ms: u64,
    /// Upper bound for a single delivery request. Must be below the lease duration.
    pub request_timeout_ms: u64,
    pub attempt_write_retries: u32,
    pub shutdown_timeout_ms: u64,
    /// Applied to endpoints without their own policy
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 4,
            batch_size: 10,
            lease_duration_ms: 60_000,
            poll_interval_ms: 1_000,
            request_timeout_ms: 10_000,
            attempt_write_retries: 3,
            shutdown_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exporter address; disabled when unset
    pub listen: Option<SocketAddr>,
}

// ============================================================================
// Loading
// ============================================================================

impl RelayConfig {
    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `RELAY_*` overrides using the given variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("RELAY_LOG_FORMAT") {
            self.log.format = match v.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => return Err(env_error("RELAY_LOG_FORMAT", v)),
            };
        }
        if let Some(v) = lookup("RELAY_DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("RELAY_PROXY_LISTEN") {
            self.proxy.listen = parse_env("RELAY_PROXY_LISTEN", v)?;
        }
        if let Some(v) = lookup("RELAY_PROXY_MAX_REQUEST_BODY_SIZE") {
            self.proxy.max_request_body_size = parse_env("RELAY_PROXY_MAX_REQUEST_BODY_SIZE", v)?;
        }
        if let Some(v) = lookup("RELAY_WORKER_ENABLED") {
            self.worker.enabled = parse_env("RELAY_WORKER_ENABLED", v)?;
        }
        if let Some(v) = lookup("RELAY_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_env("RELAY_WORKER_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("RELAY_METRICS_LISTEN") {
            self.metrics.listen = Some(parse_env("RELAY_METRICS_LISTEN", v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let proxy = &self.proxy;
        if proxy.max_request_body_size == 0 {
            return Err(invalid("proxy.max_request_body_size must be greater than 0"));
        }
        if proxy.router_refresh_interval_ms == 0 {
            return Err(invalid("proxy.router_refresh_interval_ms must be greater than 0"));
        }
        if proxy.staging_capacity == 0 {
            return Err(invalid("proxy.staging_capacity must be greater than 0"));
        }
        if !(100..=599).contains(&proxy.response.code) {
            return Err(invalid("proxy.response.code must be a valid HTTP status"));
        }

        let worker = &self.worker;
        if worker.concurrency == 0 {
            return Err(invalid("worker.concurrency must be greater than 0"));
        }
        if worker.batch_size == 0 {
            return Err(invalid("worker.batch_size must be greater than 0"));
        }
        if worker.request_timeout_ms >= worker.lease_duration_ms {
            return Err(invalid("worker.request_timeout_ms must be less than worker.lease_duration_ms"));
        }

        if worker.lease_duration_ms > MAX_LEASE_DURATION_MS {
            return Err(invalid("worker.lease_duration_ms must not exceed 24 hours"));
        }
        worker
            .retry
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("worker.retry.{}", reason)))?;

        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

fn env_error(key: &str, value: String) -> ConfigError {
    ConfigError::Env {
        key: key.to_string(),
        value,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
    value.parse().map_err(|_| env_error(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.proxy.response.code, 200);
        assert_eq!(config.proxy.router_refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.worker.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[log]
format = "json"

[proxy]
listen = "127.0.0.1:9000"
max_request_body_size = 2048

[proxy.response]
code = 202
content_type = "text/plain"
body = "accepted"

[worker]
concurrency = 8
lease_duration_ms = 30000
request_timeout_ms = 5000

[worker.retry]
max_attempts = 5
initial_interval_ms = 500
max_interval_ms = 10000
multiplier = 3.0
jitter = 0.0
"#
        )
        .unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.proxy.listen.port(), 9000);
        assert_eq!(config.proxy.max_request_body_size, 2048);
        assert_eq!(config.proxy.response.code, 202);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.retry.max_attempts, 5);
        // untouched sections keep their defaults
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = RelayConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let result = RelayConfig::from_toml("[log]\nformat = \"xml\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_LOG_FORMAT", "JSON"),
            ("RELAY_DATABASE_URL", "sqlite::memory:"),
            ("RELAY_PROXY_MAX_REQUEST_BODY_SIZE", "512"),
            ("RELAY_WORKER_ENABLED", "false"),
            ("RELAY_METRICS_LISTEN", "127.0.0.1:9100"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.proxy.max_request_body_size, 512);
        assert!(!config.worker.enabled);
        assert_eq!(config.metrics.listen, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = RelayConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "RELAY_WORKER_CONCURRENCY").then(|| "many".to_string())
        });
        match result {
            Err(ConfigError::Env { key, value }) => {
                assert_eq!(key, "RELAY_WORKER_CONCURRENCY");
                assert_eq!(value, "many");
            }
            other => panic!("expected env error, got {:?}", other),
        }
    }

    #[test]
    fn test_request_timeout_must_be_below_lease() {
        let mut config = RelayConfig::default();
        config.worker.request_timeout_ms = config.worker.lease_duration_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retry_policy_validation() {
        let mut config = RelayConfig::default();
        config.worker.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.worker.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.worker.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.worker.retry.initial_interval_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        let mut config = RelayConfig::default();
        config.worker.retry.initial_interval_ms = 10u64.pow(16);
        config.worker.retry.max_interval_ms = 10u64.pow(16);
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.starts_with("worker.retry.max_interval_ms")),
            other => panic!("expected invalid config, got {:?}", other),
        }

        let mut config = RelayConfig::default();
        config.worker.lease_duration_ms = MAX_LEASE_DURATION_MS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = RelayConfig::default();
        config.proxy.max_request_body_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.worker.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.proxy.response.code = 1000;
        assert!(config.validate().is_err());
    }
}
