//! vecmirror Configuration
//!
//! This module provides configuration structures for the replication
//! front door, the write log store, and the replay workers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wal::Instance;

/// Main vecmirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VecMirrorConfig {
    /// The two database instances
    pub instances: InstancesConfig,

    /// Write log store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Replay worker configuration
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Capture filter configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Retention configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Instance health probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Operator API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Forwarding front door configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Instance endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// Base URL of the primary instance
    pub primary_url: String,

    /// Base URL of the replica instance
    pub replica_url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Tenant used for collection lookups
    #[serde(default = "default_tenant")]
    pub tenant: String,

    /// Database used for collection lookups
    #[serde(default = "default_database")]
    pub database: String,
}

/// Write log store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file holding the write log and collection mappings
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Replay worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Enable replay workers
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of long-lived replay workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Entries claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Parallel replay requests per worker
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Failed attempts before an entry becomes terminally failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Sleep between cycles when nothing is pending, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Claim lease length in seconds
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Window after capture in which a 404 on a read-style replay is skipped, in seconds
    #[serde(default = "default_benign_race_secs")]
    pub benign_race_secs: u64,
}

/// Capture filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Also log read-style POSTs (query, get, count)
    #[serde(default)]
    pub capture_read_operations: bool,

    /// Attempts at appending an accepted write before giving up on it
    #[serde(default = "default_append_attempts")]
    pub append_attempts: u32,

    /// First delay between append attempts in milliseconds
    #[serde(default = "default_append_backoff_initial_ms")]
    pub append_backoff_initial_ms: u64,

    /// Append retry delay cap in milliseconds
    #[serde(default = "default_append_backoff_max_ms")]
    pub append_backoff_max_ms: u64,
}

/// Upper bound on instance calls made for one entry before its outcome
/// is recorded (origin lookup, mirror create, the replay, target check)
pub const INSTANCE_CALLS_PER_REPLAY: u64 = 4;

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Enable the periodic retention task
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between retention runs in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    /// Age after which synced entries are deleted, in hours
    #[serde(default = "default_synced_retention_hours")]
    pub synced_retention_hours: u64,

    /// Age after which failed entries are deleted, in hours (0 = keep forever)
    #[serde(default = "default_failed_retention_hours")]
    pub failed_retention_hours: u64,
}

/// Instance health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failed heartbeats before an instance is marked down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// Operator API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Forwarding front door configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Enable the forwarding front door
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Front door bind address
    #[serde(default = "default_proxy_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_tenant() -> String {
    "default_tenant".to_string()
}

fn default_database() -> String {
    "default_database".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/vecmirror/write_log.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lease_secs() -> u64 {
    120
}

fn default_append_attempts() -> u32 {
    5
}

fn default_append_backoff_initial_ms() -> u64 {
    50
}

fn default_append_backoff_max_ms() -> u64 {
    1_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_benign_race_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    3_600
}

fn default_synced_retention_hours() -> u64 {
    24
}

fn default_failed_retention_hours() -> u64 {
    168
}

fn default_health_interval_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_proxy_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            benign_race_secs: default_benign_race_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval_secs(),
            synced_retention_hours: default_synced_retention_hours(),
            failed_retention_hours: default_failed_retention_hours(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_proxy_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl InstancesConfig {
    /// Base URL for an instance, without a trailing slash
    pub fn url(&self, instance: Instance) -> &str {
        let url = match instance {
            Instance::Primary => &self.primary_url,
            Instance::Replica => &self.replica_url,
        };
        url.trim_end_matches('/')
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_read_operations: false,
            append_attempts: default_append_attempts(),
            append_backoff_initial_ms: default_append_backoff_initial_ms(),
            append_backoff_max_ms: default_append_backoff_max_ms(),
        }
    }
}

impl ReplayConfig {
    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get claim lease as Duration
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Get benign race window as Duration
    pub fn benign_race_window(&self) -> Duration {
        Duration::from_secs(self.benign_race_secs)
    }
}

impl VecMirrorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: VecMirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        for (name, url) in [
            ("instances.primary_url", &self.instances.primary_url),
            ("instances.replica_url", &self.instances.replica_url),
        ] {
            if url.is_empty() {
                return Err(crate::Error::Config(format!("{} cannot be empty", name)));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(crate::Error::Config(format!(
                    "{} must be an http(s) URL, got {}",
                    name, url
                )));
            }
        }

        if self.instances.url(Instance::Primary) == self.instances.url(Instance::Replica) {
            return Err(crate::Error::Config(
                "primary and replica must be different instances".into(),
            ));
        }

        if self.replay.max_retries == 0 {
            return Err(crate::Error::Config("replay.max_retries must be at least 1".into()));
        }

        if self.replay.workers == 0 || self.replay.batch_size == 0 || self.replay.concurrency == 0 {
            return Err(crate::Error::Config(
                "replay.workers, replay.batch_size and replay.concurrency must be positive".into(),
            ));
        }

        // Each entry's lease is renewed when its replay starts and must outlast it
        let replay_ms = INSTANCE_CALLS_PER_REPLAY.saturating_mul(self.instances.request_timeout_ms);
        if self.replay.lease_secs.saturating_mul(1_000) < replay_ms {
            return Err(crate::Error::Config(format!(
                "replay.lease_secs must be at least {} s ({} instance calls at instances.request_timeout_ms)",
                replay_ms.div_ceil(1_000),
                INSTANCE_CALLS_PER_REPLAY
            )));
        }

        if self.capture.append_attempts == 0 {
            return Err(crate::Error::Config("capture.append_attempts must be at least 1".into()));
        }

        if self.replay.backoff_initial_ms > self.replay.backoff_max_ms {
            return Err(crate::Error::Config(
                "replay.backoff_initial_ms cannot exceed replay.backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get heartbeat interval as Duration
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    /// Get retention interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }

    /// Template written by `vecmirror init`
    pub fn template() -> String {
        r#"[instances]
primary_url = "http://localhost:8001"
replica_url = "http://localhost:8002"
request_timeout_ms = 30000

[store]
path = "/var/lib/vecmirror/write_log.db"

[replay]
workers = 1
batch_size = 50
concurrency = 4
max_retries = 3
lease_secs = 120
backoff_initial_ms = 1000
backoff_max_ms = 60000

[capture]
capture_read_operations = false
append_attempts = 5

[cleanup]
interval_secs = 3600
synced_retention_hours = 24
failed_retention_hours = 168

[api]
bind_address = "0.0.0.0:8090"

[proxy]
bind_address = "0.0.0.0:8000"

[logging]
level = "info"
format = "pretty"
"#
        .to_string()
    }
}
