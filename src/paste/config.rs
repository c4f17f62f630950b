//! Engine configuration.
//!
//! All tunables are resolved once at startup and are immutable for the
//! engine's lifetime. Values are resolved with a three-tier priority:
//!
//! 1. **Config file** - optional JSON file (`~/.smartpaste/config.json` by
//!    default), unknown keys ignored
//! 2. **Environment variable** - `SMARTPASTE_*` overrides
//! 3. **Default** - built-in value
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SMARTPASTE_LOCAL_TEMP_DIR` | /tmp | Root for local destination paths |
//! | `SMARTPASTE_REMOTE_TEMP_DIR` | /tmp | Root for remote destination paths |
//! | `SMARTPASTE_MAX_PAYLOAD_MB` | 100 | Size limit enforced at submit time |
//! | `SMARTPASTE_CONNECT_TIMEOUT` | 10s | SSH connection timeout in seconds |
//! | `SMARTPASTE_TRANSFER_TIMEOUT` | 60s | Per-upload timeout in seconds |
//! | `SMARTPASTE_PROBE_TIMEOUT` | 10s | Remote existence check timeout |
//! | `SMARTPASTE_MAX_ATTEMPTS` | 3 | Processing attempts per job |
//! | `SMARTPASTE_RETRY_DELAY_MS` | 1000ms | Initial job retry delay |
//! | `SMARTPASTE_WORKER_COUNT` | 4 | Background worker tasks |
//! | `SMARTPASTE_PER_IDENTITY_LIMIT` | 2 | Concurrent connections per remote |
//! | `SMARTPASTE_ACQUIRE_TIMEOUT` | 15s | Pool checkout timeout in seconds |
//! | `SMARTPASTE_IDLE_TIMEOUT` | 60s | Idle connection lifetime in seconds |
//! | `SMARTPASTE_RESOLVE_CACHE_TTL_MS` | 1000ms | Terminal context cache TTL |
//! | `SMARTPASTE_DEDUP_CAPACITY` | 1024 | Max dedup cache entries |
//! | `SMARTPASTE_COMPRESSION` | true | Enable zlib compression on SSH |

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Maximum delay between job retry attempts, regardless of backoff growth.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Interval between idle-connection sweeps of the pool.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const DEFAULT_TEMP_DIR: &str = "/tmp";
const DEFAULT_MAX_PAYLOAD_MB: u64 = 100;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_PER_IDENTITY_LIMIT: usize = 2;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RESOLVE_CACHE_TTL_MS: u64 = 1000;
const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Configuration error raised during startup validation or file loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for paths handed out in a `Local` context.
    pub local_temp_dir: String,
    /// Root directory for paths handed out in a `Remote` context.
    pub remote_temp_dir: String,
    /// Payload size limit in bytes, enforced before a path is returned.
    pub max_payload_bytes: u64,
    /// SSH connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for a single upload in seconds.
    pub transfer_timeout_secs: u64,
    /// Timeout for a remote existence probe in seconds.
    pub probe_timeout_secs: u64,
    /// Total processing attempts per job before it aborts.
    pub max_attempts: u32,
    /// Initial delay before a failed job re-enters the queue, in ms.
    pub retry_delay_ms: u64,
    /// Number of background worker tasks.
    pub worker_count: usize,
    /// Concurrent connection cap per remote identity.
    pub per_identity_limit: usize,
    /// How long a worker waits for a pooled connection, in seconds.
    pub acquire_timeout_secs: u64,
    /// Idle connections older than this are closed by the sweeper, seconds.
    pub idle_timeout_secs: u64,
    /// TTL of cached terminal-context resolutions, in ms.
    pub resolve_cache_ttl_ms: u64,
    /// Maximum entries held by the dedup cache.
    pub dedup_capacity: usize,
    /// Whether to negotiate zlib compression on SSH sessions.
    pub compression: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_temp_dir: DEFAULT_TEMP_DIR.to_string(),
            remote_temp_dir: DEFAULT_TEMP_DIR.to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_MB * 1024 * 1024,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            worker_count: DEFAULT_WORKER_COUNT,
            per_identity_limit: DEFAULT_PER_IDENTITY_LIMIT,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            resolve_cache_ttl_ms: DEFAULT_RESOLVE_CACHE_TTL_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            compression: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, overlaid by the JSON file at `path`
    /// (when present), overlaid by `SMARTPASTE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str(&content)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables over defaults only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(dir) = env_string("SMARTPASTE_LOCAL_TEMP_DIR") {
            self.local_temp_dir = dir;
        }
        if let Some(dir) = env_string("SMARTPASTE_REMOTE_TEMP_DIR") {
            self.remote_temp_dir = dir;
        }
        if let Some(mb) = env_parse::<u64>("SMARTPASTE_MAX_PAYLOAD_MB") {
            self.max_payload_bytes = mb * 1024 * 1024;
        }
        if let Some(secs) = env_parse("SMARTPASTE_CONNECT_TIMEOUT") {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("SMARTPASTE_TRANSFER_TIMEOUT") {
            self.transfer_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("SMARTPASTE_PROBE_TIMEOUT") {
            self.probe_timeout_secs = secs;
        }
        if let Some(attempts) = env_parse("SMARTPASTE_MAX_ATTEMPTS") {
            self.max_attempts = attempts;
        }
        if let Some(ms) = env_parse("SMARTPASTE_RETRY_DELAY_MS") {
            self.retry_delay_ms = ms;
        }
        if let Some(count) = env_parse("SMARTPASTE_WORKER_COUNT") {
            self.worker_count = count;
        }
        if let Some(limit) = env_parse("SMARTPASTE_PER_IDENTITY_LIMIT") {
            self.per_identity_limit = limit;
        }
        if let Some(secs) = env_parse("SMARTPASTE_ACQUIRE_TIMEOUT") {
            self.acquire_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("SMARTPASTE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(ms) = env_parse("SMARTPASTE_RESOLVE_CACHE_TTL_MS") {
            self.resolve_cache_ttl_ms = ms;
        }
        if let Some(capacity) = env_parse("SMARTPASTE_DEDUP_CAPACITY") {
            self.dedup_capacity = capacity;
        }
        if let Some(value) = env_string("SMARTPASTE_COMPRESSION") {
            self.compression = value.eq_ignore_ascii_case("true") || value == "1";
        }
    }

    /// Validate value ranges. Runs once at startup; a failure here aborts
    /// engine construction before any path can be handed out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.per_identity_limit == 0 {
            return Err(ConfigError::Invalid(
                "per_identity_limit must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.local_temp_dir.is_empty() || self.remote_temp_dir.is_empty() {
            return Err(ConfigError::Invalid(
                "temp directories must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn resolve_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.resolve_cache_ttl_ms)
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = env::var(var).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable value for {}: {}", var, raw);
            None
        }
    }
}
