//! Engine configuration
//!
//! The host plugin normally hands the engine a ready-made [`EngineConfig`]
//! (it deserializes from JSON/TOML with per-field defaults). The runner binary
//! builds one from `STORESYNC_*` environment variables instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    /// Fraction of the delay applied as +/- jitter
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 60_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stable across restarts so the remote can re-deliver unacknowledged commands
    pub server_identity: String,
    pub auth_token: String,
    /// `ws://` or `wss://` endpoint of the remote service
    pub endpoint: String,
    pub database_path: String,
    pub max_execution_retries: u32,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub handshake_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub worker_count: usize,
    pub execution_timeout_ms: u64,
    /// Linear step between execution attempts
    pub execution_retry_delay_ms: u64,
    pub ack_resend_interval_ms: u64,
    pub retention_window_secs: u64,
    pub purge_interval_secs: u64,
    pub rescan_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_identity: String::new(),
            auth_token: String::new(),
            endpoint: "ws://localhost:8765/v1/queue".to_string(),
            database_path: "storesync.db".to_string(),
            max_execution_retries: 5,
            heartbeat_interval_ms: 15_000,
            max_missed_heartbeats: 3,
            handshake_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
            worker_count: 4,
            execution_timeout_ms: 30_000,
            execution_retry_delay_ms: 2_000,
            ack_resend_interval_ms: 10_000,
            retention_window_secs: 86_400,
            purge_interval_secs: 3_600,
            rescan_interval_ms: 5_000,
            drain_timeout_ms: 10_000,
        }
    }
}

/// Read a variable and parse it, falling back to the default when missing or unparseable.
fn env_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
                default
            }
        },
        None => default,
    }
}

impl EngineConfig {
    /// Load from `STORESYNC_*` environment variables with defaults for missing values.
    ///
    /// # Environment Variables
    ///
    /// - `STORESYNC_SERVER_IDENTITY`, `STORESYNC_AUTH_TOKEN` - credentials (required)
    /// - `STORESYNC_ENDPOINT` - remote WebSocket endpoint
    /// - `STORESYNC_DATABASE_PATH` - SQLite file (default: storesync.db)
    /// - `STORESYNC_MAX_EXECUTION_RETRIES` (default: 5)
    /// - `STORESYNC_HEARTBEAT_INTERVAL_MS` (default: 15000)
    /// - `STORESYNC_MAX_MISSED_HEARTBEATS` (default: 3)
    /// - `STORESYNC_HANDSHAKE_TIMEOUT_MS` (default: 10000)
    /// - `STORESYNC_BACKOFF_BASE_MS`, `STORESYNC_BACKOFF_FACTOR`,
    ///   `STORESYNC_BACKOFF_MAX_MS`, `STORESYNC_BACKOFF_JITTER`
    /// - `STORESYNC_WORKER_COUNT` (default: 4)
    /// - `STORESYNC_EXECUTION_TIMEOUT_MS` (default: 30000)
    /// - `STORESYNC_EXECUTION_RETRY_DELAY_MS` (default: 2000)
    /// - `STORESYNC_ACK_RESEND_INTERVAL_MS` (default: 10000)
    /// - `STORESYNC_RETENTION_WINDOW_SECS` (default: 86400)
    /// - `STORESYNC_PURGE_INTERVAL_SECS` (default: 3600)
    /// - `STORESYNC_RESCAN_INTERVAL_MS` (default: 5000)
    /// - `STORESYNC_DRAIN_TIMEOUT_MS` (default: 10000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let backoff_defaults = BackoffConfig::default();

        Self {
            server_identity: lookup("STORESYNC_SERVER_IDENTITY").unwrap_or_default(),
            auth_token: lookup("STORESYNC_AUTH_TOKEN").unwrap_or_default(),
            endpoint: lookup("STORESYNC_ENDPOINT").unwrap_or(defaults.endpoint),
            database_path: lookup("STORESYNC_DATABASE_PATH").unwrap_or(defaults.database_path),
            max_execution_retries: env_or(
                &lookup,
                "STORESYNC_MAX_EXECUTION_RETRIES",
                defaults.max_execution_retries,
            ),
            heartbeat_interval_ms: env_or(
                &lookup,
                "STORESYNC_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            max_missed_heartbeats: env_or(
                &lookup,
                "STORESYNC_MAX_MISSED_HEARTBEATS",
                defaults.max_missed_heartbeats,
            ),
            handshake_timeout_ms: env_or(
                &lookup,
                "STORESYNC_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout_ms,
            ),
            backoff: BackoffConfig {
                base_ms: env_or(&lookup, "STORESYNC_BACKOFF_BASE_MS", backoff_defaults.base_ms),
                factor: env_or(&lookup, "STORESYNC_BACKOFF_FACTOR", backoff_defaults.factor),
                max_ms: env_or(&lookup, "STORESYNC_BACKOFF_MAX_MS", backoff_defaults.max_ms),
                jitter: env_or(&lookup, "STORESYNC_BACKOFF_JITTER", backoff_defaults.jitter),
            },
            worker_count: env_or(&lookup, "STORESYNC_WORKER_COUNT", defaults.worker_count),
            execution_timeout_ms: env_or(
                &lookup,
                "STORESYNC_EXECUTION_TIMEOUT_MS",
                defaults.execution_timeout_ms,
            ),
            execution_retry_delay_ms: env_or(
                &lookup,
                "STORESYNC_EXECUTION_RETRY_DELAY_MS",
                defaults.execution_retry_delay_ms,
            ),
            ack_resend_interval_ms: env_or(
                &lookup,
                "STORESYNC_ACK_RESEND_INTERVAL_MS",
                defaults.ack_resend_interval_ms,
            ),
            retention_window_secs: env_or(
                &lookup,
                "STORESYNC_RETENTION_WINDOW_SECS",
                defaults.retention_window_secs,
            ),
            purge_interval_secs: env_or(
                &lookup,
                "STORESYNC_PURGE_INTERVAL_SECS",
                defaults.purge_interval_secs,
            ),
            rescan_interval_ms: env_or(
                &lookup,
                "STORESYNC_RESCAN_INTERVAL_MS",
                defaults.rescan_interval_ms,
            ),
            drain_timeout_ms: env_or(
                &lookup,
                "STORESYNC_DRAIN_TIMEOUT_MS",
                defaults.drain_timeout_ms,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.server_identity.trim().is_empty() {
            return Err(EngineError::config("server_identity cannot be empty"));
        }
        if self.auth_token.trim().is_empty() {
            return Err(EngineError::config("auth_token cannot be empty"));
        }

        let endpoint = url::Url::parse(&self.endpoint)
            .map_err(|e| EngineError::config(format!("endpoint '{}': {e}", self.endpoint)))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(EngineError::config(format!(
                "endpoint must use ws:// or wss://, got {}://",
                endpoint.scheme()
            )));
        }

        if self.worker_count == 0 {
            return Err(EngineError::config("worker_count must be at least 1"));
        }
        // Timers and timeouts; tokio intervals panic on a zero period
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("execution_timeout_ms", self.execution_timeout_ms),
            ("ack_resend_interval_ms", self.ack_resend_interval_ms),
            ("rescan_interval_ms", self.rescan_interval_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("purge_interval_secs", self.purge_interval_secs),
        ] {
            if value == 0 {
                return Err(EngineError::config(format!("{name} must be positive")));
            }
        }
        if self.max_missed_heartbeats == 0 {
            return Err(EngineError::config("max_missed_heartbeats must be at least 1"));
        }
        if self.backoff.factor < 1.0 {
            return Err(EngineError::config("backoff.factor must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(EngineError::config("backoff.jitter must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn execution_retry_delay(&self) -> Duration {
        Duration::from_millis(self.execution_retry_delay_ms)
    }

    pub fn ack_resend_interval(&self) -> Duration {
        Duration::from_millis(self.ack_resend_interval_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
