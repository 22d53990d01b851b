//! # Sync Configuration
//!
//! Engine-level settings. Every value has a default in [`crate::constants`] and
//! can be overridden from the environment or from a YAML file.

use crate::constants::*;
use crate::controller::retry::RetryPolicy;
use crate::controller::scanner::ScannerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
///
/// All settings have sensible defaults; a YAML file may set any subset of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SyncConfig {
    /// Number of dispatcher workers processing the operation queue
    pub worker_count: usize,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_base_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_cap_ms: u64,
    /// Jitter added to each delay, as a fraction of the nominal delay
    pub backoff_jitter_ratio: f64,
    /// Attempts for transient destination errors before surfacing EXTERNAL_SERVICE_ERROR
    pub max_external_attempts: u32,
    /// Attempts for unexpected errors before surfacing INTERNAL_VAULT_ERROR
    pub max_internal_attempts: u32,
    /// Reconciliation scan period (seconds)
    pub scan_interval_secs: u64,
    /// Age after which a PENDING association is considered stuck (seconds)
    pub pending_grace_secs: u64,
    /// Concurrent scanner operations allowed per destination
    pub scan_concurrency_per_destination: usize,
    /// How long shutdown waits for in-flight operations (seconds)
    pub shutdown_grace_secs: u64,
    /// Association store snapshot file; in-memory only when unset
    ///
    /// Only for embedders with a persistent secret source; the standalone
    /// process refuses it.
    pub store_path: Option<PathBuf>,
    /// Port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// Start the metrics/probe server
    pub enable_metrics: bool,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE), used when RUST_LOG is unset
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            backoff_jitter_ratio: DEFAULT_BACKOFF_JITTER_RATIO,
            max_external_attempts: DEFAULT_MAX_EXTERNAL_ATTEMPTS,
            max_internal_attempts: DEFAULT_MAX_INTERNAL_ATTEMPTS,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            pending_grace_secs: DEFAULT_PENDING_GRACE_SECS,
            scan_concurrency_per_destination: DEFAULT_SCAN_CONCURRENCY_PER_DESTINATION,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            store_path: None,
            metrics_port: DEFAULT_METRICS_PORT,
            enable_metrics: true,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a YAML file, then apply environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    fn with_env_overrides(self) -> Self {
        Self {
            worker_count: env_var_or_default("SYNC_WORKER_COUNT", self.worker_count),
            backoff_base_ms: env_var_or_default("SYNC_BACKOFF_BASE_MS", self.backoff_base_ms),
            backoff_cap_ms: env_var_or_default("SYNC_BACKOFF_CAP_MS", self.backoff_cap_ms),
            backoff_jitter_ratio: env_var_or_default(
                "SYNC_BACKOFF_JITTER_RATIO",
                self.backoff_jitter_ratio,
            ),
            max_external_attempts: env_var_or_default(
                "SYNC_MAX_EXTERNAL_ATTEMPTS",
                self.max_external_attempts,
            ),
            max_internal_attempts: env_var_or_default(
                "SYNC_MAX_INTERNAL_ATTEMPTS",
                self.max_internal_attempts,
            ),
            scan_interval_secs: env_var_or_default(
                "SYNC_SCAN_INTERVAL_SECS",
                self.scan_interval_secs,
            ),
            pending_grace_secs: env_var_or_default(
                "SYNC_PENDING_GRACE_SECS",
                self.pending_grace_secs,
            ),
            scan_concurrency_per_destination: env_var_or_default(
                "SYNC_SCAN_CONCURRENCY",
                self.scan_concurrency_per_destination,
            ),
            shutdown_grace_secs: env_var_or_default(
                "SYNC_SHUTDOWN_GRACE_SECS",
                self.shutdown_grace_secs,
            ),
            store_path: std::env::var("SYNC_STORE_PATH")
                .ok()
                .map(PathBuf::from)
                .or(self.store_path),
            metrics_port: env_var_or_default("METRICS_PORT", self.metrics_port),
            enable_metrics: env_var_or_default_bool("ENABLE_METRICS", self.enable_metrics),
            log_level: env_var_or_default_str("LOG_LEVEL", &self.log_level),
            log_format: env_var_or_default_str("LOG_FORMAT", &self.log_format),
        }
    }

    /// Retry policy derived from the backoff settings
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            jitter_ratio: self.backoff_jitter_ratio.clamp(0.0, 1.0),
            max_external_attempts: self.max_external_attempts.max(1),
            max_internal_attempts: self.max_internal_attempts.max(1),
        }
    }

    /// Scanner settings derived from the scan settings
    #[must_use]
    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            period: Duration::from_secs(self.scan_interval_secs.max(1)),
            pending_grace: Duration::from_secs(self.pending_grace_secs),
            max_concurrent_per_destination: self.scan_concurrency_per_destination.max(1),
        }
    }

    /// Get shutdown grace duration
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
