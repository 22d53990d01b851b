//! # Constants
//!
//! Shared constants used throughout the engine.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default number of dispatcher workers
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;

/// Default jitter, as a fraction of the nominal delay
pub const DEFAULT_BACKOFF_JITTER_RATIO: f64 = 0.2;

/// Attempts allowed for transient destination failures (first call included)
pub const DEFAULT_MAX_EXTERNAL_ATTEMPTS: u32 = 6;

/// Attempts allowed for unexpected internal failures (first call included)
pub const DEFAULT_MAX_INTERNAL_ATTEMPTS: u32 = 3;

/// Default reconciliation scan period (seconds)
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;

/// How long an association may sit in PENDING before the scanner takes over (seconds)
pub const DEFAULT_PENDING_GRACE_SECS: u64 = 120;

/// Maximum concurrent scanner operations per destination
pub const DEFAULT_SCAN_CONCURRENCY_PER_DESTINATION: usize = 4;

/// Grace period for in-flight operations on shutdown (seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Capacity of the association status broadcast channel
pub const STATUS_CHANNEL_CAPACITY: usize = 1024;

/// Marker tag attached to every secret written by the engine
pub const SYNCED_SECRET_TAG_KEY: &str = "hashicorp:vault";

/// Value of the marker tag
pub const SYNCED_SECRET_TAG_VALUE: &str = "";

/// Default name template for `secret-path` granularity
pub const DEFAULT_SECRET_PATH_TEMPLATE: &str = "vault/{{ .MountAccessor }}/{{ .SecretPath }}";

/// Default name template for `secret-key` granularity
pub const DEFAULT_SECRET_KEY_TEMPLATE: &str =
    "vault/{{ .MountAccessor }}/{{ .SecretPath }}_{{ .SecretKey }}";

/// Principal granted read access to every secret by the standalone binary
pub const DEFAULT_ADMIN_PRINCIPAL: &str = "root";
