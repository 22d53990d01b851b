//! # Configuration
//!
//! Engine settings loaded from environment variables or a YAML file.
//!
//! - `sync`: `SyncConfig` and the policies derived from it

pub mod sync;

pub use sync::SyncConfig;
