//! Secrets Sync Library
//!
//! Reconciliation engine that mirrors secrets from a versioned key/value
//! store onto external secret managers and keeps them in sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use secrets_sync::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod model;
pub mod observability;
pub mod prelude;
pub mod provider;
pub mod runtime;
pub mod server;
pub mod source;
pub mod store;
pub mod template;
