//! # Destination Adapters
//!
//! Each destination type implements [`DestinationAdapter`]: unconditional
//! overwrite and idempotent delete of an external secret by name. Adapters
//! are selected by type tag through the [`AdapterRegistry`].
//!
//! Built-in adapters:
//! - `aws-sm`: AWS Secrets Manager
//! - `gcp-sm`: GCP Secret Manager (REST)
//! - `azure-kv`: Azure Key Vault (REST)
//! - `in-mem`: process-local map

use crate::error::DestinationError;
use crate::model::{DestinationType, RenderedSecret};
use async_trait::async_trait;

pub mod aws;
pub mod azure;
pub mod common;
pub mod gcp;
pub mod memory;
pub mod registry;
pub mod validation;

pub use memory::MemoryDestination;
pub use registry::{AdapterFactory, AdapterRegistry, SharedAdapter};

pub type AdapterResult<T> = Result<T, DestinationError>;

/// Write/delete capability for one configured destination
///
/// Implementations classify every failure into a [`DestinationError`]; the
/// retry controller decides what happens next.
#[async_trait]
pub trait DestinationAdapter: Send + Sync + std::fmt::Debug {
    fn destination_type(&self) -> DestinationType;

    /// Whether a whole key/value map can be stored as one structured secret
    fn supports_multi_value(&self) -> bool;

    /// Create or overwrite the external secret `name`
    async fn put(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()>;

    /// Delete the external secret `name`; a missing secret is not an error
    async fn delete(&self, name: &str) -> AdapterResult<()>;

    /// Mark `name` as managed by the sync engine
    ///
    /// Best-effort: callers log failures and carry on.
    async fn tag_synced_secret(&self, name: &str) -> AdapterResult<()>;
}
