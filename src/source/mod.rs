//! # Source Collaborators
//!
//! Boundary with the systems around the engine: the versioned secret store,
//! its change feed, the read-capability authorizer and the client counter.
//! In-memory implementations live in [`memory`].

use crate::error::SyncError;
use crate::model::{SecretData, SecretRef};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

pub mod memory;

pub use memory::{DistinctClientCounter, MemorySecretStore, StaticAuthorizer};

/// A change to one secret in the source store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEvent {
    pub mount_accessor: String,
    pub secret_path: String,
    /// Version written, or the last version before deletion
    pub version: u64,
    pub deleted: bool,
}

impl SecretEvent {
    pub fn updated(
        mount_accessor: impl Into<String>,
        secret_path: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            mount_accessor: mount_accessor.into(),
            secret_path: secret_path.into(),
            version,
            deleted: false,
        }
    }

    pub fn deleted(
        mount_accessor: impl Into<String>,
        secret_path: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            deleted: true,
            ..Self::updated(mount_accessor, secret_path, version)
        }
    }
}

impl fmt::Display for SecretEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.deleted { "deleted" } else { "updated" };
        write!(
            f,
            "{}/{} {} (v{})",
            self.mount_accessor, self.secret_path, action, self.version
        )
    }
}

/// Read access to the versioned secret store
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Current version of a secret, `None` once it is deleted
    async fn get_secret_version(
        &self,
        mount_accessor: &str,
        secret_path: &str,
    ) -> Result<Option<SecretData>>;
}

/// Stream of secret changes
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, SecretEvent>;
}

/// Policy check performed when associations are created or updated
#[async_trait]
pub trait ReadAuthorizer: Send + Sync {
    async fn check_read_capability(&self, principal: &str, secret: &SecretRef) -> Result<bool>;
}

/// Billing hook notified once per distinct synced secret
pub trait ClientCounter: Send + Sync {
    fn record_synced_secret(&self, secret: &SecretRef);
}

/// Proof that a principal may read one secret
///
/// Only [`authorize`] creates grants; the store refuses association writes
/// without a grant covering the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGrant {
    principal: String,
    mount_accessor: String,
    secret_path: String,
}

impl ReadGrant {
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    #[must_use]
    pub fn covers(&self, secret: &SecretRef) -> bool {
        secret.same_secret(&self.mount_accessor, &self.secret_path)
    }
}

/// Check the principal's read capability on a secret
pub async fn authorize(
    authorizer: &dyn ReadAuthorizer,
    principal: &str,
    secret: &SecretRef,
) -> Result<ReadGrant, SyncError> {
    let allowed = authorizer
        .check_read_capability(principal, secret)
        .await
        .map_err(SyncError::Source)?;
    if !allowed {
        return Err(SyncError::Authorization(secret.to_string()));
    }
    Ok(ReadGrant {
        principal: principal.to_string(),
        mount_accessor: secret.mount_accessor.clone(),
        secret_path: secret.secret_path.clone(),
    })
}
