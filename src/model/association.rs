//! # Associations
//!
//! The tracked link between one secret in the source store and one destination.

use crate::model::{DestinationId, Granularity, SyncStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a secret in the versioned source store
///
/// Identity is `(mount_accessor, secret_path)`; the remaining fields only feed
/// name templates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub mount_accessor: String,
    pub secret_path: String,
    /// Mount path, e.g. `kv/`
    #[serde(default)]
    pub mount_path: String,
    #[serde(default = "default_namespace_id")]
    pub namespace_id: String,
    /// Namespace path, empty for the root namespace
    #[serde(default)]
    pub namespace_path: String,
}

fn default_namespace_id() -> String {
    "root".to_string()
}

impl SecretRef {
    pub fn new(mount_accessor: impl Into<String>, secret_path: impl Into<String>) -> Self {
        Self {
            mount_accessor: mount_accessor.into(),
            secret_path: secret_path.into(),
            mount_path: String::new(),
            namespace_id: default_namespace_id(),
            namespace_path: String::new(),
        }
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, id: impl Into<String>, path: impl Into<String>) -> Self {
        self.namespace_id = id.into();
        self.namespace_path = path.into();
        self
    }

    /// Whether `other` points at the same secret
    #[must_use]
    pub fn same_secret(&self, mount_accessor: &str, secret_path: &str) -> bool {
        self.mount_accessor == mount_accessor && self.secret_path == secret_path
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mount_accessor, self.secret_path)
    }
}

/// Association identity: `(destination, mount_accessor, secret_path)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssociationKey {
    pub destination: DestinationId,
    pub mount_accessor: String,
    pub secret_path: String,
}

impl AssociationKey {
    #[must_use]
    pub fn new(destination: DestinationId, secret: &SecretRef) -> Self {
        Self {
            destination,
            mount_accessor: secret.mount_accessor.clone(),
            secret_path: secret.secret_path.clone(),
        }
    }
}

impl fmt::Display for AssociationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.destination, self.mount_accessor, self.secret_path
        )
    }
}

/// Template and granularity captured when external secrets were last (re)created
///
/// Later destination changes do not touch it; only a recreate adopts the
/// destination's current values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub template: String,
    pub granularity: Granularity,
}

/// One external secret written for an association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    /// Source key under `secret-key` granularity
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Rendered, sanitized external name
    pub name: String,
    pub status: SyncStatus,
    #[serde(default)]
    pub error_code: Option<String>,
    pub last_status_change: DateTime<Utc>,
    /// Digest of the payload last written successfully
    #[serde(default)]
    pub digest: Option<String>,
}

/// A tracked secret-to-destination link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub key: AssociationKey,
    pub secret: SecretRef,
    pub status: SyncStatus,
    /// Only populated on failure statuses
    #[serde(default)]
    pub error_code: Option<String>,
    pub last_status_change: DateTime<Utc>,
    pub template_version: TemplateSnapshot,
    /// Source generation last fully synced
    #[serde(default)]
    pub secret_version: Option<u64>,
    #[serde(default)]
    pub entries: Vec<EntryState>,
    /// Set once removal was requested; the record goes away after unsync succeeds
    #[serde(default)]
    pub pending_deletion: bool,
    /// Last manual request was an unsync; automatic triggers keep the
    /// destination empty until a manual sync or recreate
    #[serde(default)]
    pub unsync_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl Association {
    #[must_use]
    pub fn new(destination: DestinationId, secret: SecretRef, snapshot: TemplateSnapshot) -> Self {
        let now = Utc::now();
        Self {
            key: AssociationKey::new(destination, &secret),
            secret,
            status: SyncStatus::Unknown,
            error_code: None,
            last_status_change: now,
            template_version: snapshot,
            secret_version: None,
            entries: Vec::new(),
            pending_deletion: false,
            unsync_requested: false,
            created_at: now,
        }
    }

    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.template_version.granularity
    }

    /// Entry for the given source key (`None` under `secret-path`)
    #[must_use]
    pub fn entry(&self, secret_key: Option<&str>) -> Option<&EntryState> {
        self.entries
            .iter()
            .find(|entry| entry.secret_key.as_deref() == secret_key)
    }

    /// Whether anything is known to exist at the destination
    #[must_use]
    pub fn has_external_entries(&self) -> bool {
        !self.entries.is_empty()
    }
}
