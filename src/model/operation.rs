//! # Sync Operations
//!
//! Ephemeral units of work. Nothing here is persisted; pending work is
//! re-derived from association status after a restart.

use crate::model::AssociationKey;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// What an operation does at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Write the current secret version
    Sync,
    /// Remove every external entry
    Unsync,
    /// Unsync the old names, then sync under the destination's current template
    Recreate,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Sync => "sync",
            OperationKind::Unsync => "unsync",
            OperationKind::Recreate => "recreate",
        }
    }

    /// Kind that survives when `next` arrives while `self` is still queued
    ///
    /// The newer request wins, except that a queued recreate already performs a sync.
    #[must_use]
    pub fn coalesce(self, next: OperationKind) -> OperationKind {
        match (self, next) {
            (OperationKind::Recreate, OperationKind::Sync) => OperationKind::Recreate,
            (_, next) => next,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Change feed event
    Event,
    /// Reconciliation scanner repair
    Reconciliation,
    /// Pending work found at startup
    Recovery,
    /// Direct engine call or management request
    Manual,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Event => "event",
            TriggerSource::Reconciliation => "reconciliation",
            TriggerSource::Recovery => "recovery",
            TriggerSource::Manual => "manual",
        }
    }
}

/// A unit of work against one association
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: Uuid,
    pub key: AssociationKey,
    pub kind: OperationKind,
    pub trigger: TriggerSource,
    /// Adapter attempts made so far
    pub attempt_count: u32,
    /// Earliest time the next attempt may run
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    #[must_use]
    pub fn new(key: AssociationKey, kind: OperationKind, trigger: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            trigger,
            attempt_count: 0,
            next_retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_request_wins() {
        assert_eq!(
            OperationKind::Sync.coalesce(OperationKind::Unsync),
            OperationKind::Unsync
        );
        assert_eq!(
            OperationKind::Unsync.coalesce(OperationKind::Sync),
            OperationKind::Sync
        );
        assert_eq!(
            OperationKind::Sync.coalesce(OperationKind::Recreate),
            OperationKind::Recreate
        );
    }

    #[test]
    fn test_recreate_absorbs_sync() {
        assert_eq!(
            OperationKind::Recreate.coalesce(OperationKind::Sync),
            OperationKind::Recreate
        );
        assert_eq!(
            OperationKind::Recreate.coalesce(OperationKind::Unsync),
            OperationKind::Unsync
        );
    }
}
