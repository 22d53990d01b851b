//! # Association Status
//!
//! The status state machine every association moves through.
//!
//! ```text
//! UNKNOWN ──► PENDING ──► SYNCED | UNSYNCED | *_ERROR
//!                ▲  │
//!                └──┘ (re-stamped between retries)
//! SYNCED | UNSYNCED | *_ERROR ──► PENDING
//! ```

use crate::model::AssociationKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sync status of an association (and of each of its external entries)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// No operation has completed yet
    #[default]
    Unknown,
    /// An operation is queued or in flight
    Pending,
    /// The destination holds the current secret version
    Synced,
    /// The external secret has been removed
    Unsynced,
    /// Unexpected internal fault
    InternalVaultError,
    /// Bad destination configuration or permissions, not retried
    ClientSideError,
    /// Transient destination failure that outlived the retry budget
    ExternalServiceError,
}

impl SyncStatus {
    /// All statuses, in wire order
    pub const ALL: [SyncStatus; 7] = [
        SyncStatus::Unknown,
        SyncStatus::Pending,
        SyncStatus::Synced,
        SyncStatus::Unsynced,
        SyncStatus::InternalVaultError,
        SyncStatus::ClientSideError,
        SyncStatus::ExternalServiceError,
    ];

    /// Wire value
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "UNKNOWN",
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Unsynced => "UNSYNCED",
            SyncStatus::InternalVaultError => "INTERNAL_VAULT_ERROR",
            SyncStatus::ClientSideError => "CLIENT_SIDE_ERROR",
            SyncStatus::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Whether this is one of the three failure statuses
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SyncStatus::InternalVaultError
                | SyncStatus::ClientSideError
                | SyncStatus::ExternalServiceError
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    #[must_use]
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        match (self, next) {
            (SyncStatus::Pending, next) => next != SyncStatus::Unknown,
            (_, SyncStatus::Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status: {s}"))
    }
}

/// A recorded status transition, broadcast by the association store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub key: AssociationKey,
    pub from: SyncStatus,
    pub to: SyncStatus,
    pub error_code: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status_is_unknown() {
        assert_eq!(SyncStatus::default(), SyncStatus::Unknown);
    }

    #[test]
    fn test_unknown_only_moves_to_pending() {
        for next in SyncStatus::ALL {
            assert_eq!(
                SyncStatus::Unknown.can_transition_to(next),
                next == SyncStatus::Pending,
                "UNKNOWN -> {next}"
            );
        }
    }

    #[test]
    fn test_pending_resolves_to_any_outcome() {
        for next in SyncStatus::ALL {
            assert_eq!(
                SyncStatus::Pending.can_transition_to(next),
                next != SyncStatus::Unknown,
                "PENDING -> {next}"
            );
        }
    }

    #[test]
    fn test_settled_statuses_only_return_to_pending() {
        let settled = [
            SyncStatus::Synced,
            SyncStatus::Unsynced,
            SyncStatus::InternalVaultError,
            SyncStatus::ClientSideError,
            SyncStatus::ExternalServiceError,
        ];
        for from in settled {
            for next in SyncStatus::ALL {
                assert_eq!(
                    from.can_transition_to(next),
                    next == SyncStatus::Pending,
                    "{from} -> {next}"
                );
            }
        }
    }

    #[test]
    fn test_wire_values_round_trip() {
        for status in SyncStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("synced".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_failure_statuses() {
        let failures: Vec<_> = SyncStatus::ALL
            .into_iter()
            .filter(SyncStatus::is_failure)
            .collect();
        assert_eq!(
            failures,
            vec![
                SyncStatus::InternalVaultError,
                SyncStatus::ClientSideError,
                SyncStatus::ExternalServiceError
            ]
        );
    }
}
