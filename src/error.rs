//! # Errors
//!
//! Error taxonomy for the engine.
//!
//! Only association and destination management fails synchronously
//! ([`SyncError`]). Destination failures ([`DestinationError`]) are recorded on
//! the association as one of the three failure statuses.

use crate::model::SyncStatus;
use crate::template::TemplateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors surfaced synchronously by the store and the engine's management API
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("caller lacks read capability on secret {0}")]
    Authorization(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid name template: {0}")]
    Template(#[from] TemplateError),

    #[error("invalid destination {destination}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("secret source error: {0}")]
    Source(#[source] anyhow::Error),

    #[error("failed to persist association store: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// How a destination failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    /// Bad configuration or permissions; retrying cannot help
    ClientSide,
    /// Transient failure of the external service
    ExternalService,
    /// Anything unexpected
    Internal,
}

impl FailureClass {
    /// Status recorded when a failure of this class is surfaced
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        match self {
            FailureClass::ClientSide => SyncStatus::ClientSideError,
            FailureClass::ExternalService => SyncStatus::ExternalServiceError,
            FailureClass::Internal => SyncStatus::InternalVaultError,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::ClientSide)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::ClientSide => "client_side",
            FailureClass::ExternalService => "external_service",
            FailureClass::Internal => "internal",
        }
    }

    /// Precedence when several entries of one association fail differently
    fn severity(self) -> u8 {
        match self {
            FailureClass::ClientSide => 2,
            FailureClass::Internal => 1,
            FailureClass::ExternalService => 0,
        }
    }

    /// The class that should represent the association overall
    #[must_use]
    pub fn worst(self, other: FailureClass) -> FailureClass {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-classified destination failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} error ({code}): {message}")]
pub struct DestinationError {
    pub class: FailureClass,
    /// Short machine-readable code, persisted as the association's `error_code`
    pub code: String,
    pub message: String,
}

impl DestinationError {
    pub fn new(class: FailureClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn client_side(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::ClientSide, code, message)
    }

    pub fn external(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::ExternalService, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::Internal, code, message)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.class.status()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_statuses() {
        assert_eq!(FailureClass::ClientSide.status(), SyncStatus::ClientSideError);
        assert_eq!(
            FailureClass::ExternalService.status(),
            SyncStatus::ExternalServiceError
        );
        assert_eq!(FailureClass::Internal.status(), SyncStatus::InternalVaultError);
    }

    #[test]
    fn test_only_client_side_is_final() {
        assert!(!FailureClass::ClientSide.is_retryable());
        assert!(FailureClass::ExternalService.is_retryable());
        assert!(FailureClass::Internal.is_retryable());
    }

    #[test]
    fn test_worst_prefers_client_side() {
        assert_eq!(
            FailureClass::ExternalService.worst(FailureClass::ClientSide),
            FailureClass::ClientSide
        );
        assert_eq!(
            FailureClass::Internal.worst(FailureClass::ExternalService),
            FailureClass::Internal
        );
    }

    #[test]
    fn test_destination_error_display() {
        let err = DestinationError::external("http_503", "service unavailable");
        assert_eq!(
            err.to_string(),
            "external_service error (http_503): service unavailable"
        );
    }
}
