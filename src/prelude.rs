//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use secrets_sync::prelude::*;
//! ```

// Model types - most commonly used
pub use crate::model::{
    Association, AssociationKey, Destination, DestinationId, DestinationType, DestinationUpdate,
    Granularity, OperationKind, SecretRef, StatusChange, SyncStatus,
};

// Engine
pub use crate::controller::engine::{AssociationRequest, Collaborators, SyncEngine};
pub use crate::controller::scanner::ScanReport;

// Traits - needed for implementing destinations and collaborators
pub use crate::provider::{AdapterFactory, AdapterRegistry, DestinationAdapter};
pub use crate::source::{ChangeFeed, ClientCounter, ReadAuthorizer, SecretEvent, SecretSource};

pub use crate::config::SyncConfig;
pub use crate::error::{DestinationError, FailureClass, SyncError};
pub use crate::store::AssociationStore;
