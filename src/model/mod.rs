//! # Model
//!
//! Data shapes shared by every layer of the engine.
//!
//! - `status`: association status enum and its state machine
//! - `destination`: destination identity, type tag and granularity
//! - `association`: secret references, association records and their per-entry state
//! - `operation`: transient sync operations
//! - `secret`: secret data read from the source and rendered payloads

pub mod association;
pub mod destination;
pub mod operation;
pub mod secret;
pub mod status;

pub use association::{Association, AssociationKey, EntryState, SecretRef, TemplateSnapshot};
pub use destination::{Destination, DestinationId, DestinationType, DestinationUpdate, Granularity};
pub use operation::{OperationKind, SyncOperation, TriggerSource};
pub use secret::{RenderedSecret, SecretData};
pub use status::{StatusChange, SyncStatus};
