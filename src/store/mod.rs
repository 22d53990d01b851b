//! # Association Store
//!
//! Durable record of destinations and associations.
//!
//! The association map sits behind a reader/writer lock so lookups run
//! concurrently; each association has its own mutex so writers to different
//! associations never wait on each other. Every status transition is
//! validated against the state machine and broadcast to subscribers.
//!
//! With a snapshot path configured, each mutation queues a fresh snapshot for
//! the background writer (see [`snapshot`]) and [`AssociationStore::open`]
//! reloads it. Mutations never wait on, or fail because of, the file write.

pub mod snapshot;

use crate::constants::STATUS_CHANNEL_CAPACITY;
use crate::error::{Result, SyncError};
use crate::model::{
    Association, AssociationKey, Destination, DestinationId, DestinationUpdate, Granularity,
    OperationKind, SecretRef, StatusChange, SyncStatus, TemplateSnapshot,
};
use crate::source::ReadGrant;
use crate::template::validate_template;
use chrono::Utc;
use snapshot::{Snapshot, SnapshotWriter, SNAPSHOT_VERSION};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type Entry = Arc<Mutex<Association>>;

/// Store for destinations and associations
pub struct AssociationStore {
    destinations: RwLock<HashMap<DestinationId, Destination>>,
    associations: RwLock<HashMap<AssociationKey, Entry>>,
    events: broadcast::Sender<StatusChange>,
    writer: Option<SnapshotWriter>,
    /// Serializes snapshot submission so the newest state is queued last
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for AssociationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationStore")
            .field("snapshot_path", &self.snapshot_path())
            .finish_non_exhaustive()
    }
}

impl Default for AssociationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_entry(entry: &Entry) -> MutexGuard<'_, Association> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

impl AssociationStore {
    /// In-memory store without persistence
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            destinations: RwLock::new(HashMap::new()),
            associations: RwLock::new(HashMap::new()),
            events,
            writer: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Store persisted at `path`, loading the existing snapshot if there is one
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new();
        if let Some(snapshot) = snapshot::load(&path).map_err(SyncError::Persistence)? {
            info!(
                "Loaded association store snapshot from {}: {} destination(s), {} association(s)",
                path.display(),
                snapshot.destinations.len(),
                snapshot.associations.len()
            );
            store.destinations = RwLock::new(
                snapshot
                    .destinations
                    .into_iter()
                    .map(|destination| (destination.id.clone(), destination))
                    .collect(),
            );
            store.associations = RwLock::new(
                snapshot
                    .associations
                    .into_iter()
                    .map(|association| {
                        (association.key.clone(), Arc::new(Mutex::new(association)))
                    })
                    .collect(),
            );
        }
        store.writer = Some(SnapshotWriter::spawn(path).map_err(SyncError::Persistence)?);
        Ok(store)
    }

    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.writer.as_ref().map(SnapshotWriter::path)
    }

    /// Wait for queued snapshots to be written
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    // ------------------------------------------------------------------
    // Destinations
    // ------------------------------------------------------------------

    /// Add a destination
    ///
    /// The destination's template must be valid for its granularity.
    pub fn create_destination(&self, mut destination: Destination) -> Result<Destination> {
        validate_template(
            destination.effective_template(destination.granularity),
            destination.granularity,
        )?;
        {
            let mut destinations = self.write_destinations();
            if destinations.contains_key(&destination.id) {
                return Err(SyncError::Conflict(format!(
                    "destination {}",
                    destination.id
                )));
            }
            destination.deleting = false;
            destinations.insert(destination.id.clone(), destination.clone());
        }
        info!(destination = %destination.id, "Destination created");
        self.persist();
        Ok(destination)
    }

    /// Apply an update to a destination
    ///
    /// Template and granularity changes only affect associations created or
    /// recreated afterwards. `config_version` is bumped when the config or
    /// custom tags change.
    pub fn update_destination(
        &self,
        id: &DestinationId,
        update: DestinationUpdate,
    ) -> Result<Destination> {
        let updated = {
            let mut destinations = self.write_destinations();
            let current = destinations
                .get(id)
                .filter(|destination| !destination.deleting)
                .ok_or_else(|| SyncError::NotFound(format!("destination {id}")))?;

            let mut updated = current.clone();
            let mut bump = false;
            if let Some(config) = update.config {
                bump |= config != updated.config;
                updated.config = config;
            }
            if let Some(tags) = update.custom_tags {
                bump |= tags != updated.custom_tags;
                updated.custom_tags = tags;
            }
            if let Some(template) = update.secret_name_template {
                updated.secret_name_template = template;
            }
            if let Some(granularity) = update.granularity {
                updated.granularity = granularity;
            }
            validate_template(
                updated.effective_template(updated.granularity),
                updated.granularity,
            )?;
            if bump {
                updated.config_version += 1;
            }
            destinations.insert(id.clone(), updated.clone());
            updated
        };
        info!(
            destination = %id,
            config_version = updated.config_version,
            "Destination updated"
        );
        self.persist();
        Ok(updated)
    }

    #[must_use]
    pub fn get_destination(&self, id: &DestinationId) -> Option<Destination> {
        self.read_destinations().get(id).cloned()
    }

    /// All destinations, sorted by id
    #[must_use]
    pub fn list_destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<Destination> =
            self.read_destinations().values().cloned().collect();
        destinations.sort_by(|a, b| a.id.cmp(&b.id));
        destinations
    }

    /// Flag a destination for cascading deletion; new associations are refused
    pub fn mark_destination_deleting(&self, id: &DestinationId) -> Result<Destination> {
        let destination = {
            let mut destinations = self.write_destinations();
            let destination = destinations
                .get_mut(id)
                .ok_or_else(|| SyncError::NotFound(format!("destination {id}")))?;
            destination.deleting = true;
            destination.clone()
        };
        info!(destination = %id, "Destination marked for deletion");
        self.persist();
        Ok(destination)
    }

    /// Remove a destination once it has no associations left
    pub fn remove_destination(&self, id: &DestinationId) -> Result<Destination> {
        let remaining = self
            .read_associations()
            .keys()
            .filter(|key| &key.destination == id)
            .count();
        if remaining > 0 {
            return Err(SyncError::Conflict(format!(
                "destination {id} still has {remaining} association(s)"
            )));
        }
        let removed = self
            .write_destinations()
            .remove(id)
            .ok_or_else(|| SyncError::NotFound(format!("destination {id}")))?;
        info!(destination = %id, "Destination removed");
        self.persist();
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Create an association between a secret and a destination
    ///
    /// `granularity` overrides the destination's default. The association
    /// captures the destination's template at this point.
    pub fn create(
        &self,
        grant: &ReadGrant,
        destination: &DestinationId,
        secret: SecretRef,
        granularity: Option<Granularity>,
    ) -> Result<Association> {
        if !grant.covers(&secret) {
            return Err(SyncError::Authorization(secret.to_string()));
        }
        let target = self
            .get_destination(destination)
            .filter(|destination| !destination.deleting)
            .ok_or_else(|| SyncError::NotFound(format!("destination {destination}")))?;

        let granularity = granularity.unwrap_or(target.granularity);
        let template = target.effective_template(granularity).to_string();
        validate_template(&template, granularity)?;

        let association = Association::new(
            destination.clone(),
            secret,
            TemplateSnapshot {
                template,
                granularity,
            },
        );
        {
            let mut associations = self.write_associations();
            if associations.contains_key(&association.key) {
                return Err(SyncError::Conflict(format!(
                    "association {}",
                    association.key
                )));
            }
            associations.insert(
                association.key.clone(),
                Arc::new(Mutex::new(association.clone())),
            );
        }
        info!(
            association = %association.key,
            principal = grant.principal(),
            granularity = %granularity,
            "Association created"
        );
        self.persist();
        Ok(association)
    }

    /// Refresh an association's secret metadata under a new read grant
    ///
    /// Identity (`mount_accessor`, `secret_path`) cannot change.
    pub fn update(
        &self,
        grant: &ReadGrant,
        key: &AssociationKey,
        secret: SecretRef,
    ) -> Result<Association> {
        if !grant.covers(&secret) || !secret.same_secret(&key.mount_accessor, &key.secret_path) {
            return Err(SyncError::Authorization(secret.to_string()));
        }
        let updated = self.update_with(key, |association| {
            association.secret = secret;
            association.clone()
        })?;
        debug!(association = %key, "Association refreshed");
        Ok(updated)
    }

    /// Flag an association for removal; the engine unsyncs it and then removes it
    pub fn mark_for_deletion(&self, key: &AssociationKey) -> Result<Association> {
        self.update_with(key, |association| {
            association.pending_deletion = true;
            association.clone()
        })
    }

    /// Drop an association record
    pub fn remove(&self, key: &AssociationKey) -> Result<Association> {
        let entry = self
            .write_associations()
            .remove(key)
            .ok_or_else(|| SyncError::NotFound(format!("association {key}")))?;
        let removed = lock_entry(&entry).clone();
        info!(association = %key, "Association removed");
        self.persist();
        Ok(removed)
    }

    #[must_use]
    pub fn get(&self, key: &AssociationKey) -> Option<Association> {
        self.entry(key).map(|entry| lock_entry(&entry).clone())
    }

    /// Associations of one destination, sorted by key
    #[must_use]
    pub fn list(&self, destination: &DestinationId) -> Vec<Association> {
        self.collect(|key| &key.destination == destination)
    }

    /// Every association, sorted by key
    #[must_use]
    pub fn list_all(&self) -> Vec<Association> {
        self.collect(|_| true)
    }

    /// Keys of every association for one secret, across destinations
    #[must_use]
    pub fn find_by_secret(&self, mount_accessor: &str, secret_path: &str) -> Vec<AssociationKey> {
        let mut keys: Vec<AssociationKey> = self
            .read_associations()
            .keys()
            .filter(|key| key.mount_accessor == mount_accessor && key.secret_path == secret_path)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Work left unfinished: `PENDING` associations and pending deletions
    ///
    /// A `PENDING` association whose last manual request was an unsync resumes
    /// as an unsync.
    #[must_use]
    pub fn pending_work(&self) -> Vec<(AssociationKey, OperationKind)> {
        self.list_all()
            .into_iter()
            .filter_map(|association| {
                if association.pending_deletion
                    || (association.unsync_requested && association.status == SyncStatus::Pending)
                {
                    Some((association.key, OperationKind::Unsync))
                } else if association.status == SyncStatus::Pending {
                    Some((association.key, OperationKind::Sync))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Record a status transition
    ///
    /// Rejects transitions the state machine does not allow. `error_code` is
    /// kept only on failure statuses.
    pub fn set_status(
        &self,
        key: &AssociationKey,
        status: SyncStatus,
        error_code: Option<String>,
    ) -> Result<Association> {
        let entry = self
            .entry(key)
            .ok_or_else(|| SyncError::NotFound(format!("association {key}")))?;

        let (updated, change) = {
            let mut association = lock_entry(&entry);
            let from = association.status;
            if !from.can_transition_to(status) {
                return Err(SyncError::InvalidTransition {
                    key: key.to_string(),
                    from,
                    to: status,
                });
            }
            let error_code = if status.is_failure() { error_code } else { None };
            let now = Utc::now();
            association.status = status;
            association.error_code.clone_from(&error_code);
            association.last_status_change = now;
            (
                association.clone(),
                StatusChange {
                    key: key.clone(),
                    from,
                    to: status,
                    error_code,
                    at: now,
                },
            )
        };

        debug!(
            association = %key,
            from = %change.from,
            to = %change.to,
            error_code = change.error_code.as_deref().unwrap_or(""),
            "Association status changed"
        );
        // No receivers is fine
        let _ = self.events.send(change);
        self.persist();
        Ok(updated)
    }

    /// Mutate an association's bookkeeping (entries, versions, snapshot)
    ///
    /// Status changes must go through [`AssociationStore::set_status`].
    pub fn update_with<R>(
        &self,
        key: &AssociationKey,
        f: impl FnOnce(&mut Association) -> R,
    ) -> Result<R> {
        let entry = self
            .entry(key)
            .ok_or_else(|| SyncError::NotFound(format!("association {key}")))?;
        let result = {
            let mut association = lock_entry(&entry);
            let status = association.status;
            let result = f(&mut association);
            if association.status != status {
                warn!(
                    association = %key,
                    "Status change through update_with ignored; use set_status"
                );
                association.status = status;
            }
            result
        };
        self.persist();
        Ok(result)
    }

    /// Subscribe to status transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Number of associations per status
    #[must_use]
    pub fn status_counts(&self) -> HashMap<SyncStatus, usize> {
        let mut counts: HashMap<SyncStatus, usize> =
            SyncStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for association in self.list_all() {
            *counts.entry(association.status).or_default() += 1;
        }
        counts
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn entry(&self, key: &AssociationKey) -> Option<Entry> {
        self.read_associations().get(key).map(Arc::clone)
    }

    fn collect(&self, filter: impl Fn(&AssociationKey) -> bool) -> Vec<Association> {
        let entries: Vec<Entry> = self
            .read_associations()
            .iter()
            .filter(|(key, _)| filter(key))
            .map(|(_, entry)| Arc::clone(entry))
            .collect();
        let mut associations: Vec<Association> =
            entries.iter().map(|entry| lock_entry(entry).clone()).collect();
        associations.sort_by(|a, b| a.key.cmp(&b.key));
        associations
    }

    /// Queue a snapshot of the current state if persistence is configured
    fn persist(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        writer.submit(Snapshot {
            version: SNAPSHOT_VERSION,
            destinations: self.list_destinations(),
            associations: self.list_all(),
        });
    }

    fn read_destinations(&self) -> RwLockReadGuard<'_, HashMap<DestinationId, Destination>> {
        self.destinations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_destinations(&self) -> RwLockWriteGuard<'_, HashMap<DestinationId, Destination>> {
        self.destinations.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_associations(&self) -> RwLockReadGuard<'_, HashMap<AssociationKey, Entry>> {
        self.associations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_associations(&self) -> RwLockWriteGuard<'_, HashMap<AssociationKey, Entry>> {
        self.associations.write().unwrap_or_else(|e| e.into_inner())
    }
}
