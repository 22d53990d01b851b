//! # Sync Engine
//!
//! Composes the store, the adapter registry, the executor, the dispatcher and
//! the scanner behind one management surface.
//!
//! ## Direct operations
//!
//! [`SyncEngine::sync`], [`SyncEngine::unsync`] and [`SyncEngine::recreate`]
//! wait for the association's single-flight guard, run the operation and
//! return the resulting status. Destination failures are recorded on the
//! association, not returned.
//!
//! ## Management
//!
//! Creating or updating an association checks the caller's read capability
//! first; nothing is stored when the check fails. Deleting a destination
//! unsyncs every association, and the destination record is removed once the
//! last one is gone. Operations already in flight finish first.
//!
//! ## Lifecycle
//!
//! [`SyncEngine::start`] spawns the dispatcher workers, the change feed loop
//! and the periodic scanner. [`SyncEngine::shutdown`] signals them and waits
//! up to the configured grace period.

use crate::config::SyncConfig;
use crate::controller::dispatcher::Dispatcher;
use crate::controller::executor::Executor;
use crate::controller::retry::RetryController;
use crate::controller::scanner::{ScanReport, Scanner};
use crate::controller::single_flight::SingleFlight;
use crate::error::{Result, SyncError};
use crate::model::{
    Association, AssociationKey, Destination, DestinationId, DestinationUpdate, Granularity,
    OperationKind, SecretRef, StatusChange, SyncOperation, SyncStatus, TriggerSource,
};
use crate::provider::AdapterRegistry;
use crate::source::{authorize, ClientCounter, ReadAuthorizer, SecretEvent, SecretSource};
use crate::store::AssociationStore;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External systems the engine reads from and reports to
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SecretSource>,
    pub authorizer: Arc<dyn ReadAuthorizer>,
    pub client_counter: Arc<dyn ClientCounter>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Request to associate a secret with a destination
#[derive(Debug, Clone)]
pub struct AssociationRequest {
    pub destination: DestinationId,
    pub secret: SecretRef,
    /// Falls back to the destination's granularity
    pub granularity: Option<Granularity>,
}

impl AssociationRequest {
    #[must_use]
    pub fn new(destination: DestinationId, secret: SecretRef) -> Self {
        Self {
            destination,
            secret,
            granularity: None,
        }
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }
}

pub struct SyncEngine {
    store: Arc<AssociationStore>,
    registry: Arc<AdapterRegistry>,
    authorizer: Arc<dyn ReadAuthorizer>,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    scanner: Arc<Scanner>,
    flights: Arc<SingleFlight<AssociationKey>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_grace: Duration,
    scan_concurrency: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("dispatcher", &self.dispatcher)
            .field("scanner", &self.scanner)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        store: Arc<AssociationStore>,
        registry: Arc<AdapterRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flights = Arc::new(SingleFlight::new());
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            collaborators.source,
            collaborators.client_counter,
            RetryController::new(config.retry_policy(), shutdown_rx),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            Arc::clone(&flights),
            config.worker_count.max(1),
        ));
        let scanner_config = config.scanner_config();
        let scan_concurrency = scanner_config.max_concurrent_per_destination.max(1);
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            Arc::clone(&flights),
            scanner_config,
        ));

        Self {
            store,
            registry,
            authorizer: collaborators.authorizer,
            executor,
            dispatcher,
            scanner,
            flights,
            shutdown_tx,
            shutdown_grace: config.shutdown_grace(),
            scan_concurrency,
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AssociationStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ------------------------------------------------------------------
    // Direct operations
    // ------------------------------------------------------------------

    /// Write the association's secret to its destination
    pub async fn sync(&self, key: &AssociationKey) -> Result<SyncStatus> {
        self.run(key, OperationKind::Sync, TriggerSource::Manual)
            .await
    }

    /// Remove everything the association wrote from its destination
    pub async fn unsync(&self, key: &AssociationKey) -> Result<SyncStatus> {
        self.run(key, OperationKind::Unsync, TriggerSource::Manual)
            .await
    }

    /// Unsync, adopt the destination's current template, then sync
    pub async fn recreate(&self, key: &AssociationKey) -> Result<SyncStatus> {
        self.run(key, OperationKind::Recreate, TriggerSource::Manual)
            .await
    }

    async fn run(
        &self,
        key: &AssociationKey,
        kind: OperationKind,
        trigger: TriggerSource,
    ) -> Result<SyncStatus> {
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        let _guard = self.flights.acquire(key).await;
        let mut operation = SyncOperation::new(key.clone(), kind, trigger);
        self.executor.execute(&mut operation).await
    }

    // ------------------------------------------------------------------
    // Destinations
    // ------------------------------------------------------------------

    /// Validate and store a destination
    pub fn create_destination(&self, destination: Destination) -> Result<Destination> {
        self.registry.validate(&destination)?;
        self.store.create_destination(destination)
    }

    /// Update a destination, optionally recreating every association under the new settings
    ///
    /// Template changes otherwise only apply to associations created later.
    pub async fn update_destination(
        &self,
        id: &DestinationId,
        update: DestinationUpdate,
        force_recreate: bool,
    ) -> Result<Destination> {
        let current = self
            .store
            .get_destination(id)
            .filter(|destination| !destination.deleting)
            .ok_or_else(|| SyncError::NotFound(format!("destination {id}")))?;
        if let Some(config) = &update.config {
            let candidate = current.clone().with_config(config.clone());
            self.registry.validate(&candidate)?;
        }

        let updated = self.store.update_destination(id, update)?;
        if updated.config_version != current.config_version {
            self.registry.invalidate(id);
        }

        if force_recreate {
            let keys: Vec<AssociationKey> = self
                .store
                .list(id)
                .into_iter()
                .filter(|association| !association.pending_deletion)
                .map(|association| association.key)
                .collect();
            info!(destination = %id, "Recreating {} association(s)", keys.len());
            self.run_all(keys, OperationKind::Recreate).await;
        }
        Ok(updated)
    }

    /// Unsync every association of a destination, then remove it
    ///
    /// Returns `true` when the destination record is gone. When some
    /// associations could not be unsynced the destination stays in the
    /// deleting state; retrying the call or the scanner finishes the job.
    pub async fn delete_destination(&self, id: &DestinationId) -> Result<bool> {
        self.store.mark_destination_deleting(id)?;
        let keys: Vec<AssociationKey> = self
            .store
            .list(id)
            .into_iter()
            .map(|association| association.key)
            .collect();

        if keys.is_empty() {
            self.store.remove_destination(id)?;
            self.registry.invalidate(id);
            return Ok(true);
        }

        for key in &keys {
            self.store.mark_for_deletion(key)?;
        }
        info!(destination = %id, "Unsyncing {} association(s) before removal", keys.len());
        self.run_all(keys, OperationKind::Unsync).await;

        let removed = self.store.get_destination(id).is_none();
        if !removed {
            warn!(destination = %id, "Destination kept until its remaining associations are unsynced");
        }
        Ok(removed)
    }

    async fn run_all(&self, keys: Vec<AssociationKey>, kind: OperationKind) {
        stream::iter(keys)
            .for_each_concurrent(self.scan_concurrency, |key| async move {
                if let Err(e) = self.run(&key, kind, TriggerSource::Manual).await {
                    warn!(association = %key, operation = kind.as_str(), "Operation not completed: {}", e);
                }
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Associate a secret with a destination and queue its first sync
    ///
    /// The principal must be able to read the secret.
    pub async fn create_association(
        &self,
        principal: &str,
        request: AssociationRequest,
    ) -> Result<Association> {
        let grant = authorize(self.authorizer.as_ref(), principal, &request.secret).await?;
        let association = self.store.create(
            &grant,
            &request.destination,
            request.secret,
            request.granularity,
        )?;
        info!(
            association = %association.key,
            principal = grant.principal(),
            "Association created"
        );
        self.dispatcher.enqueue(
            association.key.clone(),
            OperationKind::Sync,
            TriggerSource::Manual,
        );
        Ok(association)
    }

    /// Re-check the principal's read capability and queue a fresh sync
    pub async fn update_association(
        &self,
        principal: &str,
        key: &AssociationKey,
    ) -> Result<Association> {
        let current = self
            .store
            .get(key)
            .filter(|association| !association.pending_deletion)
            .ok_or_else(|| SyncError::NotFound(format!("association {key}")))?;
        let grant = authorize(self.authorizer.as_ref(), principal, &current.secret).await?;
        let updated = self.store.update(&grant, key, current.secret)?;
        self.dispatcher
            .enqueue(key.clone(), OperationKind::Sync, TriggerSource::Manual);
        Ok(updated)
    }

    /// Unsync an association and drop it
    ///
    /// When the unsync fails the association is kept, flagged for deletion,
    /// with the failure status; the returned status says which.
    pub async fn delete_association(&self, key: &AssociationKey) -> Result<SyncStatus> {
        self.store.mark_for_deletion(key)?;
        self.unsync(key).await
    }

    #[must_use]
    pub fn get_association(&self, key: &AssociationKey) -> Option<Association> {
        self.store.get(key)
    }

    /// Associations of one destination, or all of them
    #[must_use]
    pub fn list_associations(&self, destination: Option<&DestinationId>) -> Vec<Association> {
        match destination {
            Some(id) => self.store.list(id),
            None => self.store.list_all(),
        }
    }

    /// Status transitions as they are recorded
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.store.subscribe()
    }

    /// Queue operations for a change event without going through the feed
    pub fn handle_event(&self, event: &SecretEvent) -> usize {
        self.dispatcher.handle_event(event)
    }

    /// Run one reconciliation pass now
    pub async fn scan_now(&self) -> ScanReport {
        self.scanner.scan_once().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the dispatcher workers, the feed loop and the scanner
    pub fn start(&self, feed: BoxStream<'static, SecretEvent>) {
        let shutdown = self.shutdown_tx.subscribe();
        let mut handles = self.dispatcher.start(feed, shutdown.clone());
        handles.push(tokio::spawn(Arc::clone(&self.scanner).run(shutdown)));
        self.lock_tasks().extend(handles);
        info!("Sync engine started");
    }

    /// Stop background tasks, waiting up to the grace period
    ///
    /// Operations still running when the grace period ends are aborted; their
    /// associations stay `PENDING` and are picked up again on the next start.
    /// Returns once the store's queued snapshots are written.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("Shutdown already signalled");
        }
        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        if handles.is_empty() {
            self.store.flush().await;
            return;
        }
        info!(
            "Waiting up to {:?} for {} task(s) to stop",
            self.shutdown_grace,
            handles.len()
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(
            self.shutdown_grace,
            futures::future::join_all(handles),
        )
        .await;
        match joined {
            Ok(_) => info!("Sync engine stopped"),
            Err(_) => {
                warn!("Grace period elapsed, aborting remaining tasks");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        self.store.flush().await;
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DestinationType;
    use crate::provider::memory::MemoryDestination;
    use crate::provider::SharedAdapter;
    use crate::source::{DistinctClientCounter, MemorySecretStore, StaticAuthorizer};
    use serde_json::json;

    struct Fixture {
        engine: SyncEngine,
        secrets: Arc<MemorySecretStore>,
        destination: Arc<MemoryDestination>,
    }

    fn fixture() -> Fixture {
        let secrets = Arc::new(MemorySecretStore::new());
        let destination = Arc::new(MemoryDestination::new());
        let authorizer = StaticAuthorizer::new().allow_all("ops");
        let mut registry = AdapterRegistry::new();
        registry.register(SharedAdapter::new(
            DestinationType::InMem,
            Arc::clone(&destination) as Arc<dyn crate::provider::DestinationAdapter>,
        ));
        let config = SyncConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            backoff_jitter_ratio: 0.0,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            &config,
            Arc::new(AssociationStore::new()),
            Arc::new(registry),
            Collaborators {
                source: Arc::clone(&secrets) as Arc<dyn SecretSource>,
                authorizer: Arc::new(authorizer),
                client_counter: Arc::new(DistinctClientCounter::new()),
            },
        );
        Fixture {
            engine,
            secrets,
            destination,
        }
    }

    fn mem_id() -> DestinationId {
        DestinationId::new(DestinationType::InMem, "mem")
    }

    async fn associate(fx: &Fixture, path: &str) -> AssociationKey {
        let secret = SecretRef::new("kv_1234", path);
        fx.engine
            .create_association("ops", AssociationRequest::new(mem_id(), secret))
            .await
            .unwrap()
            .key
    }

    #[tokio::test]
    async fn test_create_association_requires_read_capability() {
        let fx = fixture();
        fx.engine
            .create_destination(Destination::new(DestinationType::InMem, "mem"))
            .unwrap();

        let result = fx
            .engine
            .create_association(
                "intruder",
                AssociationRequest::new(mem_id(), SecretRef::new("kv_1234", "app")),
            )
            .await;

        assert!(matches!(result, Err(SyncError::Authorization(_))));
        assert!(fx.engine.list_associations(None).is_empty());
        assert_eq!(fx.destination.write_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_and_delete_association() {
        let fx = fixture();
        fx.engine
            .create_destination(Destination::new(DestinationType::InMem, "mem"))
            .unwrap();
        fx.secrets.put("kv_1234", "app", json!({"user": "admin"}));
        let key = associate(&fx, "app").await;

        assert_eq!(fx.engine.sync(&key).await.unwrap(), SyncStatus::Synced);
        assert_eq!(fx.destination.names(), vec!["vault/kv_1234/app".to_string()]);

        assert_eq!(
            fx.engine.delete_association(&key).await.unwrap(),
            SyncStatus::Unsynced
        );
        assert!(fx.destination.names().is_empty());
        assert!(fx.engine.get_association(&key).is_none());
    }

    #[tokio::test]
    async fn test_delete_destination_cascades() {
        let fx = fixture();
        fx.engine
            .create_destination(Destination::new(DestinationType::InMem, "mem"))
            .unwrap();
        fx.secrets.put("kv_1234", "a", json!({"k": "1"}));
        fx.secrets.put("kv_1234", "b", json!({"k": "2"}));
        let a = associate(&fx, "a").await;
        let b = associate(&fx, "b").await;
        fx.engine.sync(&a).await.unwrap();
        fx.engine.sync(&b).await.unwrap();

        assert!(fx.engine.delete_destination(&mem_id()).await.unwrap());
        assert!(fx.destination.names().is_empty());
        assert!(fx.engine.store().get_destination(&mem_id()).is_none());
        assert!(fx.engine.list_associations(None).is_empty());
    }

    #[tokio::test]
    async fn test_update_destination_force_recreate_renames() {
        let fx = fixture();
        fx.engine
            .create_destination(
                Destination::new(DestinationType::InMem, "mem")
                    .with_granularity(Granularity::SecretPath),
            )
            .unwrap();
        fx.secrets.put("kv_1234", "db", json!({"password": "pw"}));
        let key = associate(&fx, "db").await;
        fx.engine.sync(&key).await.unwrap();

        let update = DestinationUpdate {
            secret_name_template: Some(Some("{{ .SecretBaseName | uppercase }}".to_string())),
            ..DestinationUpdate::default()
        };
        fx.engine
            .update_destination(&mem_id(), update, true)
            .await
            .unwrap();

        assert_eq!(fx.destination.names(), vec!["DB".to_string()]);
        assert_eq!(
            fx.engine.get_association(&key).unwrap().status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_operations_refused_after_shutdown() {
        let fx = fixture();
        fx.engine
            .create_destination(Destination::new(DestinationType::InMem, "mem"))
            .unwrap();
        let key = associate(&fx, "app").await;

        fx.engine.shutdown().await;

        assert!(matches!(
            fx.engine.sync(&key).await,
            Err(SyncError::ShuttingDown)
        ));
    }
}
