//! # Event Dispatcher
//!
//! Turns secret change events into queued operations and runs them on a pool
//! of workers.
//!
//! ## Queueing
//!
//! Every association has at most one queued slot. Scheduling an operation
//! for an association that already has one queued replaces it (see
//! [`OperationKind::coalesce`]), so a burst of events costs one operation.
//! Workers take the slot only after holding the association's single-flight
//! guard, which keeps operations on one association in arrival order while
//! different associations run concurrently.
//!
//! ## Lifecycle
//!
//! [`Dispatcher::start`] re-queues unfinished work from the store, spawns the
//! workers and the feed loop. All of them stop when the shutdown watch flips
//! to `true`.

use crate::controller::executor::Executor;
use crate::controller::stopped;
use crate::controller::single_flight::SingleFlight;
use crate::error::SyncError;
use crate::model::{AssociationKey, OperationKind, SyncOperation, SyncStatus, TriggerSource};
use crate::observability::metrics;
use crate::source::SecretEvent;
use crate::store::AssociationStore;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Queue and worker pool for sync operations
pub struct Dispatcher {
    store: Arc<AssociationStore>,
    executor: Arc<Executor>,
    flights: Arc<SingleFlight<AssociationKey>>,
    /// Queued, not yet started operations; one per association
    slots: Mutex<HashMap<AssociationKey, SyncOperation>>,
    queue_tx: mpsc::UnboundedSender<AssociationKey>,
    queue_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<AssociationKey>>>,
    worker_count: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_count", &self.worker_count)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<AssociationStore>,
        executor: Arc<Executor>,
        flights: Arc<SingleFlight<AssociationKey>>,
        worker_count: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            executor,
            flights,
            slots: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: Arc::new(AsyncMutex::new(queue_rx)),
            worker_count: worker_count.max(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<AssociationKey, SyncOperation>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Operations waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.slots().len()
    }

    /// Queue an operation, marking the association `PENDING`
    ///
    /// Returns `false` when the association no longer exists.
    pub fn enqueue(&self, key: AssociationKey, kind: OperationKind, trigger: TriggerSource) -> bool {
        match self.store.set_status(&key, SyncStatus::Pending, None) {
            Ok(_) => {}
            Err(SyncError::NotFound(_)) => {
                debug!(association = %key, "Skipping operation for removed association");
                return false;
            }
            Err(e) => {
                // The operation still runs; its outcome is recorded normally
                warn!(association = %key, "Failed to mark association pending: {}", e);
            }
        }

        let depth = {
            let mut slots = self.slots();
            match slots.get_mut(&key) {
                Some(queued) => {
                    let merged = queued.kind.coalesce(kind);
                    debug!(
                        association = %key,
                        queued = queued.kind.as_str(),
                        requested = kind.as_str(),
                        merged = merged.as_str(),
                        "Coalesced queued operation"
                    );
                    queued.kind = merged;
                    queued.trigger = trigger;
                    metrics::increment_dispatcher_coalesced();
                }
                None => {
                    slots.insert(key.clone(), SyncOperation::new(key.clone(), kind, trigger));
                    if self.queue_tx.send(key).is_err() {
                        error!("Dispatcher queue closed");
                    }
                }
            }
            slots.len()
        };
        metrics::set_dispatcher_queue_depth(depth as i64);
        true
    }

    /// Queue operations for every association of the secret named by `event`
    pub fn handle_event(&self, event: &SecretEvent) -> usize {
        metrics::increment_dispatcher_events();
        let kind = if event.deleted {
            OperationKind::Unsync
        } else {
            OperationKind::Sync
        };
        let keys = self
            .store
            .find_by_secret(&event.mount_accessor, &event.secret_path);
        debug!(
            "Secret event {} matches {} association(s)",
            event,
            keys.len()
        );
        keys.into_iter()
            .filter(|key| kind == OperationKind::Unsync || !self.unsync_requested(key))
            .filter(|key| self.enqueue(key.clone(), kind, TriggerSource::Event))
            .count()
    }

    /// Manually unsynced associations ignore source changes
    fn unsync_requested(&self, key: &AssociationKey) -> bool {
        let requested = self
            .store
            .get(key)
            .is_some_and(|association| association.unsync_requested);
        if requested {
            debug!(association = %key, "Skipping sync of manually unsynced association");
        }
        requested
    }

    /// Re-queue work left `PENDING` or pending deletion
    pub fn recover(&self) -> usize {
        let work = self.store.pending_work();
        if !work.is_empty() {
            info!("Recovering {} unfinished operation(s)", work.len());
        }
        work.into_iter()
            .filter(|(key, kind)| self.enqueue(key.clone(), *kind, TriggerSource::Recovery))
            .count()
    }

    /// Recover unfinished work, then spawn the workers and the feed loop
    pub fn start(
        self: &Arc<Self>,
        feed: BoxStream<'static, SecretEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.recover();

        let mut handles: Vec<JoinHandle<()>> = (0..self.worker_count)
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move { dispatcher.run_worker(shutdown).await }
                        .instrument(info_span!("dispatcher.worker", worker)),
                )
            })
            .collect();

        let dispatcher = Arc::clone(self);
        handles.push(tokio::spawn(
            async move { dispatcher.run_feed(feed, shutdown).await }
                .instrument(info_span!("dispatcher.feed")),
        ));
        info!("Dispatcher started with {} worker(s)", self.worker_count);
        handles
    }

    async fn run_feed(&self, mut feed: BoxStream<'static, SecretEvent>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                event = feed.next() => match event {
                    Some(event) => {
                        self.handle_event(&event);
                    }
                    None => {
                        info!("Change feed ended");
                        break;
                    }
                },
                () = stopped(&mut shutdown) => break,
            }
        }
        debug!("Feed loop stopped");
    }

    async fn run_worker(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let key = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    key = queue.recv() => key,
                    () = stopped(&mut shutdown) => None,
                }
            };
            let Some(key) = key else {
                break;
            };
            self.process(&key).await;
        }
        debug!("Worker stopped");
    }

    /// Run the queued operation for `key` under its single-flight guard
    async fn process(&self, key: &AssociationKey) {
        let _guard = self.flights.acquire(key).await;
        let queued = {
            let mut slots = self.slots();
            let queued = slots.remove(key);
            metrics::set_dispatcher_queue_depth(slots.len() as i64);
            queued
        };
        let Some(mut operation) = queued else {
            // Already taken by the worker that held the guard before us
            return;
        };

        match self.executor.execute(&mut operation).await {
            Ok(status) => debug!(
                association = %key,
                operation = operation.kind.as_str(),
                status = status.as_str(),
                "Operation finished"
            ),
            Err(SyncError::ShuttingDown) => {
                info!(association = %key, "Operation interrupted by shutdown, left PENDING");
            }
            Err(SyncError::NotFound(_)) => {
                debug!(association = %key, "Association removed before its operation ran");
            }
            Err(e) => error!(association = %key, "Operation aborted: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::retry::{RetryController, RetryPolicy};
    use crate::model::{Destination, DestinationId, DestinationType, SecretRef};
    use crate::provider::{AdapterRegistry, DestinationAdapter, MemoryDestination, SharedAdapter};
    use crate::source::{
        authorize, ChangeFeed, ClientCounter, DistinctClientCounter, MemorySecretStore,
        SecretSource, StaticAuthorizer,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<AssociationStore>,
        source: Arc<MemorySecretStore>,
        memory: Arc<MemoryDestination>,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let store = Arc::new(AssociationStore::new());
        store
            .create_destination(Destination::new(DestinationType::InMem, "mem"))
            .unwrap();
        let memory = Arc::new(MemoryDestination::new());
        let mut registry = AdapterRegistry::new();
        registry.register(SharedAdapter::new(
            DestinationType::InMem,
            Arc::clone(&memory) as Arc<dyn DestinationAdapter>,
        ));
        let source = Arc::new(MemorySecretStore::new());
        let (shutdown, rx) = watch::channel(false);
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::clone(&source) as Arc<dyn SecretSource>,
            Arc::new(DistinctClientCounter::new()) as Arc<dyn ClientCounter>,
            RetryController::new(RetryPolicy::default(), rx),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            executor,
            Arc::new(SingleFlight::new()),
            2,
        ));
        Harness {
            store,
            source,
            memory,
            dispatcher,
            shutdown,
        }
    }

    async fn associate(h: &Harness, path: &str) -> AssociationKey {
        let secret = SecretRef::new("kv", path);
        let authorizer = StaticAuthorizer::new().allow_all("ops");
        let grant = authorize(&authorizer, "ops", &secret).await.unwrap();
        h.store
            .create(
                &grant,
                &DestinationId::new(DestinationType::InMem, "mem"),
                secret,
                None,
            )
            .unwrap()
            .key
    }

    async fn wait_for_status(store: &AssociationStore, key: &AssociationKey, status: SyncStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(key).map(|a| a.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{key} never reached {status}"));
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_per_association() {
        let h = harness();
        let key = associate(&h, "app").await;

        assert!(h.dispatcher.enqueue(key.clone(), OperationKind::Sync, TriggerSource::Event));
        assert!(h.dispatcher.enqueue(key.clone(), OperationKind::Unsync, TriggerSource::Event));
        assert!(h.dispatcher.enqueue(key.clone(), OperationKind::Sync, TriggerSource::Event));

        assert_eq!(h.dispatcher.queued(), 1);
        assert_eq!(h.store.get(&key).unwrap().status, SyncStatus::Pending);
        assert_eq!(h.dispatcher.slots()[&key].kind, OperationKind::Sync);
    }

    #[tokio::test]
    async fn test_events_fan_out_to_every_destination() {
        let h = harness();
        h.store
            .create_destination(Destination::new(DestinationType::InMem, "other"))
            .unwrap();
        let secret = SecretRef::new("kv", "app");
        let authorizer = StaticAuthorizer::new().allow_all("ops");
        let grant = authorize(&authorizer, "ops", &secret).await.unwrap();
        for name in ["mem", "other"] {
            h.store
                .create(
                    &grant,
                    &DestinationId::new(DestinationType::InMem, name),
                    secret.clone(),
                    None,
                )
                .unwrap();
        }

        let queued = h.dispatcher.handle_event(&SecretEvent::updated("kv", "app", 1));
        assert_eq!(queued, 2);
        assert_eq!(h.dispatcher.handle_event(&SecretEvent::updated("kv", "unrelated", 1)), 0);
    }

    #[tokio::test]
    async fn test_updates_skip_manually_unsynced_associations() {
        let h = harness();
        let key = associate(&h, "app").await;
        h.store
            .update_with(&key, |association| association.unsync_requested = true)
            .unwrap();

        assert_eq!(h.dispatcher.handle_event(&SecretEvent::updated("kv", "app", 2)), 0);
        assert_eq!(h.dispatcher.queued(), 0);
        // Deletions still clean up
        assert_eq!(h.dispatcher.handle_event(&SecretEvent::deleted("kv", "app", 3)), 1);
        assert_eq!(h.dispatcher.slots()[&key].kind, OperationKind::Unsync);
    }

    #[tokio::test]
    async fn test_feed_events_are_synced_by_workers() {
        let h = harness();
        let key = associate(&h, "app").await;
        let handles = h
            .dispatcher
            .start(h.source.subscribe(), h.shutdown.subscribe());

        h.source.put("kv", "app", json!({"a": "1"}));
        wait_for_status(&h.store, &key, SyncStatus::Synced).await;
        assert!(h.memory.contains("vault/kv/app"));

        h.source.delete("kv", "app");
        wait_for_status(&h.store, &key, SyncStatus::Unsynced).await;
        assert!(!h.memory.contains("vault/kv/app"));

        h.shutdown.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_recovery_requeues_pending_work() {
        let h = harness();
        let key = associate(&h, "app").await;
        h.source.put_silently("kv", "app", json!({"a": "1"}));
        h.store.set_status(&key, SyncStatus::Pending, None).unwrap();

        assert_eq!(h.dispatcher.recover(), 1);
        let handles = h
            .dispatcher
            .start(futures::stream::empty().boxed(), h.shutdown.subscribe());
        wait_for_status(&h.store, &key, SyncStatus::Synced).await;

        h.shutdown.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
