//! # Reconciliation Scanner
//!
//! Periodic sweep that compares every association's recorded state with the
//! source and repairs drift, independently of the event pipeline.
//!
//! Drift rules, first match wins:
//!
//! 1. pending deletion: unsync
//! 2. `PENDING` for longer than the grace period: sync
//! 3. `UNKNOWN` or a failure status: sync
//! 4. secret gone from the source while entries exist: unsync
//! 5. source version differs from the last synced version: sync
//! 6. desired entry names or digests differ from the recorded entries: sync
//!
//! Associations whose single-flight slot is taken are skipped for the cycle.
//! Nothing is written when nothing drifted, so back-to-back scans without
//! changes in between leave the destinations untouched.

use crate::constants::{
    DEFAULT_PENDING_GRACE_SECS, DEFAULT_SCAN_CONCURRENCY_PER_DESTINATION,
    DEFAULT_SCAN_INTERVAL_SECS,
};
use crate::controller::executor::{entries_match, render_secrets, Executor};
use crate::controller::single_flight::SingleFlight;
use crate::controller::stopped;
use crate::model::{
    Association, AssociationKey, Destination, OperationKind, SyncOperation, SyncStatus,
    TriggerSource,
};
use crate::observability::metrics;
use crate::store::AssociationStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Scanner timing and fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    pub period: Duration,
    /// How long `PENDING` may last before the scanner takes over
    pub pending_grace: Duration,
    pub max_concurrent_per_destination: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            pending_grace: Duration::from_secs(DEFAULT_PENDING_GRACE_SECS),
            max_concurrent_per_destination: DEFAULT_SCAN_CONCURRENCY_PER_DESTINATION,
        }
    }
}

/// Counts from one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub destinations: usize,
    pub checked: usize,
    /// Operations run that ended without a failure status
    pub repaired: usize,
    /// Associations with an operation in flight
    pub skipped: usize,
    /// Repairs that ended in a failure status or were aborted
    pub failed: usize,
}

impl ScanReport {
    fn merge(&mut self, other: &ScanReport) {
        self.checked += other.checked;
        self.repaired += other.repaired;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    InSync,
    Repair(OperationKind),
}

/// Periodic drift detection and repair
pub struct Scanner {
    store: Arc<AssociationStore>,
    executor: Arc<Executor>,
    flights: Arc<SingleFlight<AssociationKey>>,
    config: ScannerConfig,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(
        store: Arc<AssociationStore>,
        executor: Arc<Executor>,
        flights: Arc<SingleFlight<AssociationKey>>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            flights,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan on every period tick until shutdown
    ///
    /// The first tick fires one period after start; recovery covers startup.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.config.period;
        let mut interval = tokio::time::interval_at(start, self.config.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Reconciliation scanner running every {:?}", self.config.period);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.scan_once().await;
                }
                () = stopped(&mut shutdown) => break,
            }
        }
        debug!("Reconciliation scanner stopped");
    }

    /// One full pass over every destination
    pub async fn scan_once(&self) -> ScanReport {
        let span = info_span!("reconciliation.scan");
        async {
            let start = Instant::now();
            let destinations = self.store.list_destinations();
            let mut report = ScanReport {
                destinations: destinations.len(),
                ..ScanReport::default()
            };

            for destination in &destinations {
                let partial = self.scan_destination(destination).await;
                report.merge(&partial);
            }

            self.publish_status_counts();
            metrics::increment_scans();
            metrics::observe_scan_duration(start.elapsed().as_secs_f64());
            info!(
                destinations = report.destinations,
                checked = report.checked,
                repaired = report.repaired,
                skipped = report.skipped,
                failed = report.failed,
                "Reconciliation scan completed in {:?}",
                start.elapsed()
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn scan_destination(&self, destination: &Destination) -> ScanReport {
        let associations = self.store.list(&destination.id);
        let report = Mutex::new(ScanReport::default());

        stream::iter(associations.into_iter().map(|association| association.key))
            .for_each_concurrent(self.config.max_concurrent_per_destination, |key| {
                let report = &report;
                async move {
                    let outcome = self.check(key, destination).await;
                    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                    report.checked += 1;
                    match outcome {
                        CheckOutcome::InSync => {}
                        CheckOutcome::Skipped => report.skipped += 1,
                        CheckOutcome::Repaired => report.repaired += 1,
                        CheckOutcome::Failed => report.failed += 1,
                    }
                }
            })
            .await;

        report.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    async fn check(&self, key: AssociationKey, destination: &Destination) -> CheckOutcome {
        let Some(_guard) = self.flights.try_acquire(&key) else {
            debug!(association = %key, "Operation in flight, skipping");
            return CheckOutcome::Skipped;
        };
        // Read under the guard; the listed copy may predate a finished operation
        let Some(association) = self.store.get(&key) else {
            return CheckOutcome::InSync;
        };

        let Verdict::Repair(kind) = self.evaluate(&association, destination).await else {
            return CheckOutcome::InSync;
        };

        info!(
            association = %key,
            status = association.status.as_str(),
            operation = kind.as_str(),
            "Drift detected, repairing"
        );
        metrics::increment_scan_repairs(kind.as_str());
        let mut operation = SyncOperation::new(key.clone(), kind, TriggerSource::Reconciliation);
        match self.executor.execute(&mut operation).await {
            Ok(status) if !status.is_failure() => CheckOutcome::Repaired,
            Ok(_) => CheckOutcome::Failed,
            Err(e) => {
                warn!(association = %key, "Repair aborted: {}", e);
                CheckOutcome::Failed
            }
        }
    }

    async fn evaluate(&self, association: &Association, destination: &Destination) -> Verdict {
        if association.pending_deletion {
            return Verdict::Repair(OperationKind::Unsync);
        }
        // A manually unsynced association is only kept empty
        let repair = if association.unsync_requested {
            OperationKind::Unsync
        } else {
            OperationKind::Sync
        };
        match association.status {
            SyncStatus::Pending => {
                let age = Utc::now()
                    .signed_duration_since(association.last_status_change)
                    .to_std()
                    .unwrap_or_default();
                return if age > self.config.pending_grace {
                    Verdict::Repair(repair)
                } else {
                    Verdict::InSync
                };
            }
            SyncStatus::Unknown => return Verdict::Repair(repair),
            status if status.is_failure() => return Verdict::Repair(repair),
            _ => {}
        }
        if association.unsync_requested {
            return if association.has_external_entries() {
                Verdict::Repair(OperationKind::Unsync)
            } else {
                Verdict::InSync
            };
        }

        let secret = &association.secret;
        let data = match self
            .executor
            .source()
            .get_secret_version(&secret.mount_accessor, &secret.secret_path)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(association = %association.key, "Source read failed during scan: {:#}", e);
                return Verdict::InSync;
            }
        };
        let Some(data) = data else {
            return if association.has_external_entries() {
                Verdict::Repair(OperationKind::Unsync)
            } else {
                Verdict::InSync
            };
        };

        if association.secret_version != Some(data.version) {
            return Verdict::Repair(OperationKind::Sync);
        }

        let adapter = match self.executor.registry().adapter_for(destination).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(destination = %destination.id, "Adapter unavailable during scan: {}", e);
                return Verdict::Repair(OperationKind::Sync);
            }
        };
        match render_secrets(association, &data, adapter.supports_multi_value()) {
            Ok(rendered) if entries_match(association, &rendered) => Verdict::InSync,
            _ => Verdict::Repair(OperationKind::Sync),
        }
    }

    fn publish_status_counts(&self) {
        for (status, count) in self.store.status_counts() {
            metrics::set_associations(status.as_str(), count as i64);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    InSync,
    Skipped,
    Repaired,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::retry::{RetryController, RetryPolicy};
    use crate::model::{DestinationId, DestinationType, SecretRef};
    use crate::provider::{AdapterRegistry, DestinationAdapter, MemoryDestination, SharedAdapter};
    use crate::source::{
        authorize, ClientCounter, DistinctClientCounter, MemorySecretStore, SecretSource,
        StaticAuthorizer,
    };
    use serde_json::json;

    struct Harness {
        store: Arc<AssociationStore>,
        source: Arc<MemorySecretStore>,
        memory: Arc<MemoryDestination>,
        flights: Arc<SingleFlight<AssociationKey>>,
        scanner: Scanner,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(config: ScannerConfig) -> Harness {
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
        let (tx, rx) = watch::channel(false);
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::clone(&source) as Arc<dyn SecretSource>,
            Arc::new(DistinctClientCounter::new()) as Arc<dyn ClientCounter>,
            RetryController::new(RetryPolicy::default(), rx),
        ));
        let flights = Arc::new(SingleFlight::new());
        let scanner = Scanner::new(Arc::clone(&store), executor, Arc::clone(&flights), config);
        Harness {
            store,
            source,
            memory,
            flights,
            scanner,
            _shutdown: tx,
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

    #[tokio::test]
    async fn test_second_scan_writes_nothing() {
        let h = harness(ScannerConfig::default());
        for path in ["a", "b", "c"] {
            associate(&h, path).await;
            h.source.put("kv", path, json!({"v": path}));
        }

        let first = h.scanner.scan_once().await;
        assert_eq!(first.destinations, 1);
        assert_eq!(first.checked, 3);
        assert_eq!(first.repaired, 3);
        let writes = h.memory.write_count();

        let second = h.scanner.scan_once().await;
        assert_eq!(second.repaired, 0);
        assert_eq!(second.checked, 3);
        assert_eq!(h.memory.write_count(), writes);
    }

    #[tokio::test]
    async fn test_missed_update_is_repaired() {
        let h = harness(ScannerConfig::default());
        let key = associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));
        h.scanner.scan_once().await;

        h.source.put_silently("kv", "app", json!({"v": "2"}));
        let report = h.scanner.scan_once().await;
        assert_eq!(report.repaired, 1);
        assert_eq!(h.store.get(&key).unwrap().secret_version, Some(2));
        assert_eq!(h.memory.value("vault/kv/app").as_deref(), Some(r#"{"v":"2"}"#));
    }

    #[tokio::test]
    async fn test_deleted_secret_is_unsynced() {
        let h = harness(ScannerConfig::default());
        let key = associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));
        h.scanner.scan_once().await;

        h.source.delete("kv", "app");
        h.scanner.scan_once().await;
        assert_eq!(h.store.get(&key).unwrap().status, SyncStatus::Unsynced);
        assert!(h.memory.names().is_empty());

        // Unsynced with nothing left outside is in sync
        assert_eq!(h.scanner.scan_once().await.repaired, 0);
    }

    #[tokio::test]
    async fn test_in_flight_associations_are_skipped() {
        let h = harness(ScannerConfig::default());
        let key = associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));

        let guard = h.flights.acquire(&key).await;
        let report = h.scanner.scan_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.memory.put_count(), 0);
        drop(guard);

        assert_eq!(h.scanner.scan_once().await.repaired, 1);
    }

    #[tokio::test]
    async fn test_recent_pending_left_alone() {
        let h = harness(ScannerConfig {
            pending_grace: Duration::from_secs(3600),
            ..ScannerConfig::default()
        });
        let key = associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));
        h.store.set_status(&key, SyncStatus::Pending, None).unwrap();

        assert_eq!(h.scanner.scan_once().await.repaired, 0);

        let h = harness(ScannerConfig {
            pending_grace: Duration::ZERO,
            ..ScannerConfig::default()
        });
        let key = associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));
        h.store.set_status(&key, SyncStatus::Pending, None).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(h.scanner.scan_once().await.repaired, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_scanner_repairs_and_stops() {
        let h = harness(ScannerConfig {
            period: Duration::from_millis(10),
            ..ScannerConfig::default()
        });
        associate(&h, "app").await;
        h.source.put("kv", "app", json!({"v": "1"}));

        let (shutdown, rx) = watch::channel(false);
        let scanner = Arc::new(h.scanner);
        let handle = tokio::spawn(Arc::clone(&scanner).run(rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.memory.contains("vault/kv/app") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scanner never repaired the association");

        shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scanner did not stop")
            .unwrap();
    }
}
