//! # Operation Executor
//!
//! Runs one [`SyncOperation`] against its association. Callers hold the
//! association's single-flight guard for the whole call.
//!
//! - `sync` reads the current secret version, renders one payload per
//!   external entry, writes each through the retry controller, removes entries
//!   that are no longer wanted and tags new ones
//! - `unsync` deletes every recorded entry
//! - `recreate` unsyncs the recorded names, adopts the destination's current
//!   template and granularity, then syncs
//!
//! A secret missing at the source turns a sync into an unsync. The outcome is
//! recorded through [`AssociationStore::set_status`]; failures land on the
//! association, they are not returned to the caller.

use crate::controller::retry::{RetryController, RetryError};
use crate::error::{DestinationError, Result, SyncError};
use crate::model::{
    Association, AssociationKey, Destination, EntryState, Granularity, OperationKind,
    RenderedSecret, SecretData, SecretRef, SyncOperation, SyncStatus, TemplateSnapshot,
    TriggerSource,
};
use crate::observability::metrics;
use crate::provider::{AdapterRegistry, AdapterResult, DestinationAdapter};
use crate::source::{ClientCounter, SecretSource};
use crate::store::AssociationStore;
use crate::template::{resolve_name, validate_template, TemplateError};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, field, info, info_span, warn, Instrument};

/// Result of the destination work, before it is recorded
#[derive(Debug)]
enum Outcome {
    Synced,
    Unsynced,
    Failed(DestinationError),
}

impl Outcome {
    fn from_failure(failure: Option<DestinationError>, success: Outcome) -> Self {
        failure.map_or(success, Outcome::Failed)
    }
}

/// Render the payloads an association should hold for `data`
///
/// Names come from the association's own template snapshot, never from the
/// destination's current template. Two keys that sanitize to the same name
/// are rejected before anything is written.
pub(crate) fn render_secrets(
    association: &Association,
    data: &SecretData,
    multi_value: bool,
) -> Result<Vec<RenderedSecret>, TemplateError> {
    let granularity = association.granularity();
    let rendered = data
        .payloads(granularity)
        .into_iter()
        .map(|(secret_key, value)| {
            let name = resolve_name(
                &association.template_version,
                &association.key.destination,
                &association.secret,
                secret_key.as_deref(),
            )?;
            Ok(RenderedSecret {
                name,
                secret_key,
                value,
                structured: granularity == Granularity::SecretPath && multi_value,
            })
        })
        .collect::<Result<Vec<_>, TemplateError>>()?;

    let mut owners: HashMap<&str, &RenderedSecret> = HashMap::with_capacity(rendered.len());
    for secret in &rendered {
        if let Some(first) = owners.insert(secret.name.as_str(), secret) {
            return Err(TemplateError::NameCollision {
                name: secret.name.clone(),
                first: first.secret_key.clone().unwrap_or_default(),
                second: secret.secret_key.clone().unwrap_or_default(),
            });
        }
    }
    Ok(rendered)
}

/// Whether the recorded entries already hold exactly `rendered`
pub(crate) fn entries_match(association: &Association, rendered: &[RenderedSecret]) -> bool {
    association.entries.len() == rendered.len()
        && rendered.iter().all(|secret| {
            let digest = secret.digest();
            association.entries.iter().any(|entry| {
                entry.name == secret.name
                    && entry.status == SyncStatus::Synced
                    && entry.digest.as_deref() == Some(digest.as_str())
            })
        })
}

/// Keep the more severe of two failures; the earlier one wins a tie
fn merge_failure(current: Option<DestinationError>, next: DestinationError) -> Option<DestinationError> {
    match current {
        Some(current) if current.class.worst(next.class) == current.class => Some(current),
        _ => Some(next),
    }
}

fn failed_entry(entry: EntryState, err: &DestinationError) -> EntryState {
    EntryState {
        status: err.status(),
        error_code: Some(err.code.clone()),
        last_status_change: Utc::now(),
        ..entry
    }
}

/// Executes sync operations
pub struct Executor {
    store: Arc<AssociationStore>,
    registry: Arc<AdapterRegistry>,
    source: Arc<dyn SecretSource>,
    client_counter: Arc<dyn ClientCounter>,
    retry: RetryController,
    /// Secrets already reported to the client counter
    counted: Mutex<HashSet<(String, String)>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("retry", self.retry.policy())
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        store: Arc<AssociationStore>,
        registry: Arc<AdapterRegistry>,
        source: Arc<dyn SecretSource>,
        client_counter: Arc<dyn ClientCounter>,
        retry: RetryController,
    ) -> Self {
        Self {
            store,
            registry,
            source,
            client_counter,
            retry,
            counted: Mutex::new(HashSet::new()),
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
    pub fn source(&self) -> &Arc<dyn SecretSource> {
        &self.source
    }

    /// Run `operation` and record its outcome; returns the resulting status
    ///
    /// Errors only when the association is gone, a state transition is refused, or
    /// shutdown interrupted a retry (the association then stays `PENDING`).
    pub async fn execute(&self, operation: &mut SyncOperation) -> Result<SyncStatus> {
        let span = info_span!(
            "sync.operation",
            association = %operation.key,
            operation = operation.kind.as_str(),
            trigger = operation.trigger.as_str(),
            operation.id = %operation.id,
            status = field::Empty,
            attempts = field::Empty,
        );
        let start = Instant::now();
        let kind = operation.kind;
        let result = self.execute_inner(operation).instrument(span.clone()).await;

        span.record("attempts", operation.attempt_count);
        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(status) => {
                span.record("status", status.as_str());
                metrics::record_operation(kind.as_str(), status.as_str(), elapsed);
            }
            Err(SyncError::ShuttingDown) => {
                metrics::record_operation(kind.as_str(), "cancelled", elapsed);
            }
            Err(_) => {
                metrics::record_operation(kind.as_str(), "aborted", elapsed);
            }
        }
        result
    }

    async fn execute_inner(&self, operation: &mut SyncOperation) -> Result<SyncStatus> {
        let key = operation.key.clone();
        let association = self
            .store
            .get(&key)
            .ok_or_else(|| SyncError::NotFound(format!("association {key}")))?;

        let unsync_requested = match (operation.trigger, operation.kind) {
            (TriggerSource::Manual, OperationKind::Unsync) => true,
            (TriggerSource::Manual, _) => false,
            _ => association.unsync_requested,
        };
        if unsync_requested != association.unsync_requested {
            self.store
                .update_with(&key, |record| record.unsync_requested = unsync_requested)?;
        }
        let kind = if association.pending_deletion
            || (unsync_requested && operation.kind == OperationKind::Sync)
        {
            OperationKind::Unsync
        } else {
            operation.kind
        };
        if association.status != SyncStatus::Pending {
            self.store.set_status(&key, SyncStatus::Pending, None)?;
        }

        let Some(destination) = self.store.get_destination(&key.destination) else {
            let err = DestinationError::internal(
                "destination_missing",
                format!("destination {} is not configured", key.destination),
            );
            return self.record(&key, Outcome::Failed(err), &association.secret);
        };
        let adapter = match self.registry.adapter_for(&destination).await {
            Ok(adapter) => adapter,
            Err(err) => return self.record(&key, Outcome::Failed(err), &association.secret),
        };

        debug!(operation = kind.as_str(), "Executing operation");
        let outcome = match kind {
            OperationKind::Sync => self.sync(operation, &association, adapter.as_ref()).await?,
            OperationKind::Unsync => self.unsync(operation, &association, adapter.as_ref()).await?,
            OperationKind::Recreate => {
                self.recreate(operation, &association, &destination, adapter.as_ref())
                    .await?
            }
        };
        self.record(&key, outcome, &association.secret)
    }

    /// Write the current secret version
    async fn sync(
        &self,
        operation: &mut SyncOperation,
        association: &Association,
        adapter: &dyn DestinationAdapter,
    ) -> Result<Outcome> {
        let secret = &association.secret;
        let data = match self
            .source
            .get_secret_version(&secret.mount_accessor, &secret.secret_path)
            .await
        {
            Ok(Some(data)) => data,
            Ok(None) => {
                info!("Secret no longer exists at the source, removing external copies");
                return self.unsync(operation, association, adapter).await;
            }
            Err(e) => {
                return Ok(Outcome::Failed(DestinationError::internal(
                    "source_read",
                    format!("{e:#}"),
                )))
            }
        };

        let rendered = match render_secrets(association, &data, adapter.supports_multi_value()) {
            Ok(rendered) => rendered,
            Err(e) => {
                return Ok(Outcome::Failed(DestinationError::client_side(
                    e.code(),
                    e.to_string(),
                )))
            }
        };

        let mut entries = Vec::with_capacity(rendered.len());
        let mut failure = None;
        for payload in &rendered {
            let previous = association
                .entries
                .iter()
                .find(|entry| entry.name == payload.name);
            let result = match self
                .call(operation, || adapter.put(&payload.name, payload))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    // Names not rewritten yet still hold their previous copies
                    let untouched = association
                        .entries
                        .iter()
                        .filter(|entry| {
                            !entries.iter().any(|done: &EntryState| done.name == entry.name)
                        })
                        .cloned()
                        .collect::<Vec<_>>();
                    entries.extend(untouched);
                    return Err(self.record_interrupted(&association.key, entries, e));
                }
            };
            match result {
                Ok(()) => {
                    if previous.is_none() {
                        if let Err(e) = adapter.tag_synced_secret(&payload.name).await {
                            warn!(
                                secret.name = %payload.name,
                                error.code = %e.code,
                                "Failed to tag synced secret: {}",
                                e.message
                            );
                        }
                    }
                    entries.push(EntryState {
                        secret_key: payload.secret_key.clone(),
                        name: payload.name.clone(),
                        status: SyncStatus::Synced,
                        error_code: None,
                        last_status_change: Utc::now(),
                        digest: Some(payload.digest()),
                    });
                }
                Err(e) => {
                    let entry = EntryState {
                        secret_key: payload.secret_key.clone(),
                        name: payload.name.clone(),
                        status: SyncStatus::Pending,
                        error_code: None,
                        last_status_change: Utc::now(),
                        digest: previous.and_then(|entry| entry.digest.clone()),
                    };
                    entries.push(failed_entry(entry, &e));
                    failure = merge_failure(failure, e);
                }
            }
        }

        let wanted: HashSet<&str> = rendered.iter().map(|payload| payload.name.as_str()).collect();
        let stale_entries: Vec<&EntryState> = association
            .entries
            .iter()
            .filter(|entry| !wanted.contains(entry.name.as_str()))
            .collect();
        for (index, &stale) in stale_entries.iter().enumerate() {
            let result = match self.call(operation, || adapter.delete(&stale.name)).await {
                Ok(result) => result,
                Err(e) => {
                    entries.extend(stale_entries[index..].iter().map(|&entry| entry.clone()));
                    return Err(self.record_interrupted(&association.key, entries, e));
                }
            };
            match result {
                Ok(()) => debug!(secret.name = %stale.name, "Removed stale external secret"),
                Err(e) => {
                    entries.push(failed_entry(stale.clone(), &e));
                    failure = merge_failure(failure, e);
                }
            }
        }

        let complete = failure.is_none();
        let version = data.version;
        self.store.update_with(&association.key, |record| {
            record.entries = entries;
            if complete {
                record.secret_version = Some(version);
            }
        })?;
        Ok(Outcome::from_failure(failure, Outcome::Synced))
    }

    /// Delete every recorded external entry
    async fn unsync(
        &self,
        operation: &mut SyncOperation,
        association: &Association,
        adapter: &dyn DestinationAdapter,
    ) -> Result<Outcome> {
        let mut remaining = Vec::new();
        let mut failure = None;
        for (index, entry) in association.entries.iter().enumerate() {
            let result = match self.call(operation, || adapter.delete(&entry.name)).await {
                Ok(result) => result,
                Err(e) => {
                    remaining.extend(association.entries[index..].iter().cloned());
                    return Err(self.record_interrupted(&association.key, remaining, e));
                }
            };
            match result {
                Ok(()) => info!(secret.name = %entry.name, "Removed external secret"),
                Err(e) => {
                    remaining.push(failed_entry(entry.clone(), &e));
                    failure = merge_failure(failure, e);
                }
            }
        }

        let cleared = failure.is_none();
        self.store.update_with(&association.key, |record| {
            record.entries = remaining;
            if cleared {
                record.secret_version = None;
            }
        })?;
        Ok(Outcome::from_failure(failure, Outcome::Unsynced))
    }

    /// Move the external copies to the destination's current naming
    async fn recreate(
        &self,
        operation: &mut SyncOperation,
        association: &Association,
        destination: &Destination,
        adapter: &dyn DestinationAdapter,
    ) -> Result<Outcome> {
        if let Outcome::Failed(e) = self.unsync(operation, association, adapter).await? {
            // Old names must be gone before new ones appear
            return Ok(Outcome::Failed(e));
        }

        let snapshot = TemplateSnapshot {
            template: destination
                .effective_template(destination.granularity)
                .to_string(),
            granularity: destination.granularity,
        };
        if let Err(e) = validate_template(&snapshot.template, snapshot.granularity) {
            return Ok(Outcome::Failed(DestinationError::client_side(
                "invalid_template",
                e.to_string(),
            )));
        }
        info!(
            template = %snapshot.template,
            granularity = %snapshot.granularity,
            "Adopting destination naming"
        );
        let refreshed = self.store.update_with(&association.key, |record| {
            record.template_version = snapshot;
            record.clone()
        })?;
        self.sync(operation, &refreshed, adapter).await
    }

    /// One adapter call through the retry controller
    ///
    /// The outer error is shutdown; the inner one the classified failure.
    async fn call<F, Fut>(
        &self,
        operation: &mut SyncOperation,
        call: F,
    ) -> Result<AdapterResult<()>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<()>>,
    {
        let store = &self.store;
        let result = self
            .retry
            .run(operation, call, |operation| {
                if let Err(e) = store.set_status(&operation.key, SyncStatus::Pending, None) {
                    warn!(association = %operation.key, "Failed to re-stamp PENDING: {}", e);
                }
            })
            .await;
        match result {
            Ok(()) => Ok(Ok(())),
            Err(RetryError::Failed(e)) => Ok(Err(e)),
            Err(RetryError::Cancelled) => Err(SyncError::ShuttingDown),
        }
    }

    /// Keep the entries an interrupted operation leaves behind, then hand back `err`
    ///
    /// The association stays `PENDING`; the next run picks up from these entries.
    fn record_interrupted(
        &self,
        key: &AssociationKey,
        entries: Vec<EntryState>,
        err: SyncError,
    ) -> SyncError {
        info!(association = %key, entries = entries.len(), "Operation interrupted, keeping written entries");
        if let Err(e) = self.store.update_with(key, |record| record.entries = entries) {
            warn!(association = %key, "Failed to record interrupted operation: {}", e);
        }
        err
    }

    /// Persist the outcome and finish pending removals
    fn record(&self, key: &AssociationKey, outcome: Outcome, secret: &SecretRef) -> Result<SyncStatus> {
        let (status, error_code) = match &outcome {
            Outcome::Synced => (SyncStatus::Synced, None),
            Outcome::Unsynced => (SyncStatus::Unsynced, None),
            Outcome::Failed(e) => (e.status(), Some(e.code.clone())),
        };
        let association = self.store.set_status(key, status, error_code)?;

        match &outcome {
            Outcome::Synced => {
                info!(association = %key, "Association synced");
                self.count_secret(secret);
            }
            Outcome::Unsynced => {
                info!(association = %key, "Association unsynced");
                if association.pending_deletion {
                    self.finish_removal(key)?;
                }
            }
            Outcome::Failed(e) => {
                warn!(
                    association = %key,
                    status = status.as_str(),
                    error.code = %e.code,
                    "Operation failed: {}",
                    e.message
                );
            }
        }
        Ok(status)
    }

    fn count_secret(&self, secret: &SecretRef) {
        let first = self
            .counted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((secret.mount_accessor.clone(), secret.secret_path.clone()));
        if first {
            self.client_counter.record_synced_secret(secret);
        }
    }

    /// Drop an unsynced association and, when it was the last one of a
    /// deleting destination, the destination too
    fn finish_removal(&self, key: &AssociationKey) -> Result<()> {
        self.store.remove(key)?;
        let Some(destination) = self.store.get_destination(&key.destination) else {
            return Ok(());
        };
        if !destination.deleting || !self.store.list(&destination.id).is_empty() {
            return Ok(());
        }
        match self.store.remove_destination(&destination.id) {
            Ok(_) => {
                self.registry.invalidate(&destination.id);
                info!(destination = %destination.id, "Destination deletion completed");
                Ok(())
            }
            // Another worker finished the cascade first, or a new association raced in
            Err(SyncError::NotFound(_) | SyncError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::retry::RetryPolicy;
    use crate::error::FailureClass;
    use crate::model::{DestinationId, DestinationType, DestinationUpdate};
    use crate::provider::{MemoryDestination, SharedAdapter};
    use crate::source::{authorize, DistinctClientCounter, MemorySecretStore, StaticAuthorizer};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        store: Arc<AssociationStore>,
        source: Arc<MemorySecretStore>,
        destination: Arc<MemoryDestination>,
        counter: Arc<DistinctClientCounter>,
        executor: Executor,
        shutdown: watch::Sender<bool>,
    }

    fn destination_id() -> DestinationId {
        DestinationId::new(DestinationType::InMem, "mem")
    }

    fn harness(destination: Destination, multi_value: bool) -> Harness {
        let store = Arc::new(AssociationStore::new());
        store.create_destination(destination).unwrap();
        let memory = Arc::new(MemoryDestination::with_multi_value(multi_value));
        let mut registry = AdapterRegistry::new();
        registry.register(SharedAdapter::new(
            DestinationType::InMem,
            Arc::clone(&memory) as Arc<dyn DestinationAdapter>,
        ));
        let source = Arc::new(MemorySecretStore::new());
        let counter = Arc::new(DistinctClientCounter::new());
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter_ratio: 0.0,
            max_external_attempts: 3,
            max_internal_attempts: 2,
        };
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::clone(&source) as Arc<dyn SecretSource>,
            Arc::clone(&counter) as Arc<dyn ClientCounter>,
            RetryController::new(policy, rx),
        );
        Harness {
            store,
            source,
            destination: memory,
            counter,
            executor,
            shutdown: tx,
        }
    }

    async fn associate(h: &Harness, path: &str, granularity: Option<Granularity>) -> AssociationKey {
        let secret = SecretRef::new("kv_1234", path);
        let authorizer = StaticAuthorizer::new().allow_all("ops");
        let grant = authorize(&authorizer, "ops", &secret).await.unwrap();
        h.store
            .create(&grant, &destination_id(), secret, granularity)
            .unwrap()
            .key
    }

    async fn run(h: &Harness, key: &AssociationKey, kind: OperationKind) -> SyncStatus {
        let mut op = SyncOperation::new(key.clone(), kind, TriggerSource::Manual);
        h.executor.execute(&mut op).await.unwrap()
    }

    #[tokio::test]
    async fn test_sync_secret_path_writes_structured_json() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"user": "admin"}));

        assert_eq!(run(&h, &key, OperationKind::Sync).await, SyncStatus::Synced);

        let stored = h.destination.get("vault/kv_1234/app/db").unwrap();
        assert!(stored.structured);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&stored.value).unwrap(), json!({"user": "admin"}));
        assert!(stored.tags.contains_key(crate::constants::SYNCED_SECRET_TAG_KEY));

        let association = h.store.get(&key).unwrap();
        assert_eq!(association.secret_version, Some(1));
        assert_eq!(association.entries.len(), 1);
        assert!(association.error_code.is_none());
    }

    #[tokio::test]
    async fn test_single_value_destination_gets_plain_json_text() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), false);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));

        run(&h, &key, OperationKind::Sync).await;
        let stored = h.destination.get("vault/kv_1234/app/db").unwrap();
        assert!(!stored.structured);
        assert_eq!(stored.value, r#"{"a":"1"}"#);
    }

    #[tokio::test]
    async fn test_secret_key_removes_dropped_keys() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app", Some(Granularity::SecretKey)).await;
        h.source.put("kv_1234", "app", json!({"a": "1", "b": "2"}));
        run(&h, &key, OperationKind::Sync).await;
        assert_eq!(
            h.destination.names(),
            vec!["vault/kv_1234/app_a", "vault/kv_1234/app_b"]
        );

        h.source.put("kv_1234", "app", json!({"a": "3"}));
        assert_eq!(run(&h, &key, OperationKind::Sync).await, SyncStatus::Synced);
        assert_eq!(h.destination.names(), vec!["vault/kv_1234/app_a"]);
        assert_eq!(h.destination.value("vault/kv_1234/app_a").as_deref(), Some("3"));
        assert_eq!(h.store.get(&key).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_colliding_entry_names_fail_before_writing() {
        let h = harness(
            Destination::new(DestinationType::InMem, "mem")
                .with_granularity(Granularity::SecretKey)
                .with_template("{{ .SecretKey | lowercase }}"),
            true,
        );
        let key = associate(&h, "app", Some(Granularity::SecretKey)).await;
        h.source.put("kv_1234", "app", json!({"Token": "1", "token": "2", "user": "3"}));

        assert_eq!(
            run(&h, &key, OperationKind::Sync).await,
            SyncStatus::ClientSideError
        );
        let association = h.store.get(&key).unwrap();
        assert_eq!(association.error_code.as_deref(), Some("name_collision"));
        assert!(association.entries.is_empty());
        assert!(association.secret_version.is_none());
        assert_eq!(h.destination.write_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_sync_keeps_written_entries() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app", Some(Granularity::SecretKey)).await;
        h.source.put("kv_1234", "app", json!({"a": "1", "b": "2"}));
        h.destination.reject(
            "vault/kv_1234/app_b",
            DestinationError::external("http_503", "unavailable"),
        );
        h.shutdown.send_replace(true);

        let mut op = SyncOperation::new(key.clone(), OperationKind::Sync, TriggerSource::Manual);
        let err = h.executor.execute(&mut op).await.unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
        assert_eq!(h.destination.names(), vec!["vault/kv_1234/app_a"]);

        let association = h.store.get(&key).unwrap();
        assert_eq!(association.status, SyncStatus::Pending);
        assert!(association.secret_version.is_none());
        assert_eq!(association.entries.len(), 1);
        assert_eq!(association.entries[0].name, "vault/kv_1234/app_a");
        assert_eq!(association.entries[0].status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_shutdown_mid_unsync_keeps_undeleted_entries() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app", Some(Granularity::SecretKey)).await;
        h.source.put("kv_1234", "app", json!({"a": "1", "b": "2"}));
        run(&h, &key, OperationKind::Sync).await;

        h.destination.reject(
            "vault/kv_1234/app_b",
            DestinationError::external("http_503", "unavailable"),
        );
        h.shutdown.send_replace(true);
        let mut op = SyncOperation::new(key.clone(), OperationKind::Unsync, TriggerSource::Manual);
        assert!(h.executor.execute(&mut op).await.is_err());

        let association = h.store.get(&key).unwrap();
        assert_eq!(association.status, SyncStatus::Pending);
        let names: Vec<_> = association.entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["vault/kv_1234/app_b"]);
        assert_eq!(h.destination.names(), vec!["vault/kv_1234/app_b"]);

        // A later run only has the leftover entry to remove
        h.destination.accept("vault/kv_1234/app_b");
        h.shutdown.send_replace(false);
        assert_eq!(run(&h, &key, OperationKind::Unsync).await, SyncStatus::Unsynced);
        assert!(h.destination.names().is_empty());
        assert_eq!(h.destination.delete_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_secret_unsyncs() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        run(&h, &key, OperationKind::Sync).await;

        h.source.delete("kv_1234", "app/db");
        assert_eq!(run(&h, &key, OperationKind::Sync).await, SyncStatus::Unsynced);
        assert!(h.destination.names().is_empty());
        let association = h.store.get(&key).unwrap();
        assert!(association.entries.is_empty());
        assert!(association.secret_version.is_none());
    }

    #[tokio::test]
    async fn test_recreate_moves_to_new_template() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        run(&h, &key, OperationKind::Sync).await;

        h.store
            .update_destination(
                &destination_id(),
                DestinationUpdate {
                    secret_name_template: Some(Some("{{ .SecretBaseName | uppercase }}".into())),
                    ..DestinationUpdate::default()
                },
            )
            .unwrap();

        // Template changes are not retroactive
        run(&h, &key, OperationKind::Sync).await;
        assert_eq!(h.destination.names(), vec!["vault/kv_1234/app/db"]);

        assert_eq!(run(&h, &key, OperationKind::Recreate).await, SyncStatus::Synced);
        assert_eq!(h.destination.names(), vec!["DB"]);
        assert_eq!(
            h.store.get(&key).unwrap().template_version.template,
            "{{ .SecretBaseName | uppercase }}"
        );
    }

    #[tokio::test]
    async fn test_client_side_failure_recorded_without_retry() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        h.destination
            .fail_times(2, DestinationError::client_side("http_403", "denied"));

        assert_eq!(
            run(&h, &key, OperationKind::Sync).await,
            SyncStatus::ClientSideError
        );
        let association = h.store.get(&key).unwrap();
        assert_eq!(association.error_code.as_deref(), Some("http_403"));
        assert!(association.secret_version.is_none());
        assert_eq!(association.entries[0].status, SyncStatus::ClientSideError);
        assert_eq!(h.destination.put_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_sets_external_error() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        h.destination
            .fail_times(3, DestinationError::external("http_503", "unavailable"));

        let mut op = SyncOperation::new(key.clone(), OperationKind::Sync, TriggerSource::Manual);
        let status = h.executor.execute(&mut op).await.unwrap();
        assert_eq!(status, SyncStatus::ExternalServiceError);
        assert_eq!(op.attempt_count, 3);
        assert_eq!(
            h.store.get(&key).unwrap().error_code.as_deref(),
            Some("http_503")
        );
        assert_eq!(FailureClass::ExternalService.status(), status);
    }

    #[tokio::test]
    async fn test_client_counter_notified_once_per_secret() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        run(&h, &key, OperationKind::Sync).await;
        h.source.put("kv_1234", "app/db", json!({"a": "2"}));
        run(&h, &key, OperationKind::Sync).await;
        assert_eq!(h.counter.count(), 1);
    }

    #[tokio::test]
    async fn test_pending_deletion_removes_association_and_destination() {
        let h = harness(Destination::new(DestinationType::InMem, "mem"), true);
        let key = associate(&h, "app/db", None).await;
        h.source.put("kv_1234", "app/db", json!({"a": "1"}));
        run(&h, &key, OperationKind::Sync).await;

        h.store.mark_destination_deleting(&destination_id()).unwrap();
        h.store.mark_for_deletion(&key).unwrap();
        assert_eq!(run(&h, &key, OperationKind::Sync).await, SyncStatus::Unsynced);

        assert!(h.store.get(&key).is_none());
        assert!(h.store.get_destination(&destination_id()).is_none());
        assert!(h.destination.names().is_empty());
    }

    #[test]
    fn test_render_rejects_keys_that_sanitize_alike() {
        let mut data = serde_json::Map::new();
        data.insert("db.password".into(), json!("1"));
        data.insert("db_password".into(), json!("2"));
        let data = SecretData::new(3, data);
        let association = Association::new(
            DestinationId::new(DestinationType::GcpSm, "gcp"),
            SecretRef::new("kv", "app"),
            TemplateSnapshot {
                template: Granularity::SecretKey.default_template().to_string(),
                granularity: Granularity::SecretKey,
            },
        );

        let err = render_secrets(&association, &data, false).unwrap_err();
        assert_eq!(err.code(), "name_collision");
        assert!(err.to_string().contains("vault_kv_app_db_password"), "{err}");
    }

    #[test]
    fn test_entries_match_requires_synced_digests() {
        let mut data = serde_json::Map::new();
        data.insert("a".into(), json!("1"));
        let data = SecretData::new(1, data);
        let mut association = Association::new(
            destination_id(),
            SecretRef::new("kv", "app"),
            TemplateSnapshot {
                template: Granularity::SecretPath.default_template().to_string(),
                granularity: Granularity::SecretPath,
            },
        );
        let rendered = render_secrets(&association, &data, true).unwrap();
        assert!(!entries_match(&association, &rendered));

        association.entries.push(EntryState {
            secret_key: None,
            name: rendered[0].name.clone(),
            status: SyncStatus::Synced,
            error_code: None,
            last_status_change: Utc::now(),
            digest: Some(rendered[0].digest()),
        });
        assert!(entries_match(&association, &rendered));

        let flat = render_secrets(&association, &data, false).unwrap();
        assert!(!entries_match(&association, &flat));
    }
}
