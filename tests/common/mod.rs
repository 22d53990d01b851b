//! Common test utilities for engine integration tests
//!
//! Builds an engine over in-memory collaborators with fast retries, plus
//! helpers to wait for asynchronous status changes.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use secrets_sync::prelude::*;
use secrets_sync::provider::{MemoryDestination, SharedAdapter};
use secrets_sync::source::{DistinctClientCounter, MemorySecretStore, StaticAuthorizer};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

pub const ACCESSOR: &str = "kv_1234";
pub const PRINCIPAL: &str = "ops";

/// Install a test subscriber once per binary; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "secrets_sync=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Config with millisecond backoff so retry tests run fast
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        worker_count: 4,
        backoff_base_ms: 1,
        backoff_cap_ms: 8,
        backoff_jitter_ratio: 0.0,
        shutdown_grace_secs: 5,
        enable_metrics: false,
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub secrets: Arc<MemorySecretStore>,
    pub destination: Arc<MemoryDestination>,
    pub counter: Arc<DistinctClientCounter>,
}

impl Harness {
    /// Engine whose `kind` destinations are all backed by one in-memory map
    pub fn new(kind: DestinationType) -> Self {
        Self::with_destination(kind, MemoryDestination::new())
    }

    pub fn with_destination(kind: DestinationType, destination: MemoryDestination) -> Self {
        init_tracing();
        let secrets = Arc::new(MemorySecretStore::new());
        let destination = Arc::new(destination);
        let counter = Arc::new(DistinctClientCounter::new());

        let mut registry = AdapterRegistry::new();
        registry.register(SharedAdapter::new(
            kind,
            Arc::clone(&destination) as Arc<dyn DestinationAdapter>,
        ));

        let engine = SyncEngine::new(
            &fast_config(),
            Arc::new(AssociationStore::new()),
            Arc::new(registry),
            Collaborators {
                source: Arc::clone(&secrets) as Arc<dyn SecretSource>,
                authorizer: Arc::new(StaticAuthorizer::new().allow_all(PRINCIPAL)),
                client_counter: Arc::clone(&counter) as Arc<dyn ClientCounter>,
            },
        );

        Self {
            engine,
            secrets,
            destination,
            counter,
        }
    }

    /// Start the engine on the secret store's change feed
    pub fn start(&self) {
        self.engine.start(self.secrets.subscribe());
    }

    pub async fn associate(&self, destination: &DestinationId, path: &str) -> AssociationKey {
        self.engine
            .create_association(
                PRINCIPAL,
                AssociationRequest::new(destination.clone(), SecretRef::new(ACCESSOR, path)),
            )
            .await
            .unwrap()
            .key
    }

    /// Poll until the association reaches `status`
    pub async fn wait_for_status(&self, key: &AssociationKey, status: SyncStatus) -> Association {
        let engine = &self.engine;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(association) = engine.get_association(key) {
                    if association.status == status {
                        return association;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "association {key} did not reach {status}, last seen {:?}",
                engine.get_association(key).map(|a| a.status)
            )
        })
    }

    /// Poll until `condition` holds
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }
}
