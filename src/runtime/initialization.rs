//! # Initialization
//!
//! Tracing, metrics, probe server, association store, adapter registry and
//! engine construction.

use crate::config::SyncConfig;
use crate::constants::DEFAULT_ADMIN_PRINCIPAL;
use crate::controller::engine::{Collaborators, SyncEngine};
use crate::observability::{self, LogFormat};
use crate::provider::AdapterRegistry;
use crate::server::{start_server, ServerState};
use crate::source::{DistinctClientCounter, MemorySecretStore, StaticAuthorizer};
use crate::store::AssociationStore;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Components built by [`initialize`]
pub struct InitializationResult {
    pub engine: Arc<SyncEngine>,
    /// Secret store backing the engine and its change feed
    pub secrets: Arc<MemorySecretStore>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub server_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("engine", &self.engine)
            .field(
                "server_ready",
                &self
                    .server_state
                    .is_ready
                    .load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Reject a persisted association store when the secret source is not persistent
///
/// The standalone process reads secrets from an in-memory store that starts
/// empty. Restored associations would find every secret missing and the first
/// scan would delete their external copies. Persisting associations needs an
/// embedding application with a durable [`crate::source::SecretSource`].
fn check_store_source(config: &SyncConfig) -> Result<()> {
    if let Some(path) = &config.store_path {
        bail!(
            "store_path {} requires a persistent secret source, but this process only has \
             the in-memory one; unset SYNC_STORE_PATH or embed the engine with a durable source",
            path.display()
        );
    }
    Ok(())
}

/// Initialize the runtime
///
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Association store, in memory like the secret store
/// - Adapter registry with the built-in destination types
/// - Engine over the in-memory secret store
///
/// Refuses a configured `store_path`; see [`check_store_source`].
pub async fn initialize(config: &SyncConfig) -> Result<InitializationResult> {
    let log_format = config.log_format.parse::<LogFormat>();
    if let Err(e) = observability::init_tracing(
        &config.log_level,
        log_format.clone().unwrap_or_default(),
    ) {
        // An embedding application may own the subscriber
        warn!("Tracing subscriber init returned error (may already be initialized): {:#}", e);
    }
    if let Err(e) = log_format {
        warn!("{}, falling back to text", e);
    }
    check_store_source(config)?;

    info!("Starting secrets sync engine");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let server_state = Arc::new(ServerState::default());
    let server_handle = if config.enable_metrics {
        let state = Arc::clone(&server_state);
        let port = config.metrics_port;
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(port, state).await {
                error!("HTTP server error: {:#}", e);
            }
        }))
    } else {
        info!("Metrics server disabled");
        None
    };

    info!("Associations are kept in memory alongside the in-memory secret store");
    let store = AssociationStore::new();
    let registry = AdapterRegistry::with_builtin();

    let secrets = Arc::new(MemorySecretStore::new());
    let engine = Arc::new(SyncEngine::new(
        config,
        Arc::new(store),
        Arc::new(registry),
        Collaborators {
            source: Arc::clone(&secrets) as _,
            authorizer: Arc::new(StaticAuthorizer::new().allow_all(DEFAULT_ADMIN_PRINCIPAL)),
            client_counter: Arc::new(DistinctClientCounter::new()),
        },
    ));

    info!(
        workers = config.worker_count,
        scan_interval_secs = config.scan_interval_secs,
        "Engine initialized"
    );

    Ok(InitializationResult {
        engine,
        secrets,
        server_state,
        server_handle,
    })
}
