//! # Adapter Registry
//!
//! Maps destination type tags to [`AdapterFactory`] implementations and caches
//! built adapters per destination. A cached adapter is reused until the
//! destination's `config_version` changes or it is invalidated.

use crate::error::{DestinationError, SyncError};
use crate::model::{Destination, DestinationId, DestinationType};
use crate::provider::aws::AwsFactory;
use crate::provider::azure::AzureFactory;
use crate::provider::gcp::GcpFactory;
use crate::provider::memory::MemoryFactory;
use crate::provider::DestinationAdapter;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Builds adapters for one destination type
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn destination_type(&self) -> DestinationType;

    /// Check a destination's config without connecting anywhere
    fn validate(&self, _destination: &Destination) -> Result<()> {
        Ok(())
    }

    async fn build(&self, destination: &Destination) -> Result<Arc<dyn DestinationAdapter>>;
}

/// Factory handing out one pre-built adapter for every destination of a type
///
/// Lets embedders and tests observe exactly what reaches a destination.
pub struct SharedAdapter {
    kind: DestinationType,
    adapter: Arc<dyn DestinationAdapter>,
}

impl SharedAdapter {
    pub fn new(kind: DestinationType, adapter: Arc<dyn DestinationAdapter>) -> Self {
        Self { kind, adapter }
    }
}

#[async_trait]
impl AdapterFactory for SharedAdapter {
    fn destination_type(&self) -> DestinationType {
        self.kind
    }

    async fn build(&self, _destination: &Destination) -> Result<Arc<dyn DestinationAdapter>> {
        Ok(Arc::clone(&self.adapter))
    }
}

struct CachedAdapter {
    config_version: u64,
    adapter: Arc<dyn DestinationAdapter>,
}

/// Type-tag registry with a per-destination adapter cache
pub struct AdapterRegistry {
    factories: HashMap<DestinationType, Arc<dyn AdapterFactory>>,
    cache: Mutex<HashMap<DestinationId, CachedAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterRegistry")
            .field("factories", &kinds)
            .finish_non_exhaustive()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry with no factories
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with every built-in destination type
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(AwsFactory);
        registry.register(GcpFactory);
        registry.register(AzureFactory);
        registry.register(MemoryFactory);
        registry
    }

    /// Register a factory, replacing any existing one for the same type
    pub fn register(&mut self, factory: impl AdapterFactory + 'static) -> &mut Self {
        self.factories
            .insert(factory.destination_type(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn supports(&self, kind: DestinationType) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Validate a destination before it is stored
    pub fn validate(&self, destination: &Destination) -> Result<(), SyncError> {
        let factory = self.factory(destination.id.kind).ok_or_else(|| {
            SyncError::InvalidDestination {
                destination: destination.id.to_string(),
                reason: format!("no adapter registered for type {}", destination.id.kind),
            }
        })?;
        factory
            .validate(destination)
            .map_err(|e| SyncError::InvalidDestination {
                destination: destination.id.to_string(),
                reason: format!("{e:#}"),
            })
    }

    /// Adapter for a destination, built on first use or after a config change
    pub async fn adapter_for(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn DestinationAdapter>, DestinationError> {
        if let Some(adapter) = self.cached(destination) {
            return Ok(adapter);
        }

        let factory = self.factory(destination.id.kind).ok_or_else(|| {
            DestinationError::client_side(
                "unsupported_destination",
                format!("no adapter registered for type {}", destination.id.kind),
            )
        })?;

        debug!(destination = %destination.id, "Building destination adapter");
        let adapter = factory.build(destination).await.map_err(|e| {
            DestinationError::internal("adapter_init", format!("{e:#}"))
        })?;

        self.lock_cache().insert(
            destination.id.clone(),
            CachedAdapter {
                config_version: destination.config_version,
                adapter: Arc::clone(&adapter),
            },
        );
        info!(
            destination = %destination.id,
            config_version = destination.config_version,
            "Destination adapter ready"
        );
        Ok(adapter)
    }

    /// Drop the cached adapter for a destination
    pub fn invalidate(&self, id: &DestinationId) {
        self.lock_cache().remove(id);
    }

    fn cached(&self, destination: &Destination) -> Option<Arc<dyn DestinationAdapter>> {
        self.lock_cache()
            .get(&destination.id)
            .filter(|cached| cached.config_version == destination.config_version)
            .map(|cached| Arc::clone(&cached.adapter))
    }

    fn factory(&self, kind: DestinationType) -> Option<&Arc<dyn AdapterFactory>> {
        self.factories.get(&kind)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<DestinationId, CachedAdapter>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}
