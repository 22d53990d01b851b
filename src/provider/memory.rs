//! # In-Memory Destination
//!
//! Process-local destination used for embedding and tests. Records every
//! write so callers can assert on what reached the "external" side, and can be
//! told to fail upcoming calls with a chosen error.

use crate::constants::{SYNCED_SECRET_TAG_KEY, SYNCED_SECRET_TAG_VALUE};
use crate::error::DestinationError;
use crate::model::{Destination, DestinationType, RenderedSecret};
use crate::provider::common::parse_config;
use crate::provider::{AdapterFactory, AdapterResult, DestinationAdapter};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A secret as stored by [`MemoryDestination`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub value: String,
    pub structured: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    secrets: BTreeMap<String, StoredSecret>,
    puts: usize,
    deletes: usize,
    failures: VecDeque<DestinationError>,
    /// Names whose every call fails
    rejected: BTreeMap<String, DestinationError>,
    latency: Option<Duration>,
}

/// Destination backed by a map
#[derive(Debug)]
pub struct MemoryDestination {
    multi_value: bool,
    state: Mutex<MemoryState>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    /// Multi-value capable destination
    #[must_use]
    pub fn new() -> Self {
        Self::with_multi_value(true)
    }

    #[must_use]
    pub fn with_multi_value(multi_value: bool) -> Self {
        Self {
            multi_value,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Poisoning only happens if a test panicked mid-call; the map is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next call with `error`
    pub fn fail_next(&self, error: DestinationError) {
        self.fail_times(1, error);
    }

    /// Fail the next `times` calls with `error`
    pub fn fail_times(&self, times: usize, error: DestinationError) {
        let mut state = self.state();
        for _ in 0..times {
            state.failures.push_back(error.clone());
        }
    }

    /// Fail every call for `name` with `error` until [`MemoryDestination::accept`]
    pub fn reject(&self, name: &str, error: DestinationError) {
        self.state().rejected.insert(name.to_string(), error);
    }

    pub fn accept(&self, name: &str) {
        self.state().rejected.remove(name);
    }

    /// Delay every call, e.g. to keep an operation in flight during a test
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<StoredSecret> {
        self.state().secrets.get(name).cloned()
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.get(name).map(|secret| secret.value)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state().secrets.contains_key(name)
    }

    /// Stored secret names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state().secrets.keys().cloned().collect()
    }

    #[must_use]
    pub fn put_count(&self) -> usize {
        self.state().puts
    }

    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.state().deletes
    }

    /// Successful puts plus deletes
    #[must_use]
    pub fn write_count(&self) -> usize {
        let state = self.state();
        state.puts + state.deletes
    }

    /// Remove a secret without going through the adapter, as an out-of-band change would
    pub fn remove_out_of_band(&self, name: &str) -> Option<StoredSecret> {
        self.state().secrets.remove(name)
    }

    async fn begin_call(&self, name: &str) -> AdapterResult<()> {
        let (latency, failure) = {
            let mut state = self.state();
            let failure = match state.rejected.get(name) {
                Some(error) => Some(error.clone()),
                None => state.failures.pop_front(),
            };
            (state.latency, failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DestinationAdapter for MemoryDestination {
    fn destination_type(&self) -> DestinationType {
        DestinationType::InMem
    }

    fn supports_multi_value(&self) -> bool {
        self.multi_value
    }

    async fn put(&self, name: &str, secret: &RenderedSecret) -> AdapterResult<()> {
        self.begin_call(name).await?;
        let mut state = self.state();
        let tags = state
            .secrets
            .remove(name)
            .map(|existing| existing.tags)
            .unwrap_or_default();
        state.secrets.insert(
            name.to_string(),
            StoredSecret {
                value: secret.value.to_string(),
                structured: secret.structured,
                tags,
            },
        );
        state.puts += 1;
        Ok(())
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        self.begin_call(name).await?;
        let mut state = self.state();
        if state.secrets.remove(name).is_some() {
            state.deletes += 1;
        }
        Ok(())
    }

    async fn tag_synced_secret(&self, name: &str) -> AdapterResult<()> {
        let mut state = self.state();
        match state.secrets.get_mut(name) {
            Some(secret) => {
                secret.tags.insert(
                    SYNCED_SECRET_TAG_KEY.to_string(),
                    SYNCED_SECRET_TAG_VALUE.to_string(),
                );
                Ok(())
            }
            None => Err(DestinationError::client_side(
                "not_found",
                format!("cannot tag missing secret {name}"),
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemorySettings {
    multi_value: Option<bool>,
}

/// Builds a fresh [`MemoryDestination`] per `in-mem` destination
#[derive(Debug, Default)]
pub struct MemoryFactory;

#[async_trait]
impl AdapterFactory for MemoryFactory {
    fn destination_type(&self) -> DestinationType {
        DestinationType::InMem
    }

    fn validate(&self, destination: &Destination) -> Result<()> {
        parse_config::<MemorySettings>(destination).map(|_| ())
    }

    async fn build(&self, destination: &Destination) -> Result<Arc<dyn DestinationAdapter>> {
        let settings: MemorySettings = parse_config(destination)?;
        Ok(Arc::new(MemoryDestination::with_multi_value(
            settings.multi_value.unwrap_or(true),
        )))
    }
}
