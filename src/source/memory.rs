//! # In-Memory Collaborators
//!
//! A versioned key/value store with a change feed, a static authorizer and a
//! counting client counter. Used by tests and by embedders without a real
//! secret store.

use crate::model::{SecretData, SecretRef};
use crate::source::{ChangeFeed, ClientCounter, ReadAuthorizer, SecretEvent, SecretSource};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

type SecretId = (String, String);

#[derive(Debug, Default)]
struct StoredVersion {
    version: u64,
    /// `None` after deletion; the version counter survives
    data: Option<Map<String, Value>>,
}

#[derive(Debug, Default)]
struct StoreState {
    secrets: HashMap<SecretId, StoredVersion>,
    subscribers: Vec<mpsc::UnboundedSender<SecretEvent>>,
}

/// Versioned key/value secret store with a change feed
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    state: Mutex<StoreState>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a new version and publish an event; returns the version
    ///
    /// Non-object values are stored under the key `value`.
    pub fn put(&self, mount_accessor: &str, secret_path: &str, data: Value) -> u64 {
        let (version, event) = self.write(mount_accessor, secret_path, data);
        self.publish(event);
        version
    }

    /// Write a new version without publishing, as a missed event would
    pub fn put_silently(&self, mount_accessor: &str, secret_path: &str, data: Value) -> u64 {
        self.write(mount_accessor, secret_path, data).0
    }

    /// Delete a secret and publish an event; returns whether it existed
    pub fn delete(&self, mount_accessor: &str, secret_path: &str) -> bool {
        let event = {
            let mut state = self.state();
            let id = (mount_accessor.to_string(), secret_path.to_string());
            match state.secrets.get_mut(&id) {
                Some(stored) if stored.data.is_some() => {
                    stored.data = None;
                    SecretEvent::deleted(mount_accessor, secret_path, stored.version)
                }
                _ => return false,
            }
        };
        self.publish(event);
        true
    }

    #[must_use]
    pub fn current_version(&self, mount_accessor: &str, secret_path: &str) -> Option<u64> {
        self.state()
            .secrets
            .get(&(mount_accessor.to_string(), secret_path.to_string()))
            .filter(|stored| stored.data.is_some())
            .map(|stored| stored.version)
    }

    fn write(&self, mount_accessor: &str, secret_path: &str, data: Value) -> (u64, SecretEvent) {
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let mut state = self.state();
        let stored = state
            .secrets
            .entry((mount_accessor.to_string(), secret_path.to_string()))
            .or_default();
        stored.version += 1;
        stored.data = Some(data);
        let version = stored.version;
        (
            version,
            SecretEvent::updated(mount_accessor, secret_path, version),
        )
    }

    fn publish(&self, event: SecretEvent) {
        self.state()
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl SecretSource for MemorySecretStore {
    async fn get_secret_version(
        &self,
        mount_accessor: &str,
        secret_path: &str,
    ) -> Result<Option<SecretData>> {
        let state = self.state();
        Ok(state
            .secrets
            .get(&(mount_accessor.to_string(), secret_path.to_string()))
            .and_then(|stored| {
                stored
                    .data
                    .as_ref()
                    .map(|data| SecretData::new(stored.version, data.clone()))
            }))
    }
}

impl ChangeFeed for MemorySecretStore {
    fn subscribe(&self) -> BoxStream<'static, SecretEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

/// Authorizer backed by a fixed allow list
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    /// `(principal, None)` allows every secret
    allowed: HashSet<(String, Option<SecretId>)>,
}

impl StaticAuthorizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow(mut self, principal: &str, mount_accessor: &str, secret_path: &str) -> Self {
        self.allowed.insert((
            principal.to_string(),
            Some((mount_accessor.to_string(), secret_path.to_string())),
        ));
        self
    }

    #[must_use]
    pub fn allow_all(mut self, principal: &str) -> Self {
        self.allowed.insert((principal.to_string(), None));
        self
    }
}

#[async_trait]
impl ReadAuthorizer for StaticAuthorizer {
    async fn check_read_capability(&self, principal: &str, secret: &SecretRef) -> Result<bool> {
        let specific = (
            principal.to_string(),
            Some((secret.mount_accessor.clone(), secret.secret_path.clone())),
        );
        Ok(self.allowed.contains(&specific)
            || self.allowed.contains(&(principal.to_string(), None)))
    }
}

/// Client counter that counts each distinct secret once
#[derive(Debug, Default)]
pub struct DistinctClientCounter {
    seen: Mutex<HashSet<SecretId>>,
}

impl DistinctClientCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ClientCounter for DistinctClientCounter {
    fn record_synced_secret(&self, secret: &SecretRef) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((secret.mount_accessor.clone(), secret.secret_path.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_versions_increase_across_delete() {
        let store = MemorySecretStore::new();
        assert_eq!(store.put("kv", "app", json!({"a": "1"})), 1);
        assert_eq!(store.put("kv", "app", json!({"a": "2"})), 2);
        assert!(store.delete("kv", "app"));
        assert!(!store.delete("kv", "app"));
        assert!(store.get_secret_version("kv", "app").await.unwrap().is_none());
        assert_eq!(store.put("kv", "app", json!({"a": "3"})), 3);

        let current = store.get_secret_version("kv", "app").await.unwrap().unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.data["a"], "3");
    }

    #[tokio::test]
    async fn test_feed_delivers_events_in_order() {
        let store = MemorySecretStore::new();
        let mut feed = store.subscribe();

        store.put("kv", "app", json!({"a": "1"}));
        store.put_silently("kv", "app", json!({"a": "2"}));
        store.delete("kv", "app");

        assert_eq!(feed.next().await, Some(SecretEvent::updated("kv", "app", 1)));
        assert_eq!(feed.next().await, Some(SecretEvent::deleted("kv", "app", 2)));
    }

    #[tokio::test]
    async fn test_scalar_values_are_wrapped() {
        let store = MemorySecretStore::new();
        store.put("kv", "token", json!("abc"));
        let data = store.get_secret_version("kv", "token").await.unwrap().unwrap();
        assert_eq!(data.data["value"], "abc");
    }

    #[tokio::test]
    async fn test_static_authorizer() {
        let authorizer = StaticAuthorizer::new()
            .allow("dev", "kv", "app/db")
            .allow_all("admin");
        let db = SecretRef::new("kv", "app/db");
        let cache = SecretRef::new("kv", "app/cache");

        assert!(authorizer.check_read_capability("dev", &db).await.unwrap());
        assert!(!authorizer.check_read_capability("dev", &cache).await.unwrap());
        assert!(authorizer.check_read_capability("admin", &cache).await.unwrap());
        assert!(!authorizer.check_read_capability("guest", &db).await.unwrap());
    }

    #[test]
    fn test_client_counter_counts_distinct_secrets() {
        let counter = DistinctClientCounter::new();
        counter.record_synced_secret(&SecretRef::new("kv", "a"));
        counter.record_synced_secret(&SecretRef::new("kv", "a"));
        counter.record_synced_secret(&SecretRef::new("kv", "b"));
        assert_eq!(counter.count(), 2);
    }
}
