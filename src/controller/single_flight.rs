//! # Single-Flight Locks
//!
//! At most one operation in progress per key. Each key maps to an async
//! mutex; guards are owned so they can move into spawned tasks, and a key's
//! entry is dropped once nobody holds or waits for it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Locks<K> = HashMap<K, Arc<AsyncMutex<()>>>;
type LockMap<K> = Arc<Mutex<Locks<K>>>;

/// Per-key async locks
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash + Clone> {
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock_map<K>(locks: &Mutex<Locks<K>>) -> MutexGuard<'_, Locks<K>> {
    locks.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = lock_map(&self.locks);
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Wait until `key` is free and hold it
    pub async fn acquire(&self, key: &K) -> FlightGuard<K> {
        let guard = self.lock_for(key).lock_owned().await;
        FlightGuard {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Hold `key` only if nothing else does
    pub fn try_acquire(&self, key: &K) -> Option<FlightGuard<K>> {
        let guard = self.lock_for(key).try_lock_owned().ok()?;
        Some(FlightGuard {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Whether an operation currently holds `key`
    #[must_use]
    pub fn is_held(&self, key: &K) -> bool {
        lock_map(&self.locks)
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Keys with a holder or waiter
    #[must_use]
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held single-flight slot; released on drop
#[derive(Debug)]
pub struct FlightGuard<K: Eq + Hash + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> FlightGuard<K> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        // Only the map's own reference left: no holder, no waiter
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
