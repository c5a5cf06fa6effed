//! Per-key async locks
//!
//! Used for the per-session execution lock and the per-name creation lock.
//! Keys never share a mutex, so sessions run independently of each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of async mutexes keyed by `K`
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(key.clone()).or_default())
    }

    /// Wait for the lock on `key` without bound
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Wait at most `wait` for the lock on `key`
    pub async fn lock_within(&self, key: &K, wait: Duration) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(wait, self.slot(key).lock_owned())
            .await
            .ok()
    }

    /// Take the lock on `key` only if nobody holds it
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop the table entry for `key` when no one holds or waits on it
    pub fn prune(&self, key: &K) {
        let mut locks = self.locks.lock();
        if locks
            .get(key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            locks.remove(key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
