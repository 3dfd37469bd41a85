//! Run and dataset mutual exclusion.
//!
//! Two kinds of keyed locks:
//! - **run locks** keyed by source id: a second run of the same source is
//!   refused while one is in progress (non-blocking);
//! - **dataset locks** keyed by dataset id: the import and retention phases
//!   of any run touching the dataset are serialized (blocking).
//!
//! Locks for different keys are independent.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::DatasetId;

/// Map of lazily created async mutexes, one per key.
#[derive(Debug)]
struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the mutex for `key`. Mutexes nobody holds or waits on are
    /// dropped first, so the map only covers keys in use.
    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
pub struct LockRegistry {
    runs: KeyedLocks<String>,
    datasets: KeyedLocks<DatasetId>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self {
            runs: KeyedLocks::new(),
            datasets: KeyedLocks::new(),
        }
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the run slot of `source_id`, or `None` if a run already holds it.
    pub fn try_acquire_run(&self, source_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.runs.entry(&source_id.to_string()).try_lock_owned().ok()
    }

    /// Waits for exclusive access to the dataset's resource set.
    pub async fn lock_dataset(&self, dataset_id: DatasetId) -> OwnedMutexGuard<()> {
        self.datasets.entry(&dataset_id).lock_owned().await
    }
}
