use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::model::RemoteEntry;
use crate::traits::{StorageAdapter, StorageError};

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    // (folder, name) -> file
    files: BTreeMap<(String, String), MemoryFile>,
    listing_failure: Option<String>,
    failing_fetches: HashSet<String>,
    fetch_delay: Option<Duration>,
}

/// In-memory remote store with controllable modification times and failures.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

fn normalize(folder: &str) -> String {
    folder.trim_matches('/').to_string()
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes or replaces a file.
    pub async fn put(
        &self,
        folder: &str,
        name: &str,
        content: impl AsRef<[u8]>,
        modified_at: DateTime<Utc>,
    ) {
        self.state.write().await.files.insert(
            (normalize(folder), name.to_string()),
            MemoryFile {
                content: content.as_ref().to_vec(),
                modified_at,
            },
        );
    }

    /// Changes the modification time of an existing file.
    pub async fn touch(&self, folder: &str, name: &str, modified_at: DateTime<Utc>) -> bool {
        match self
            .state
            .write()
            .await
            .files
            .get_mut(&(normalize(folder), name.to_string()))
        {
            Some(file) => {
                file.modified_at = modified_at;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, folder: &str, name: &str) -> bool {
        self.state
            .write()
            .await
            .files
            .remove(&(normalize(folder), name.to_string()))
            .is_some()
    }

    /// Makes every listing fail with `message` until reset with `None`.
    pub async fn fail_listing(&self, message: Option<&str>) {
        self.state.write().await.listing_failure = message.map(str::to_string);
    }

    /// Makes fetches of `name` fail with a transport error.
    pub async fn fail_fetch(&self, name: &str) {
        self.state
            .write()
            .await
            .failing_fetches
            .insert(name.to_string());
    }

    pub async fn clear_fetch_failures(&self) {
        self.state.write().await.failing_fetches.clear();
    }

    /// Delays every fetch, e.g. to exercise timeouts or cancellation.
    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.state.write().await.fetch_delay = Some(delay);
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn list_entries(&self, folder: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let state = self.state.read().await;
        if let Some(message) = &state.listing_failure {
            return Err(StorageError::Transport(message.clone()));
        }
        let folder = normalize(folder);
        Ok(state
            .files
            .iter()
            .filter(|((f, _), _)| *f == folder)
            .map(|((_, name), file)| RemoteEntry::new(name.clone(), file.modified_at))
            .collect())
    }

    async fn fetch(&self, folder: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let delay = self.state.read().await.fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        if state.failing_fetches.contains(name) {
            return Err(StorageError::Transport(format!(
                "connection reset while retrieving {}",
                name
            )));
        }
        state
            .files
            .get(&(normalize(folder), name.to_string()))
            .map(|file| file.content.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}
