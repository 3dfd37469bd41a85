use crate::harvest::UnitError;
use crate::traits::StorageAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Bounded pool for remote fetches. Each fetch holds a permit for its duration.
pub struct FetchExecutor {
    semaphore: Arc<Semaphore>,
    fetch_timeout: Option<Duration>,
}

impl FetchExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            fetch_timeout: None,
        }
    }

    pub fn with_timeout(mut self, fetch_timeout: Option<Duration>) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    #[instrument(skip(self, storage))]
    pub async fn execute<S>(&self, storage: &S, folder: &str, name: &str) -> Result<Vec<u8>, UnitError>
    where
        S: StorageAdapter + ?Sized,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| UnitError::Executor(format!("Semaphore error: {}", e)))?;

        debug!("Fetching remote file");

        let bytes = match self.fetch_timeout {
            Some(limit) => timeout(limit, storage.fetch(folder, name))
                .await
                .map_err(|_| UnitError::FetchTimeout {
                    name: name.to_string(),
                    timeout: limit,
                })??,
            None => storage.fetch(folder, name).await?,
        };

        debug!(size_bytes = bytes.len(), "Fetched remote file");
        Ok(bytes)
    }
}
