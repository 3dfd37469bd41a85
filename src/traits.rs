use crate::model::{
    DatasetId, HarvestRun, NewResource, PermalinkTarget, RemoteEntry, Resource, ResourceChangeSet,
    ResourceId, ResourceState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Remote folder not found: {0}")]
    FolderNotFound(String),
    #[error("Remote file not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Path escapes the storage root: '{0}'")]
    PathTraversal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Dataset not found: {0}")]
    DatasetNotFound(DatasetId),
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),
    #[error("Resource {id} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        id: ResourceId,
        from: ResourceState,
        to: ResourceState,
    },
    #[error("Catalog write failed: {0}")]
    WriteFailed(String),
    #[error("Catalog backend error: {0}")]
    Backend(String),
}

/// Remote file store the harvester scans (FTP server, object storage bucket, mounted folder).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Lists the files directly under `folder`. Order is unspecified.
    async fn list_entries(&self, folder: &str) -> Result<Vec<RemoteEntry>, StorageError>;

    /// Downloads the raw bytes of `name` inside `folder`.
    async fn fetch(&self, folder: &str, name: &str) -> Result<Vec<u8>, StorageError>;
}

/// Catalog holding datasets and their resources.
///
/// Resources are never removed; they only move from `Active` to `Deleted`.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the dataset with `slug`, creating an empty one if it does not exist.
    async fn ensure_dataset(&self, slug: &str) -> Result<DatasetId, CatalogError>;

    /// Active resources ordered by descending identifier.
    async fn get_active_resources(&self, dataset: DatasetId)
        -> Result<Vec<Resource>, CatalogError>;

    /// All resources of the dataset in creation order, whatever their state.
    async fn get_all_resources(&self, dataset: DatasetId) -> Result<Vec<Resource>, CatalogError>;

    async fn create_resource(
        &self,
        dataset: DatasetId,
        resource: NewResource,
    ) -> Result<ResourceId, CatalogError>;

    async fn set_resource_state(
        &self,
        resource: ResourceId,
        state: ResourceState,
    ) -> Result<(), CatalogError>;

    async fn get_permalink(&self, dataset: DatasetId) -> Result<Option<ResourceId>, CatalogError>;

    async fn set_permalink(
        &self,
        dataset: DatasetId,
        resource: Option<ResourceId>,
    ) -> Result<(), CatalogError>;

    /// Releases stored content of a deleted resource. The record itself stays.
    async fn reclaim_content(&self, _resource: ResourceId) -> Result<(), CatalogError> {
        Ok(())
    }

    /// Applies a change set and returns the id of the created resource.
    ///
    /// The default implementation issues the individual calls in order
    /// (create, permalink, supersede). The supersede step goes last because it
    /// cannot be undone; earlier failures are compensated by retiring the
    /// created resource and restoring the previous permalink. Backends with
    /// transactions should override this and apply the set atomically.
    async fn commit(&self, change: &ResourceChangeSet) -> Result<ResourceId, CatalogError> {
        let created = self
            .create_resource(change.dataset_id, change.create.clone())
            .await?;

        let target = match change.permalink {
            PermalinkTarget::Created => Some(created),
            PermalinkTarget::Existing(id) => Some(id),
            PermalinkTarget::Unset => None,
        };
        if let Err(e) = self.set_permalink(change.dataset_id, target).await {
            retire(self, created).await;
            return Err(e);
        }

        if let Some(old) = change.supersedes {
            if let Err(e) = self.set_resource_state(old, ResourceState::Deleted).await {
                if let Err(undo) = self
                    .set_permalink(change.dataset_id, change.previous_permalink)
                    .await
                {
                    warn!(dataset = %change.dataset_id, error = %undo, "Failed to restore permalink");
                }
                retire(self, created).await;
                return Err(e);
            }
        }

        Ok(created)
    }
}

async fn retire<C: Catalog + ?Sized>(catalog: &C, created: ResourceId) {
    if let Err(undo) = catalog
        .set_resource_state(created, ResourceState::Deleted)
        .await
    {
        warn!(resource = %created, error = %undo, "Failed to retire partially committed resource");
    }
}

/// Ledger of finished harvest runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Start time of the latest run of `source_id` that advanced the watermark.
    async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<DateTime<Utc>>, CatalogError>;

    async fn record_run(&self, run: &HarvestRun) -> Result<(), CatalogError>;
}
