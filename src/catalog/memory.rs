use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{
    Dataset, DatasetId, HarvestRun, NewResource, PermalinkTarget, Resource, ResourceChangeSet,
    ResourceId, ResourceState,
};
use crate::traits::{Catalog, CatalogError, RunStore};

#[derive(Debug, Default)]
struct CatalogState {
    datasets: HashMap<DatasetId, Dataset>,
    by_slug: HashMap<String, DatasetId>,
    owners: HashMap<ResourceId, DatasetId>,
    blobs: HashMap<ResourceId, Vec<u8>>,
    failing_creates: HashSet<String>,
    failing_state_changes: HashSet<ResourceId>,
}

impl CatalogState {
    fn dataset(&self, id: DatasetId) -> Result<&Dataset, CatalogError> {
        self.datasets.get(&id).ok_or(CatalogError::DatasetNotFound(id))
    }

    fn resource(&self, id: ResourceId) -> Result<&Resource, CatalogError> {
        self.owners
            .get(&id)
            .and_then(|dataset| self.datasets.get(dataset))
            .and_then(|dataset| dataset.resource(id))
            .ok_or(CatalogError::ResourceNotFound(id))
    }

    fn resource_mut(&mut self, id: ResourceId) -> Result<&mut Resource, CatalogError> {
        let dataset = self
            .owners
            .get(&id)
            .copied()
            .ok_or(CatalogError::ResourceNotFound(id))?;
        self.datasets
            .get_mut(&dataset)
            .and_then(|d| d.resources_all.iter_mut().find(|r| r.id == id))
            .ok_or(CatalogError::ResourceNotFound(id))
    }

    fn check_create(&self, dataset: DatasetId, resource: &NewResource) -> Result<(), CatalogError> {
        self.dataset(dataset)?;
        if self.failing_creates.contains(&resource.identifier) {
            return Err(CatalogError::WriteFailed(format!(
                "could not store resource {}",
                resource.identifier
            )));
        }
        Ok(())
    }

    fn check_transition(&self, id: ResourceId, to: ResourceState) -> Result<(), CatalogError> {
        let resource = self.resource(id)?;
        if self.failing_state_changes.contains(&id) {
            return Err(CatalogError::WriteFailed(format!(
                "could not update resource {}",
                id
            )));
        }
        match (resource.state, to) {
            (ResourceState::Active, _) => Ok(()),
            (from, to) => Err(CatalogError::InvalidStateTransition { id, from, to }),
        }
    }

    fn check_permalink(
        &self,
        dataset: DatasetId,
        target: Option<ResourceId>,
    ) -> Result<(), CatalogError> {
        let dataset = self.dataset(dataset)?;
        match target {
            Some(id) if dataset.resource(id).is_none() => Err(CatalogError::ResourceNotFound(id)),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, dataset: DatasetId, resource: NewResource) -> ResourceId {
        let id = Uuid::new_v4();
        let record = Resource {
            id,
            content_ref: format!("memory://{}/{}/{}", dataset, id, resource.identifier),
            identifier: resource.identifier,
            title: resource.title,
            description: resource.description,
            created_at: Utc::now(),
            state: ResourceState::Active,
            dataset_id: dataset,
        };
        self.blobs.insert(id, resource.content);
        self.owners.insert(id, dataset);
        if let Some(d) = self.datasets.get_mut(&dataset) {
            d.resources_all.push(record);
        }
        id
    }

    fn set_permalink(&mut self, dataset: DatasetId, target: Option<ResourceId>) {
        if let Some(d) = self.datasets.get_mut(&dataset) {
            d.permalink_resource_id = target;
        }
    }
}

/// In-memory catalog.
///
/// Stores content bytes per resource and enforces the resource lifecycle:
/// a resource can leave `Active` once and never come back.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the dataset with `slug`.
    pub async fn dataset(&self, slug: &str) -> Option<Dataset> {
        let state = self.state.read().await;
        state
            .by_slug
            .get(slug)
            .and_then(|id| state.datasets.get(id))
            .cloned()
    }

    /// Stored bytes of a resource; `None` once reclaimed.
    pub async fn content(&self, resource: ResourceId) -> Option<Vec<u8>> {
        self.state.read().await.blobs.get(&resource).cloned()
    }

    /// Makes creation of resources named `identifier` fail.
    pub async fn fail_create_for(&self, identifier: &str) {
        self.state
            .write()
            .await
            .failing_creates
            .insert(identifier.to_string());
    }

    /// Makes state changes of `resource` fail.
    pub async fn fail_state_change_for(&self, resource: ResourceId) {
        self.state
            .write()
            .await
            .failing_state_changes
            .insert(resource);
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.failing_creates.clear();
        state.failing_state_changes.clear();
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn ensure_dataset(&self, slug: &str) -> Result<DatasetId, CatalogError> {
        let mut state = self.state.write().await;
        if let Some(id) = state.by_slug.get(slug) {
            return Ok(*id);
        }
        let dataset = Dataset::new(slug);
        let id = dataset.id;
        state.by_slug.insert(slug.to_string(), id);
        state.datasets.insert(id, dataset);
        Ok(id)
    }

    async fn get_active_resources(
        &self,
        dataset: DatasetId,
    ) -> Result<Vec<Resource>, CatalogError> {
        let state = self.state.read().await;
        Ok(state
            .dataset(dataset)?
            .resources()
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_all_resources(&self, dataset: DatasetId) -> Result<Vec<Resource>, CatalogError> {
        let state = self.state.read().await;
        Ok(state.dataset(dataset)?.resources_all.clone())
    }

    async fn create_resource(
        &self,
        dataset: DatasetId,
        resource: NewResource,
    ) -> Result<ResourceId, CatalogError> {
        let mut state = self.state.write().await;
        state.check_create(dataset, &resource)?;
        Ok(state.insert(dataset, resource))
    }

    async fn set_resource_state(
        &self,
        resource: ResourceId,
        to: ResourceState,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.write().await;
        if state.resource(resource)?.state == to {
            return match to {
                ResourceState::Active => Ok(()),
                ResourceState::Deleted => Err(CatalogError::InvalidStateTransition {
                    id: resource,
                    from: to,
                    to,
                }),
            };
        }
        state.check_transition(resource, to)?;
        state.resource_mut(resource)?.state = to;
        Ok(())
    }

    async fn get_permalink(&self, dataset: DatasetId) -> Result<Option<ResourceId>, CatalogError> {
        let state = self.state.read().await;
        Ok(state.dataset(dataset)?.permalink_resource_id)
    }

    async fn set_permalink(
        &self,
        dataset: DatasetId,
        resource: Option<ResourceId>,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.write().await;
        state.check_permalink(dataset, resource)?;
        state.set_permalink(dataset, resource);
        Ok(())
    }

    async fn reclaim_content(&self, resource: ResourceId) -> Result<(), CatalogError> {
        let mut state = self.state.write().await;
        if state.resource(resource)?.is_active() {
            return Err(CatalogError::WriteFailed(format!(
                "resource {} is still active",
                resource
            )));
        }
        state.blobs.remove(&resource);
        Ok(())
    }

    /// Validates the whole change set first, then applies it under one lock.
    async fn commit(&self, change: &ResourceChangeSet) -> Result<ResourceId, CatalogError> {
        let mut state = self.state.write().await;

        state.check_create(change.dataset_id, &change.create)?;
        if let Some(old) = change.supersedes {
            state.check_transition(old, ResourceState::Deleted)?;
        }
        if let PermalinkTarget::Existing(id) = change.permalink {
            state.check_permalink(change.dataset_id, Some(id))?;
        }

        let created = state.insert(change.dataset_id, change.create.clone());
        if let Some(old) = change.supersedes {
            state.resource_mut(old)?.state = ResourceState::Deleted;
        }
        let target = match change.permalink {
            PermalinkTarget::Created => Some(created),
            PermalinkTarget::Existing(id) => Some(id),
            PermalinkTarget::Unset => None,
        };
        state.set_permalink(change.dataset_id, target);
        Ok(created)
    }
}

/// In-memory ledger of harvest runs.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<Vec<HarvestRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded runs of `source_id`, oldest first.
    pub async fn runs(&self, source_id: &str) -> Vec<HarvestRun> {
        self.runs
            .read()
            .await
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<DateTime<Utc>>, CatalogError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter(|r| r.source_id == source_id && r.succeeded())
            .map(|r| r.started_at)
            .max())
    }

    async fn record_run(&self, run: &HarvestRun) -> Result<(), CatalogError> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }
}
