//! Retention of a bounded number of active resources per dataset.

use tracing::{info, warn};

use crate::model::{by_identifier_desc, DatasetId, Resource, ResourceId, ResourceState};
use crate::traits::{Catalog, CatalogError};

/// Retires active resources ranked below `max_resources`.
///
/// Ranking follows the dataset order (descending identifier). Retired
/// resources move to `Deleted`; their records stay in the dataset history.
/// Only the current active revision of an identifier is affected, earlier
/// superseded revisions are already `Deleted` and are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPruner {
    max_resources: Option<usize>,
    reclaim_content: bool,
}

impl RetentionPruner {
    pub fn new(max_resources: Option<usize>) -> Self {
        Self {
            max_resources,
            reclaim_content: false,
        }
    }

    /// Also release the stored bytes of retired resources.
    pub fn with_reclaim(mut self, reclaim_content: bool) -> Self {
        self.reclaim_content = reclaim_content;
        self
    }

    /// Ids of the active resources that fall outside the retention bound.
    pub fn plan(&self, resources: &[Resource]) -> Vec<ResourceId> {
        let Some(max) = self.max_resources else {
            return Vec::new();
        };
        let mut active: Vec<&Resource> = resources.iter().filter(|r| r.is_active()).collect();
        active.sort_by(|a, b| by_identifier_desc(a, b));
        active.into_iter().skip(max).map(|r| r.id).collect()
    }

    /// Applies the retention bound and returns the retired resource ids.
    ///
    /// Must run under the dataset lock. Stops at the first failing write;
    /// resources retired before the failure stay retired.
    pub async fn prune<C>(
        &self,
        catalog: &C,
        dataset_id: DatasetId,
    ) -> Result<Vec<ResourceId>, CatalogError>
    where
        C: Catalog + ?Sized,
    {
        if self.max_resources.is_none() {
            return Ok(Vec::new());
        }

        let active = catalog.get_active_resources(dataset_id).await?;
        let excess = self.plan(&active);

        for id in &excess {
            catalog.set_resource_state(*id, ResourceState::Deleted).await?;
            if self.reclaim_content {
                if let Err(e) = catalog.reclaim_content(*id).await {
                    warn!(resource = %id, error = %e, "Failed to reclaim pruned content");
                }
            }
        }

        if !excess.is_empty() {
            info!(
                dataset = %dataset_id,
                pruned = excess.len(),
                max_resources = ?self.max_resources,
                "Pruned resources beyond retention bound"
            );
        }
        Ok(excess)
    }
}
