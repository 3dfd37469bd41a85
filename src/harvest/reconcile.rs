//! Mapping of harvested files onto dataset resources.
//!
//! Each imported file either creates a new resource or supersedes the active
//! resource carrying the same identifier. The superseded resource is not
//! edited; it moves to `Deleted` and a fresh resource takes its place, so the
//! dataset keeps the full revision history.
//!
//! Metadata is inherited when a file replaces or joins existing resources:
//! - `title`: from the superseded resource, otherwise the identifier
//! - `description`: from the superseded resource, otherwise from the
//!   top-ordered active resource as it was when the run started, otherwise empty
//!
//! After every change the permalink is recomputed: it targets the active
//! resource with the greatest identifier among those matching the run's name
//! pattern.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::{matches, NamePattern};
use crate::model::{
    by_identifier_desc, DatasetId, NewResource, PermalinkTarget, Resource, ResourceChangeSet,
    ResourceId,
};
use crate::traits::{Catalog, CatalogError};

/// Result of reconciling one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub resource_id: ResourceId,
    pub identifier: String,
    pub superseded: Option<ResourceId>,
    pub permalink: Option<ResourceId>,
}

/// Reconciles fetched files into a dataset's resource set.
///
/// Callers must hold the dataset lock for the duration of [`reconcile`](Self::reconcile):
/// it reads the active set and writes back a change derived from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceReconciler<'a> {
    pattern: Option<&'a NamePattern>,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(pattern: Option<&'a NamePattern>) -> Self {
        Self { pattern }
    }

    /// Computes the change a file makes to the dataset without touching the catalog.
    ///
    /// `active` is the current active set; `prior_top` is the top-ordered
    /// active resource at the start of the run.
    pub fn plan(
        &self,
        dataset_id: DatasetId,
        active: &[Resource],
        prior_top: Option<&Resource>,
        current_permalink: Option<ResourceId>,
        identifier: &str,
        content: Vec<u8>,
    ) -> ResourceChangeSet {
        let predecessor = active.iter().find(|r| r.identifier == identifier);

        let title = predecessor
            .map(|p| p.title.clone())
            .unwrap_or_else(|| identifier.to_string());
        let description = predecessor
            .or(prior_top)
            .map(|r| r.description.clone())
            .unwrap_or_default();

        let best_existing = select_permalink(
            active.iter().filter(|r| r.identifier != identifier),
            self.pattern,
        );
        let permalink = match best_existing {
            _ if matches(self.pattern, identifier)
                && best_existing.map_or(true, |b| identifier > b.identifier.as_str()) =>
            {
                PermalinkTarget::Created
            }
            Some(best) => PermalinkTarget::Existing(best.id),
            None => PermalinkTarget::Unset,
        };

        ResourceChangeSet {
            dataset_id,
            create: NewResource {
                identifier: identifier.to_string(),
                title,
                description,
                content,
            },
            supersedes: predecessor.map(|p| p.id),
            permalink,
            previous_permalink: current_permalink,
        }
    }

    /// Creates or supersedes the resource for `identifier` and moves the permalink.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when a catalog read or write fails. The dataset
    /// is left as it was before the call.
    #[instrument(skip(self, catalog, prior_top, content), fields(size_bytes = content.len()))]
    pub async fn reconcile<C>(
        &self,
        catalog: &C,
        dataset_id: DatasetId,
        prior_top: Option<&Resource>,
        identifier: &str,
        content: Vec<u8>,
    ) -> Result<Reconciled, CatalogError>
    where
        C: Catalog + ?Sized,
    {
        let active = catalog.get_active_resources(dataset_id).await?;
        let current_permalink = catalog.get_permalink(dataset_id).await?;

        let change = self.plan(
            dataset_id,
            &active,
            prior_top,
            current_permalink,
            identifier,
            content,
        );
        let resource_id = catalog.commit(&change).await?;

        let permalink = match change.permalink {
            PermalinkTarget::Created => Some(resource_id),
            PermalinkTarget::Existing(id) => Some(id),
            PermalinkTarget::Unset => None,
        };

        match change.supersedes {
            Some(old) => info!(resource = %resource_id, superseded = %old, "Superseded resource"),
            None => info!(resource = %resource_id, "Created resource"),
        }

        Ok(Reconciled {
            resource_id,
            identifier: identifier.to_string(),
            superseded: change.supersedes,
            permalink,
        })
    }

    /// Points the permalink at the best active resource, e.g. after pruning,
    /// and returns that resource.
    pub async fn refresh_permalink<C>(
        &self,
        catalog: &C,
        dataset_id: DatasetId,
    ) -> Result<Option<Resource>, CatalogError>
    where
        C: Catalog + ?Sized,
    {
        let active = catalog.get_active_resources(dataset_id).await?;
        let target = select_permalink(&active, self.pattern).cloned();
        let target_id = target.as_ref().map(|r| r.id);
        if catalog.get_permalink(dataset_id).await? != target_id {
            debug!(dataset = %dataset_id, permalink = ?target_id, "Moving permalink");
            catalog.set_permalink(dataset_id, target_id).await?;
        }
        Ok(target)
    }
}

/// Active resource with the greatest identifier among those matching `pattern`.
pub fn select_permalink<'r, I>(resources: I, pattern: Option<&NamePattern>) -> Option<&'r Resource>
where
    I: IntoIterator<Item = &'r Resource>,
{
    resources
        .into_iter()
        .filter(|r| r.is_active() && matches(pattern, &r.identifier))
        .min_by(|a, b| by_identifier_desc(a, b))
}

/// Top-ordered active resource.
pub fn top_resource(resources: &[Resource]) -> Option<&Resource> {
    select_permalink(resources, None)
}
