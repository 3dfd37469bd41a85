use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

pub type DatasetId = Uuid;
pub type ResourceId = Uuid;

/// A file as listed by the remote store, produced fresh on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub modified_at: DateTime<Utc>,
}

impl RemoteEntry {
    pub fn new(name: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Normal,
    ForceAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether a run finishing with this status moves the source's
    /// `last_successful_run_at` forward.
    pub fn advances_watermark(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialFailure)
    }
}

/// One invocation of the harvester for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestRun {
    pub id: Uuid,
    pub source_id: String,
    pub dataset_ref: String, // dataset slug
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mode: RunMode,
    /// Start time of the previous run of this source that advanced the watermark.
    pub last_successful_run_at: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

impl HarvestRun {
    pub fn start(
        source_id: impl Into<String>,
        dataset_ref: impl Into<String>,
        mode: RunMode,
        last_successful_run_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            dataset_ref: dataset_ref.into(),
            started_at: Utc::now(),
            finished_at: None,
            mode,
            last_successful_run_at,
            status: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.finished_at = Some(Utc::now());
        self.status = Some(status);
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_some_and(RunStatus::advances_watermark)
    }
}

// ============================================================================
// Harvest units
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStage {
    Gathered,
    Fetched,
    Imported,
    Failed,
}

impl UnitStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStage::Imported | UnitStage::Failed)
    }

    fn can_transition_to(self, next: UnitStage) -> bool {
        matches!(
            (self, next),
            (UnitStage::Gathered, UnitStage::Fetched)
                | (UnitStage::Fetched, UnitStage::Imported)
                | (UnitStage::Gathered, UnitStage::Failed)
                | (UnitStage::Fetched, UnitStage::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal unit transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: UnitStage,
    pub to: UnitStage,
}

/// Error recorded against a unit; `stage` is the stage the unit was in when it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: UnitStage,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Per-file unit of work carried through gather, fetch and import.
#[derive(Debug, Clone)]
pub struct HarvestUnit {
    pub id: Uuid,
    pub remote_name: String,
    pub modified_at: DateTime<Utc>,
    pub stage: UnitStage,
    pub payload: Option<Vec<u8>>,
    pub errors: Vec<ErrorRecord>,
}

impl HarvestUnit {
    pub fn gathered(entry: &RemoteEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_name: entry.name.clone(),
            modified_at: entry.modified_at,
            stage: UnitStage::Gathered,
            payload: None,
            errors: Vec::new(),
        }
    }

    fn advance(&mut self, next: UnitStage) -> Result<(), TransitionError> {
        if !self.stage.can_transition_to(next) {
            return Err(TransitionError {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    pub fn mark_fetched(&mut self, payload: Vec<u8>) -> Result<(), TransitionError> {
        self.advance(UnitStage::Fetched)?;
        self.payload = Some(payload);
        Ok(())
    }

    /// Moves a fetched unit to `Imported`; the payload now lives in the catalog.
    pub fn mark_imported(&mut self) -> Result<(), TransitionError> {
        self.advance(UnitStage::Imported)?;
        self.payload = None;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        let failed_in = self.stage;
        self.advance(UnitStage::Failed)?;
        self.payload = None;
        self.errors.push(ErrorRecord {
            stage: failed_in,
            message: message.into(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }
}

// ============================================================================
// Catalog entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Active,
    Deleted,
}

/// One harvested file version attached to a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub identifier: String, // source filename
    pub title: String,
    pub description: String,
    pub content_ref: String,
    pub created_at: DateTime<Utc>,
    pub state: ResourceState,
    pub dataset_id: DatasetId,
}

impl Resource {
    pub fn is_active(&self) -> bool {
        self.state == ResourceState::Active
    }
}

/// Dataset resource order: descending by identifier.
pub fn by_identifier_desc(a: &Resource, b: &Resource) -> Ordering {
    b.identifier.cmp(&a.identifier)
}

/// A dataset and the full history of its resources.
///
/// `resources_all` is append-only; the active view is always derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub slug: String,
    pub resources_all: Vec<Resource>,
    pub permalink_resource_id: Option<ResourceId>,
}

impl Dataset {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug: slug.into(),
            resources_all: Vec::new(),
            permalink_resource_id: None,
        }
    }

    /// Active resources ordered by descending identifier.
    pub fn resources(&self) -> Vec<&Resource> {
        let mut active: Vec<&Resource> =
            self.resources_all.iter().filter(|r| r.is_active()).collect();
        active.sort_by(|a, b| by_identifier_desc(a, b));
        active
    }

    pub fn active_by_identifier(&self, identifier: &str) -> Option<&Resource> {
        self.resources_all
            .iter()
            .find(|r| r.is_active() && r.identifier == identifier)
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources_all.iter().find(|r| r.id == id)
    }

    pub fn permalink(&self) -> Option<&Resource> {
        self.permalink_resource_id.and_then(|id| self.resource(id))
    }

    /// Download URL of the permalink target under the catalog's `site_url`.
    pub fn permalink_url(&self, site_url: &str) -> Option<String> {
        self.permalink().map(|r| download_url(site_url, r))
    }
}

/// Download URL of a resource under the catalog's `site_url`.
pub fn download_url(site_url: &str, resource: &Resource) -> String {
    format!(
        "{}/dataset/{}/resource/{}/download/{}",
        site_url.trim_end_matches('/'),
        resource.dataset_id,
        resource.id,
        resource.identifier
    )
}

// ============================================================================
// Change sets
// ============================================================================

/// Resource fields supplied by the harvester when creating a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermalinkTarget {
    /// The resource created by the same change set.
    Created,
    Existing(ResourceId),
    Unset,
}

/// Everything one imported file changes on a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChangeSet {
    pub dataset_id: DatasetId,
    pub create: NewResource,
    /// Active resource with the same identifier that becomes `Deleted`.
    pub supersedes: Option<ResourceId>,
    pub permalink: PermalinkTarget,
    /// Permalink before this change, restored if a commit has to be rolled back.
    pub previous_permalink: Option<ResourceId>,
}
