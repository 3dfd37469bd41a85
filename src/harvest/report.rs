use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{DatasetId, ErrorRecord, HarvestUnit, ResourceId, RunStatus, UnitStage};

/// Final outcome of one harvest unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Imported {
        resource_id: ResourceId,
        superseded: Option<ResourceId>,
    },
    Failed {
        errors: Vec<ErrorRecord>,
    },
    /// Left behind by a cancelled run; picked up again by the next run.
    Abandoned {
        stage: UnitStage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub remote_name: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
}

impl UnitReport {
    pub(crate) fn summarize(unit: HarvestUnit, imported: Option<(ResourceId, Option<ResourceId>)>) -> Self {
        let outcome = match (unit.stage, imported) {
            (UnitStage::Imported, Some((resource_id, superseded))) => UnitOutcome::Imported {
                resource_id,
                superseded,
            },
            (UnitStage::Failed, _) => UnitOutcome::Failed {
                errors: unit.errors,
            },
            (stage, _) => UnitOutcome::Abandoned { stage },
        };
        Self {
            unit_id: unit.id,
            remote_name: unit.remote_name,
            outcome,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Imported { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Failed { .. })
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub dataset_id: DatasetId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
    pub pruned: Vec<ResourceId>,
    pub permalink: Option<ResourceId>,
    pub permalink_url: Option<String>,
    /// Dataset-level failure after the import phase (retention or permalink update).
    pub finalize_error: Option<String>,
}

impl RunReport {
    pub fn imported(&self) -> usize {
        self.units.iter().filter(|u| u.is_imported()).count()
    }

    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| u.is_failed()).count()
    }

    pub fn unit(&self, remote_name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.remote_name == remote_name)
    }
}

/// Overall status from the per-unit results.
///
/// A run with no candidates and no errors succeeds. A run whose candidates all
/// failed fails. Any other mix of imports and failures, or an import phase
/// followed by a failed retention pass, is a partial failure.
pub fn run_status(units: &[UnitReport], cancelled: bool, finalize_failed: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    let imported = units.iter().filter(|u| u.is_imported()).count();
    let failed = units.iter().filter(|u| u.is_failed()).count();

    match (imported, failed) {
        (0, 0) if finalize_failed => RunStatus::Failed,
        (0, 0) => RunStatus::Success,
        (0, _) => RunStatus::Failed,
        (_, 0) if !finalize_failed => RunStatus::Success,
        _ => RunStatus::PartialFailure,
    }
}
