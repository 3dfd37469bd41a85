//! Harvest run orchestration.
//!
//! This module provides the [`HarvestPipeline`] coordinator that carries every
//! selected remote file through the stages Gather → Fetch → Import, followed
//! by a retention pass, with:
//! - Concurrent fetches bounded by [`FetchExecutor`]
//! - Per-unit failure isolation: a failing file never stops its siblings
//! - Serialized imports per dataset under the dataset lock
//! - One run at a time per source under the run lock
//! - Structured logging via `tracing`

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{HarvestSource, PipelineSettings, RunConfig};
use crate::executor::FetchExecutor;
use crate::harvest::detector::{is_transient, ChangeDetector};
use crate::harvest::error::{HarvestError, UnitError};
use crate::harvest::prune::RetentionPruner;
use crate::harvest::reconcile::{top_resource, ResourceReconciler};
use crate::harvest::report::{run_status, RunReport, UnitReport};
use crate::locks::LockRegistry;
use crate::model::{
    download_url, DatasetId, HarvestRun, HarvestUnit, Resource, ResourceId, RunStatus,
    TransitionError, UnitStage,
};
use crate::traits::{Catalog, CatalogError, RunStore, StorageAdapter};

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Harvest pipeline over a remote store, a catalog and a run ledger.
///
/// Each call to [`run`](Self::run) processes one harvest source:
/// 1. **Gather**: list the remote folder and select new work via [`ChangeDetector`]
/// 2. **Fetch**: download every selected file, concurrently
/// 3. **Import**: reconcile each fetched file into the dataset, one at a time
/// 4. **Finalize**: prune beyond `max_resources`, recompute the permalink,
///    record the run
///
/// # Failure scopes
///
/// Invalid configuration, an overlapping run of the same source, a failed
/// listing or an unavailable dataset abort the run with a [`HarvestError`].
/// Fetch and catalog write failures only fail the affected unit, which shows
/// up in the [`RunReport`].
///
/// # Example
///
/// ```ignore
/// use dataset_harvester::catalog::{MemoryCatalog, MemoryRunStore};
/// use dataset_harvester::config::HarvestSource;
/// use dataset_harvester::harvest::HarvestPipeline;
/// use dataset_harvester::storage::LocalFolderStorage;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = HarvestPipeline::new(
///         Arc::new(LocalFolderStorage::new("/srv/ftp")),
///         Arc::new(MemoryCatalog::new()),
///         Arc::new(MemoryRunStore::new()),
///     );
///     let source = HarvestSource::from_json("didok", Some(r#"{"dataset": "didok", "folder": "DiDok"}"#))?;
///     let report = pipeline.run(&source).await?;
///     println!("{:?}: {} imported", report.status, report.imported());
///     Ok(())
/// }
/// ```
pub struct HarvestPipeline<S, C, R>
where
    S: StorageAdapter,
    C: Catalog,
    R: RunStore,
{
    storage: Arc<S>,
    catalog: Arc<C>,
    runs: Arc<R>,
    locks: Arc<LockRegistry>,
    executor: FetchExecutor,
    settings: PipelineSettings,
}

impl<S, C, R> HarvestPipeline<S, C, R>
where
    S: StorageAdapter,
    C: Catalog,
    R: RunStore,
{
    /// Creates a pipeline with [`PipelineSettings::default`] and its own lock registry.
    pub fn new(storage: Arc<S>, catalog: Arc<C>, runs: Arc<R>) -> Self {
        let settings = PipelineSettings::default();
        Self {
            storage,
            catalog,
            runs,
            locks: Arc::new(LockRegistry::new()),
            executor: FetchExecutor::new(settings.fetch_concurrency),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.executor =
            FetchExecutor::new(settings.fetch_concurrency).with_timeout(settings.fetch_timeout);
        self.settings = settings;
        self
    }

    /// Shares a lock registry with other pipelines writing to the same catalog.
    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Runs the harvest for `source` to completion.
    pub async fn run(&self, source: &HarvestSource) -> Result<RunReport, HarvestError> {
        self.run_cancellable(source, CancellationToken::new()).await
    }

    /// Runs the harvest for `source`, stopping early when `cancel` fires.
    ///
    /// Units imported before cancellation stay committed and the retention
    /// pass still runs over them. Units still waiting for fetch or import are
    /// abandoned and reported as such; the run is recorded as
    /// [`RunStatus::Cancelled`], so the watermark stays put and the next run
    /// selects those files again. Files this run already imported are not
    /// selected again, their active copy is at least as new as the remote file.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] for run-scoped failures. Configuration errors
    /// and overlapping runs are rejected before anything is recorded; listing
    /// and dataset failures are recorded as a failed run.
    #[instrument(skip(self, source, cancel), fields(source_id = %source.id))]
    pub async fn run_cancellable(
        &self,
        source: &HarvestSource,
        cancel: CancellationToken,
    ) -> Result<RunReport, HarvestError> {
        let config = source.config.validate()?;
        let _run_guard = self
            .locks
            .try_acquire_run(&source.id)
            .ok_or_else(|| HarvestError::RunInProgress(source.id.clone()))?;

        let last_success = self
            .runs
            .last_successful_run(&source.id)
            .await
            .map_err(|e| HarvestError::Dataset {
                dataset: config.dataset.clone(),
                source: e,
            })?;

        let mut run = HarvestRun::start(&source.id, &config.dataset, config.mode, last_success);
        info!(
            run_id = %run.id,
            dataset = %config.dataset,
            folder = %config.folder,
            mode = ?config.mode,
            last_success = ?last_success,
            "Starting harvest run"
        );

        match self.execute(&config, &mut run, &cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Harvest run aborted");
                run.finish(RunStatus::Failed);
                self.record(&run).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        config: &RunConfig,
        run: &mut HarvestRun,
        cancel: &CancellationToken,
    ) -> Result<RunReport, HarvestError> {
        // ====================================================================
        // Stage 1: Gather
        // ====================================================================

        let (dataset_id, units) = self.gather(config, run).await?;
        info!(run_id = %run.id, units = units.len(), "Gather completed");

        // ====================================================================
        // Stage 2: Fetch
        // ====================================================================

        let units = self.fetch_all(&config.folder, units, cancel).await;
        let fetched = units
            .iter()
            .filter(|u| u.stage == UnitStage::Fetched)
            .count();
        info!(run_id = %run.id, fetched, "Fetch completed");

        // ====================================================================
        // Stage 3: Import (dataset lock held until the run is finalized)
        // ====================================================================

        let _dataset_guard = self.locks.lock_dataset(dataset_id).await;

        let prior_active = self
            .catalog
            .get_active_resources(dataset_id)
            .await
            .map_err(|e| HarvestError::Dataset {
                dataset: config.dataset.clone(),
                source: e,
            })?;
        let prior_top = top_resource(&prior_active).cloned();
        let reconciler = ResourceReconciler::new(config.name_pattern.as_ref());

        let mut imported: HashMap<Uuid, (ResourceId, Option<ResourceId>)> = HashMap::new();
        let mut units = units;
        for unit in units.iter_mut().filter(|u| u.stage == UnitStage::Fetched) {
            if cancel.is_cancelled() {
                break;
            }
            let payload = unit.take_payload().unwrap_or_default();
            match reconciler
                .reconcile(
                    self.catalog.as_ref(),
                    dataset_id,
                    prior_top.as_ref(),
                    &unit.remote_name,
                    payload,
                )
                .await
            {
                Ok(done) => {
                    log_transition(unit.mark_imported());
                    imported.insert(unit.id, (done.resource_id, done.superseded));
                }
                Err(e) => {
                    let e = UnitError::from(e);
                    warn!(unit = %unit.remote_name, error = %e, "Import failed");
                    log_transition(unit.fail(e.to_string()));
                }
            }
        }

        // ====================================================================
        // Stage 4: Finalize
        // ====================================================================

        let cancelled = cancel.is_cancelled();
        let mut pruned = Vec::new();
        let mut permalink = None;
        let mut finalize_error = None;

        // committed imports are finalized even when the run was cancelled
        match self.finalize(config, &reconciler, dataset_id).await {
            Ok((retired, target)) => {
                pruned = retired;
                permalink = target;
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Retention pass failed");
                finalize_error = Some(e.to_string());
            }
        }

        let units: Vec<UnitReport> = units
            .into_iter()
            .map(|unit| {
                let outcome = imported.get(&unit.id).copied();
                UnitReport::summarize(unit, outcome)
            })
            .collect();

        let status = run_status(&units, cancelled, finalize_error.is_some());
        run.finish(status);
        self.record(run).await;

        let report = RunReport {
            run_id: run.id,
            source_id: run.source_id.clone(),
            dataset_id,
            status,
            started_at: run.started_at,
            finished_at: run.finished_at.unwrap_or(run.started_at),
            permalink: permalink.as_ref().map(|r| r.id),
            permalink_url: match (&self.settings.site_url, &permalink) {
                (Some(site), Some(resource)) => Some(download_url(site, resource)),
                _ => None,
            },
            units,
            pruned,
            finalize_error,
        };

        info!(
            run_id = %run.id,
            status = ?report.status,
            imported = report.imported(),
            failed = report.failed(),
            pruned = report.pruned.len(),
            "Harvest run finished"
        );
        Ok(report)
    }

    /// Lists the remote folder, resolves the dataset and creates one unit per selected entry.
    async fn gather(
        &self,
        config: &RunConfig,
        run: &HarvestRun,
    ) -> Result<(DatasetId, Vec<HarvestUnit>), HarvestError> {
        let entries = self
            .storage
            .list_entries(&config.folder)
            .await
            .map_err(|source| HarvestError::Listing {
                folder: config.folder.clone(),
                source,
            })?;

        let dataset_err = |source: CatalogError| HarvestError::Dataset {
            dataset: config.dataset.clone(),
            source,
        };
        let dataset_id = self
            .catalog
            .ensure_dataset(&config.dataset)
            .await
            .map_err(dataset_err)?;

        let candidates: Vec<_> = entries
            .into_iter()
            .filter(|entry| {
                let transient = is_transient(&entry.name);
                if transient {
                    debug!(name = %entry.name, "Skipping transient file");
                }
                !transient
            })
            .collect();

        let held = self
            .catalog
            .get_all_resources(dataset_id)
            .await
            .map_err(dataset_err)?;
        let detector = ChangeDetector::new(config.mode, run.last_successful_run_at)
            .with_pattern(config.name_pattern.as_ref())
            .with_resources(&held)
            .with_missing(config.include_missing);

        let units = detector
            .select(&candidates)
            .iter()
            .map(HarvestUnit::gathered)
            .collect();
        Ok((dataset_id, units))
    }

    /// Fetches all gathered units concurrently; the executor bounds parallelism.
    async fn fetch_all(
        &self,
        folder: &str,
        units: Vec<HarvestUnit>,
        cancel: &CancellationToken,
    ) -> Vec<HarvestUnit> {
        let storage = self.storage.as_ref();
        let executor = &self.executor;

        let fetches = units.into_iter().map(|mut unit| async move {
            let name = unit.remote_name.clone();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return unit,
                result = executor.execute(storage, folder, &name) => result,
            };
            match result {
                Ok(bytes) => log_transition(unit.mark_fetched(bytes)),
                Err(e) => {
                    warn!(unit = %unit.remote_name, error = %e, "Fetch failed");
                    log_transition(unit.fail(e.to_string()));
                }
            }
            unit
        });

        join_all(fetches).await
    }

    /// Retention pass and permalink refresh, under the dataset lock.
    async fn finalize(
        &self,
        config: &RunConfig,
        reconciler: &ResourceReconciler<'_>,
        dataset_id: DatasetId,
    ) -> Result<(Vec<ResourceId>, Option<Resource>), CatalogError> {
        let pruner = RetentionPruner::new(config.max_resources)
            .with_reclaim(config.reclaim_pruned_content);
        let pruned = pruner.prune(self.catalog.as_ref(), dataset_id).await?;
        let permalink = reconciler
            .refresh_permalink(self.catalog.as_ref(), dataset_id)
            .await?;
        Ok((pruned, permalink))
    }

    async fn record(&self, run: &HarvestRun) {
        if let Err(e) = self.runs.record_run(run).await {
            warn!(run_id = %run.id, error = %e, "Failed to record harvest run");
        }
    }
}

fn log_transition(result: Result<(), TransitionError>) {
    if let Err(e) = result {
        warn!(error = %e, "Ignoring unit transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, MemoryRunStore};
    use crate::config::SourceConfig;
    use crate::harvest::report::UnitOutcome;
    use crate::model::{NewResource, ResourceChangeSet, ResourceState};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    const FOLDER: &str = "Test/DiDok";

    type TestPipeline = HarvestPipeline<MemoryStorage, MemoryCatalog, MemoryRunStore>;

    fn pipeline() -> TestPipeline {
        crate::logging::init();
        HarvestPipeline::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryRunStore::new()),
        )
    }

    fn config() -> SourceConfig {
        SourceConfig {
            dataset: "didok".to_string(),
            environment: "Test".to_string(),
            folder: "DiDok".to_string(),
            ..Default::default()
        }
    }

    fn source(config: SourceConfig) -> HarvestSource {
        HarvestSource::new("didok-source", config)
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 9, d, 8, 0, 0).unwrap()
    }

    /// A modification time after every run started so far.
    fn fresh() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(1)
    }

    async fn upload(p: &TestPipeline, name: &str, content: &str, at: DateTime<Utc>) {
        p.storage().put(FOLDER, name, content, at).await;
    }

    async fn active_names(p: &TestPipeline) -> Vec<String> {
        p.catalog()
            .dataset("didok")
            .await
            .unwrap()
            .resources()
            .into_iter()
            .map(|r| r.identifier.clone())
            .collect()
    }

    async fn seed(p: &TestPipeline, identifier: &str, description: &str) -> ResourceId {
        let dataset = p.catalog().ensure_dataset("didok").await.unwrap();
        p.catalog()
            .create_resource(
                dataset,
                NewResource {
                    identifier: identifier.to_string(),
                    title: identifier.to_string(),
                    description: description.to_string(),
                    content: Vec::new(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_run_imports_everything() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        upload(&p, "20160903.csv.tmp", "partial", day(3)).await;

        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.imported(), 2);
        assert!(report.unit("20160903.csv.tmp").is_none());
        assert_eq!(active_names(&p).await, vec!["20160902.csv", "20160901.csv"]);

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let top = dataset.resources()[0].clone();
        assert_eq!(dataset.permalink_resource_id, Some(top.id));
        assert_eq!(report.permalink, Some(top.id));
        assert_eq!(top.title, "20160902.csv");
        assert_eq!(top.description, "");
        assert_eq!(p.catalog().content(top.id).await.unwrap(), b"two");

        let runs = p.runs.runs("didok-source").await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Some(RunStatus::Success));
        assert_eq!(runs[0].last_successful_run_at, None);
    }

    #[tokio::test]
    async fn test_empty_folder_succeeds() {
        let p = pipeline();
        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(report.units.is_empty());
        assert!(active_names(&p).await.is_empty());
        assert_eq!(report.permalink, None);
    }

    #[tokio::test]
    async fn test_new_resource_inherits_description_of_top_resource() {
        let p = pipeline();
        seed(&p, "20160801.csv", "Daily stop list").await;
        upload(&p, "20160901.csv", "one", day(1)).await;

        p.run(&source(config())).await.unwrap();

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let created = dataset.active_by_identifier("20160901.csv").unwrap();
        assert_eq!(created.description, "Daily stop list");
        assert_eq!(created.title, "20160901.csv");
        assert_eq!(dataset.resources().len(), 2);
    }

    #[tokio::test]
    async fn test_same_filename_supersedes_previous_version() {
        let p = pipeline();
        let old = seed(&p, "20160901.csv", "Stops").await;
        let dataset = p.catalog().ensure_dataset("didok").await.unwrap();
        p.catalog().set_permalink(dataset, Some(old)).await.unwrap();
        upload(&p, "20160901.csv", "corrected", fresh()).await;

        let report = p.run(&source(config())).await.unwrap();

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let active = dataset.resources();
        assert_eq!(active.len(), 1);
        assert_eq!(dataset.resources_all.len(), 2);
        assert_ne!(active[0].id, old);
        assert_eq!(active[0].description, "Stops");
        assert_eq!(dataset.resource(old).unwrap().state, ResourceState::Deleted);
        assert_eq!(dataset.permalink_resource_id, Some(active[0].id));
        assert_eq!(
            report.unit("20160901.csv").unwrap().outcome,
            UnitOutcome::Imported {
                resource_id: active[0].id,
                superseded: Some(old),
            }
        );
    }

    #[tokio::test]
    async fn test_second_run_skips_unchanged_files() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;

        let first = p.run(&source(config())).await.unwrap();
        let second = p.run(&source(config())).await.unwrap();

        assert_eq!(second.status, RunStatus::Success);
        assert!(second.units.is_empty());
        assert_eq!(second.permalink, first.permalink);
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources_all.len(), 2);

        let runs = p.runs.runs("didok-source").await;
        assert_eq!(runs[1].last_successful_run_at, Some(first.started_at));
    }

    #[tokio::test]
    async fn test_force_all_reimports_every_file() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        p.run(&source(config())).await.unwrap();

        let forced = SourceConfig {
            force_all: true,
            ..config()
        };
        let report = p.run(&source(forced)).await.unwrap();

        assert_eq!(report.imported(), 1);
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources().len(), 1);
        assert_eq!(dataset.resources_all.len(), 2);
    }

    #[tokio::test]
    async fn test_old_file_missing_from_dataset_is_harvested() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        p.run(&source(config())).await.unwrap();

        let long_ago = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        upload(&p, "NewFile.csv", "late upload", long_ago).await;
        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.imported(), 1);
        assert!(report.unit("NewFile.csv").unwrap().is_imported());
        assert_eq!(active_names(&p).await, vec!["NewFile.csv", "20160901.csv"]);

        upload(&p, "Another.csv", "late upload", long_ago).await;
        let disabled = SourceConfig {
            include_missing: false,
            ..config()
        };
        assert!(p.run(&source(disabled)).await.unwrap().units.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_resources_are_not_reharvested() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        p.run(&source(config())).await.unwrap();

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let retired = dataset.active_by_identifier("20160901.csv").unwrap().id;
        p.catalog()
            .set_resource_state(retired, ResourceState::Deleted)
            .await
            .unwrap();

        let report = p.run(&source(config())).await.unwrap();
        assert!(report.units.is_empty());
        assert_eq!(active_names(&p).await, vec!["20160902.csv"]);
    }

    #[tokio::test]
    async fn test_newer_file_takes_permalink() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        p.run(&source(config())).await.unwrap();

        upload(&p, "20160902.csv", "two", fresh()).await;
        let report = p.run(&source(config())).await.unwrap();

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let newest = dataset.active_by_identifier("20160902.csv").unwrap();
        assert_eq!(dataset.resources().len(), 2);
        assert_eq!(dataset.permalink_resource_id, Some(newest.id));
        assert_eq!(report.permalink, Some(newest.id));
    }

    #[tokio::test]
    async fn test_updating_older_file_keeps_permalink() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        let first = p.run(&source(config())).await.unwrap();

        upload(&p, "20160901.csv", "one, corrected", fresh()).await;
        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.imported(), 1);
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources().len(), 2);
        assert_eq!(dataset.resources_all.len(), 3);
        assert_eq!(dataset.permalink_resource_id, first.permalink);
    }

    #[tokio::test]
    async fn test_updating_newest_file_moves_permalink_to_new_revision() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        let first = p.run(&source(config())).await.unwrap();

        upload(&p, "20160902.csv", "two, corrected", fresh()).await;
        let report = p.run(&source(config())).await.unwrap();

        let dataset = p.catalog().dataset("didok").await.unwrap();
        let revision = dataset.active_by_identifier("20160902.csv").unwrap();
        assert_ne!(Some(revision.id), first.permalink);
        assert_eq!(dataset.permalink_resource_id, Some(revision.id));
        assert_eq!(report.permalink, Some(revision.id));
        assert_eq!(
            p.catalog().content(revision.id).await.unwrap(),
            b"two, corrected"
        );
    }

    #[tokio::test]
    async fn test_pattern_limits_selection_and_permalink() {
        let p = pipeline();
        seed(&p, "zz_notes.txt", "").await;
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        upload(&p, "readme.txt", "docs", day(3)).await;

        let filtered = SourceConfig {
            resource_regex: Some(r"\d{8}\.csv".to_string()),
            ..config()
        };
        let report = p.run(&source(filtered)).await.unwrap();

        assert_eq!(report.imported(), 2);
        assert!(report.unit("readme.txt").is_none());
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources()[0].identifier, "zz_notes.txt");
        assert_eq!(dataset.permalink().unwrap().identifier, "20160902.csv");
    }

    #[tokio::test]
    async fn test_max_resources_prunes_lowest_identifiers() {
        let p = pipeline();
        for d in 1..=4 {
            upload(&p, &format!("2016090{d}.csv"), "x", day(d)).await;
        }
        let bounded = SourceConfig {
            max_resources: Some(3),
            reclaim_pruned_content: true,
            ..config()
        };
        let report = p.run(&source(bounded)).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(
            active_names(&p).await,
            vec!["20160904.csv", "20160903.csv", "20160902.csv"]
        );

        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources_all.len(), 4);
        let retired = dataset.resource(report.pruned[0]).unwrap();
        assert_eq!(retired.identifier, "20160901.csv");
        assert_eq!(retired.state, ResourceState::Deleted);
        assert!(p.catalog().content(retired.id).await.is_none());
        assert_eq!(dataset.permalink().unwrap().identifier, "20160904.csv");

        let bounded = SourceConfig {
            max_resources: Some(3),
            ..config()
        };
        let again = p.run(&source(bounded)).await.unwrap();
        assert!(again.units.is_empty());
        assert!(again.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_pruning_leaves_superseded_revisions_alone() {
        let p = pipeline();
        let bounded = SourceConfig {
            max_resources: Some(2),
            ..config()
        };
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        p.run(&source(bounded.clone())).await.unwrap();

        upload(&p, "20160901.csv", "one, corrected", Utc::now()).await;
        let revised = p.run(&source(bounded.clone())).await.unwrap();
        assert_eq!(revised.imported(), 1);

        upload(&p, "20160903.csv", "three", Utc::now()).await;
        let report = p.run(&source(bounded)).await.unwrap();

        assert_eq!(report.imported(), 1);
        assert!(report.unit("20160901.csv").is_none());
        assert_eq!(active_names(&p).await, vec!["20160903.csv", "20160902.csv"]);
        assert_eq!(report.pruned.len(), 1);
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources_all.len(), 4);
        assert!(dataset
            .resources_all
            .iter()
            .filter(|r| r.identifier == "20160901.csv")
            .all(|r| r.state == ResourceState::Deleted));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        p.storage().fail_fetch("20160902.csv").await;

        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!((report.imported(), report.failed()), (1, 1));
        match &report.unit("20160902.csv").unwrap().outcome {
            UnitOutcome::Failed { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].stage, UnitStage::Gathered);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(active_names(&p).await, vec!["20160901.csv"]);
        assert_eq!(
            p.runs.last_successful_run("didok-source").await.unwrap(),
            Some(report.started_at)
        );

        p.storage().clear_fetch_failures().await;
        let retry = p.run(&source(config())).await.unwrap();
        assert_eq!(retry.status, RunStatus::Success);
        assert_eq!(retry.imported(), 1);
        assert!(retry.unit("20160902.csv").unwrap().is_imported());
        assert_eq!(active_names(&p).await, vec!["20160902.csv", "20160901.csv"]);
    }

    #[tokio::test]
    async fn test_all_units_failing_keeps_watermark() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        p.storage().fail_fetch("20160901.csv").await;
        p.storage().fail_fetch("20160902.csv").await;

        let report = p.run(&source(config())).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            p.runs.last_successful_run("didok-source").await.unwrap(),
            None
        );

        p.storage().clear_fetch_failures().await;
        let retry = p.run(&source(config())).await.unwrap();
        assert_eq!(retry.status, RunStatus::Success);
        assert_eq!(retry.imported(), 2);
    }

    #[tokio::test]
    async fn test_fetch_timeout_fails_unit() {
        let p = pipeline().with_settings(PipelineSettings {
            fetch_timeout: Some(Duration::from_millis(20)),
            ..PipelineSettings::default()
        });
        upload(&p, "20160901.csv", "one", day(1)).await;
        p.storage().set_fetch_delay(Duration::from_millis(500)).await;

        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.unit("20160901.csv").unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_import_failure_leaves_dataset_consistent() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;
        p.catalog().fail_create_for("20160902.csv").await;

        let report = p.run(&source(config())).await.unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        match &report.unit("20160902.csv").unwrap().outcome {
            UnitOutcome::Failed { errors } => assert_eq!(errors[0].stage, UnitStage::Fetched),
            other => panic!("unexpected outcome {:?}", other),
        }
        let dataset = p.catalog().dataset("didok").await.unwrap();
        assert_eq!(dataset.resources_all.len(), 1);
        assert_eq!(dataset.permalink().unwrap().identifier, "20160901.csv");
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_run() {
        let p = pipeline();
        p.storage().fail_listing(Some("530 login incorrect")).await;

        let err = p.run(&source(config())).await.unwrap_err();

        assert!(matches!(err, HarvestError::Listing { ref folder, .. } if folder == FOLDER));
        let runs = p.runs.runs("didok-source").await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Some(RunStatus::Failed));
        assert!(p.catalog().dataset("didok").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_records_nothing() {
        let p = pipeline();
        let broken = SourceConfig {
            resource_regex: Some("(".to_string()),
            ..config()
        };

        let err = p.run(&source(broken)).await.unwrap_err();

        assert!(matches!(err, HarvestError::Config(_)));
        assert!(p.runs.runs("didok-source").await.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let locks = Arc::new(LockRegistry::new());
        let p = pipeline().with_locks(locks.clone());
        let _held = locks.try_acquire_run("didok-source").unwrap();

        let err = p.run(&source(config())).await.unwrap_err();

        assert!(matches!(err, HarvestError::RunInProgress(ref id) if id == "didok-source"));
        assert!(p.runs.runs("didok-source").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_abandons_pending_units() {
        let p = pipeline();
        upload(&p, "20160901.csv", "one", day(1)).await;
        upload(&p, "20160902.csv", "two", day(2)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = p
            .run_cancellable(&source(config()), cancel)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report
            .units
            .iter()
            .all(|u| u.outcome == UnitOutcome::Abandoned { stage: UnitStage::Gathered }));
        assert!(active_names(&p).await.is_empty());
        assert_eq!(
            p.runs.last_successful_run("didok-source").await.unwrap(),
            None
        );

        let resumed = p.run(&source(config())).await.unwrap();
        assert_eq!(resumed.imported(), 2);
    }

    /// Cancels `token` as soon as the first change set is committed.
    struct CancelAfterCommit {
        inner: MemoryCatalog,
        token: CancellationToken,
    }

    #[async_trait]
    impl Catalog for CancelAfterCommit {
        async fn ensure_dataset(&self, slug: &str) -> Result<DatasetId, CatalogError> {
            self.inner.ensure_dataset(slug).await
        }
        async fn get_active_resources(
            &self,
            dataset: DatasetId,
        ) -> Result<Vec<Resource>, CatalogError> {
            self.inner.get_active_resources(dataset).await
        }
        async fn get_all_resources(
            &self,
            dataset: DatasetId,
        ) -> Result<Vec<Resource>, CatalogError> {
            self.inner.get_all_resources(dataset).await
        }
        async fn create_resource(
            &self,
            dataset: DatasetId,
            resource: NewResource,
        ) -> Result<ResourceId, CatalogError> {
            self.inner.create_resource(dataset, resource).await
        }
        async fn set_resource_state(
            &self,
            resource: ResourceId,
            state: ResourceState,
        ) -> Result<(), CatalogError> {
            self.inner.set_resource_state(resource, state).await
        }
        async fn get_permalink(
            &self,
            dataset: DatasetId,
        ) -> Result<Option<ResourceId>, CatalogError> {
            self.inner.get_permalink(dataset).await
        }
        async fn set_permalink(
            &self,
            dataset: DatasetId,
            resource: Option<ResourceId>,
        ) -> Result<(), CatalogError> {
            self.inner.set_permalink(dataset, resource).await
        }
        async fn commit(&self, change: &ResourceChangeSet) -> Result<ResourceId, CatalogError> {
            let created = self.inner.commit(change).await?;
            self.token.cancel();
            Ok(created)
        }
    }

    #[tokio::test]
    async fn test_committed_imports_survive_cancellation() {
        let token = CancellationToken::new();
        let p = HarvestPipeline::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(CancelAfterCommit {
                inner: MemoryCatalog::new(),
                token: token.clone(),
            }),
            Arc::new(MemoryRunStore::new()),
        );
        p.storage().put(FOLDER, "20160901.csv", "one", day(1)).await;
        p.storage().put(FOLDER, "20160902.csv", "two", day(2)).await;

        let cancelled = p.run_cancellable(&source(config()), token).await.unwrap();

        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.imported(), 1);
        assert_eq!(
            cancelled.unit("20160902.csv").unwrap().outcome,
            UnitOutcome::Abandoned {
                stage: UnitStage::Fetched
            }
        );
        let dataset = p.catalog().inner.dataset("didok").await.unwrap();
        assert_eq!(cancelled.permalink, dataset.permalink_resource_id);
        assert_eq!(dataset.permalink().unwrap().identifier, "20160901.csv");

        let resumed = p.run(&source(config())).await.unwrap();

        assert_eq!(resumed.status, RunStatus::Success);
        assert_eq!(resumed.imported(), 1);
        assert!(resumed.unit("20160901.csv").is_none());
        let dataset = p.catalog().inner.dataset("didok").await.unwrap();
        assert_eq!(dataset.resources_all.len(), 2);
        assert_eq!(dataset.permalink().unwrap().identifier, "20160902.csv");
    }

    #[tokio::test]
    async fn test_report_renders_permalink_url() {
        let p = pipeline().with_settings(PipelineSettings {
            site_url: Some("https://opendata.example.org/".to_string()),
            ..PipelineSettings::default()
        });
        upload(&p, "20160901.csv", "one", day(1)).await;

        let report = p.run(&source(config())).await.unwrap();

        let resource = report.permalink.unwrap();
        assert_eq!(
            report.permalink_url,
            Some(format!(
                "https://opendata.example.org/dataset/{}/resource/{}/download/20160901.csv",
                report.dataset_id, resource
            ))
        );
    }

    #[tokio::test]
    async fn test_runs_of_different_sources_share_catalog() {
        let locks = Arc::new(LockRegistry::new());
        let storage = Arc::new(MemoryStorage::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let runs = Arc::new(MemoryRunStore::new());
        let p = HarvestPipeline::new(storage.clone(), catalog.clone(), runs.clone())
            .with_locks(locks.clone());
        let q = HarvestPipeline::new(storage.clone(), catalog.clone(), runs).with_locks(locks);

        storage.put("Test/DiDok", "20160901.csv", "a", day(1)).await;
        storage.put("Test/Info+", "20160902.csv", "b", day(2)).await;
        let info = SourceConfig {
            folder: "Info+".to_string(),
            ..config()
        };

        let didok = source(config());
        let infoplus = HarvestSource::new("infoplus-source", info);
        let (a, b) = tokio::join!(p.run(&didok), q.run(&infoplus));

        assert_eq!(a.unwrap().imported(), 1);
        assert_eq!(b.unwrap().imported(), 1);
        let dataset = catalog.dataset("didok").await.unwrap();
        assert_eq!(dataset.resources().len(), 2);
        assert_eq!(dataset.permalink().unwrap().identifier, "20160902.csv");
    }
}
