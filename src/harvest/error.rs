//! Error taxonomy of a harvest run.
//!
//! Errors come in two scopes:
//! - **Run-scoped** ([`HarvestError`]): abort the run before any unit is
//!   processed (invalid config, remote listing failure, overlapping run,
//!   dataset resolution failure).
//! - **Unit-scoped** ([`UnitError`]): recorded on the failing unit, which
//!   becomes `Failed`, while its siblings carry on.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::traits::{CatalogError, StorageError};

/// Errors that abort a whole run.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote folder could not be listed; no units were produced
    #[error("Listing of '{folder}' failed: {source}")]
    Listing {
        folder: String,
        #[source]
        source: StorageError,
    },

    /// Another run of the same source is still in progress
    #[error("A run for source '{0}' is already in progress")]
    RunInProgress(String),

    /// The target dataset could not be resolved or read
    #[error("Dataset '{dataset}' unavailable: {source}")]
    Dataset {
        dataset: String,
        #[source]
        source: CatalogError,
    },
}

/// Errors confined to a single harvest unit.
#[derive(Error, Debug)]
pub enum UnitError {
    /// Transport failure while downloading the file
    #[error("Fetch failed: {0}")]
    Fetch(#[from] StorageError),

    /// Download exceeded the configured fetch timeout
    #[error("Fetch of '{name}' timed out after {timeout:?}")]
    FetchTimeout { name: String, timeout: Duration },

    /// Fetch pool is unavailable
    #[error("Fetch executor error: {0}")]
    Executor(String),

    /// Catalog write failed while reconciling the file
    #[error("Reconcile failed: {0}")]
    Reconcile(#[from] CatalogError),
}
