//! Harvest module - remote folder to catalog reconciliation engine.
//!
//! This module provides the pieces of a harvest run:
//! - **Detection**: [`ChangeDetector`] picks the remote files that are new work
//! - **Pipeline**: [`HarvestPipeline`] drives units through gather, fetch and import
//! - **Reconciliation**: [`ResourceReconciler`] maps files onto dataset resources
//! - **Retention**: [`RetentionPruner`] bounds the number of active resources
//! - **Reporting**: [`RunReport`] with per-unit outcomes and the run status

pub mod detector;
pub mod error;
pub mod pipeline;
pub mod prune;
pub mod reconcile;
pub mod report;

// Re-export commonly used types
pub use detector::{select, ChangeDetector};
pub use error::{HarvestError, UnitError};
pub use pipeline::HarvestPipeline;
pub use prune::RetentionPruner;
pub use reconcile::{select_permalink, Reconciled, ResourceReconciler};
pub use report::{RunReport, UnitOutcome, UnitReport};
