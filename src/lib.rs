pub mod catalog;
pub mod config;
pub mod executor;
pub mod harvest;
pub mod locks;
pub mod logging;
pub mod model;
pub mod storage;
pub mod traits;

// Re-export common types for convenience
pub use config::{ConfigError, HarvestSource, PipelineSettings, RunConfig, SourceConfig};
pub use executor::*;
pub use harvest::{HarvestError, HarvestPipeline, RunReport, UnitError};
pub use locks::LockRegistry;
pub use model::*;
pub use traits::*;
