//! Harvest source configuration.
//!
//! A harvest source carries its configuration as a JSON document, e.g.
//!
//! ```json
//! {
//!     "dataset": "timetable",
//!     "environment": "Test",
//!     "folder": "Info+",
//!     "force_all": false,
//!     "resource_regex": "\\d{8}.csv",
//!     "max_resources": 3
//! }
//! ```
//!
//! Everything except `dataset` is optional. [`SourceConfig::validate`] turns
//! the raw document into a [`RunConfig`] with the name pattern compiled, so a
//! bad pattern is rejected before the run touches anything.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::RunMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid source config: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Source config is missing the dataset name")]
    MissingDataset,
    #[error("Invalid resource_regex '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("max_resources must be at least 1, got {0}")]
    InvalidMaxResources(usize),
}

/// Raw per-source configuration as stored with the harvest source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub dataset: String,
    pub environment: String,
    pub folder: String,
    pub force_all: bool,
    pub resource_regex: Option<String>,
    pub max_resources: Option<usize>,
    /// Re-harvest files older than the last run when the dataset has never held them. On by default.
    pub include_missing: bool,
    pub reclaim_pruned_content: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            environment: String::new(),
            folder: String::new(),
            force_all: false,
            resource_regex: None,
            max_resources: None,
            include_missing: true,
            reclaim_pruned_content: false,
        }
    }
}

impl SourceConfig {
    /// Parses a stored config document. `None` and blank strings yield the defaults.
    pub fn from_json(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(text) => Ok(serde_json::from_str(text)?),
        }
    }

    /// Remote folder to list: `environment/folder` without stray slashes.
    pub fn remote_folder(&self) -> String {
        [self.environment.as_str(), self.folder.as_str()]
            .into_iter()
            .flat_map(|part| part.split('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn validate(&self) -> Result<RunConfig, ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::MissingDataset);
        }
        if let Some(max) = self.max_resources {
            if max == 0 {
                return Err(ConfigError::InvalidMaxResources(max));
            }
        }
        let name_pattern = self
            .resource_regex
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(NamePattern::new)
            .transpose()?;

        Ok(RunConfig {
            dataset: self.dataset.trim().to_string(),
            folder: self.remote_folder(),
            mode: if self.force_all {
                RunMode::ForceAll
            } else {
                RunMode::Normal
            },
            name_pattern,
            max_resources: self.max_resources,
            include_missing: self.include_missing,
            reclaim_pruned_content: self.reclaim_pruned_content,
        })
    }
}

/// Validated configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset: String,
    pub folder: String,
    pub mode: RunMode,
    pub name_pattern: Option<NamePattern>,
    pub max_resources: Option<usize>,
    pub include_missing: bool,
    pub reclaim_pruned_content: bool,
}

/// Filename filter. A name matches when the pattern matches it in full.
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    regex: Regex,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex =
            Regex::new(&format!("^(?:{pattern})$")).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Returns true when `pattern` is absent or matches `name`.
pub fn matches(pattern: Option<&NamePattern>, name: &str) -> bool {
    pattern.map_or(true, |p| p.is_match(name))
}

/// A configured harvest source: a remote folder feeding one dataset.
#[derive(Debug, Clone)]
pub struct HarvestSource {
    pub id: String,
    pub config: SourceConfig,
}

impl HarvestSource {
    pub fn new(id: impl Into<String>, config: SourceConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    pub fn from_json(id: impl Into<String>, raw: Option<&str>) -> Result<Self, ConfigError> {
        Ok(Self::new(id, SourceConfig::from_json(raw)?))
    }
}

/// Engine-wide settings shared by every run of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum number of concurrent fetches per run.
    pub fetch_concurrency: usize,
    /// Per-file fetch timeout. No timeout when unset.
    pub fetch_timeout: Option<Duration>,
    /// Base URL of the catalog site, used to render permalink URLs in run reports.
    pub site_url: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            fetch_timeout: None,
            site_url: None,
        }
    }
}
