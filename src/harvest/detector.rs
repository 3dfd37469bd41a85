//! Selection of the remote entries that are new work for a run.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::config::{matches, NamePattern};
use crate::model::{RemoteEntry, Resource, RunMode};

/// Decides which listed entries a run harvests.
///
/// In [`RunMode::Normal`] an entry is selected when it was modified after the
/// last successful run, unless the dataset already holds an active copy
/// created at or after the entry's modification time. With missing-file
/// re-harvest enabled, an entry whose identifier the dataset has never held
/// is selected whatever its age. In [`RunMode::ForceAll`] every entry is
/// selected. The optional name pattern applies in both modes.
#[derive(Debug, Clone)]
pub struct ChangeDetector<'a> {
    mode: RunMode,
    last_run: Option<DateTime<Utc>>,
    pattern: Option<&'a NamePattern>,
    /// Creation time of the active resource per identifier.
    active: HashMap<String, DateTime<Utc>>,
    /// Every identifier the dataset has held, in any state.
    seen: HashSet<String>,
    include_missing: bool,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(mode: RunMode, last_run: Option<DateTime<Utc>>) -> Self {
        Self {
            mode,
            last_run,
            pattern: None,
            active: HashMap::new(),
            seen: HashSet::new(),
            include_missing: false,
        }
    }

    pub fn with_pattern(mut self, pattern: Option<&'a NamePattern>) -> Self {
        self.pattern = pattern;
        self
    }

    /// Dataset contents to compare the listing against (all states).
    pub fn with_resources<'r, I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = &'r Resource>,
    {
        for resource in resources {
            self.seen.insert(resource.identifier.clone());
            if resource.is_active() {
                self.active
                    .insert(resource.identifier.clone(), resource.created_at);
            }
        }
        self
    }

    /// Also selects old entries whose identifier the dataset has never held.
    pub fn with_missing(mut self, include_missing: bool) -> Self {
        self.include_missing = include_missing;
        self
    }

    pub fn is_selected(&self, entry: &RemoteEntry) -> bool {
        if !matches(self.pattern, &entry.name) {
            return false;
        }
        if self.mode == RunMode::ForceAll {
            return true;
        }

        let changed = self.last_run.map_or(true, |last| entry.modified_at > last);
        let missing = self.include_missing && !self.seen.contains(&entry.name);
        if !(changed || missing) {
            return false;
        }
        // a cancelled or failed run may already have imported this version
        !self
            .active
            .get(&entry.name)
            .is_some_and(|created_at| *created_at >= entry.modified_at)
    }

    pub fn select(&self, entries: &[RemoteEntry]) -> Vec<RemoteEntry> {
        entries
            .iter()
            .filter(|entry| self.is_selected(entry))
            .cloned()
            .collect()
    }
}

/// Entries modified after `last_run` (or all entries in force mode) matching `pattern`.
pub fn select(
    entries: &[RemoteEntry],
    last_run: Option<DateTime<Utc>>,
    mode: RunMode,
    pattern: Option<&NamePattern>,
) -> Vec<RemoteEntry> {
    ChangeDetector::new(mode, last_run)
        .with_pattern(pattern)
        .select(entries)
}

/// Partial uploads and other scratch files left on the remote side.
pub fn is_transient(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".tmp")
}
