//! Table selection for exports.
//!
//! A [`TableFilter`] combines an explicit table subset with glob exclusion
//! patterns. An empty subset means every table.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{BackupError, Result};

/// Selects which tables of a database are exported.
#[derive(Debug, Clone)]
pub struct TableFilter {
    /// Explicit subset, in the caller's order. Empty means all tables.
    include: Vec<String>,
    /// Compiled exclusion patterns
    exclude: GlobSet,
}

impl TableFilter {
    /// Creates a filter from an explicit subset and exclusion globs.
    pub fn new(include: Vec<String>, exclude_patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                BackupError::InvalidOptions(format!(
                    "Invalid table exclusion pattern '{}': {}",
                    pattern, e
                ))
            })?;
            builder.add(glob);
        }

        let exclude = builder.build().map_err(|e| {
            BackupError::InvalidOptions(format!("Failed to build table exclusion set: {}", e))
        })?;

        Ok(Self { include, exclude })
    }

    /// A filter that keeps every table.
    pub fn all() -> Self {
        Self {
            include: Vec::new(),
            exclude: GlobSet::empty(),
        }
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.exclude.is_match(table)
    }

    /// Applies the filter to the tables that exist.
    ///
    /// With an explicit subset, the subset's order is kept and names missing
    /// from `available` are reported as an error. Otherwise `available` is
    /// returned in its own order, minus exclusions.
    pub fn select(&self, available: &[String]) -> Result<Vec<String>> {
        if self.include.is_empty() {
            return Ok(available
                .iter()
                .filter(|t| !self.is_excluded(t))
                .cloned()
                .collect());
        }

        let missing: Vec<&str> = self
            .include
            .iter()
            .filter(|t| !available.contains(t))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BackupError::InvalidOptions(format!(
                "Tables not found: {}",
                missing.join(", ")
            )));
        }

        Ok(self
            .include
            .iter()
            .filter(|t| !self.is_excluded(t))
            .cloned()
            .collect())
    }
}

impl Default for TableFilter {
    fn default() -> Self {
        Self::all()
    }
}
