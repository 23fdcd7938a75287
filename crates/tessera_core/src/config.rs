//! Database configuration.

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether index contents are written to index-aware backing stores and
    /// read back on open instead of being rebuilt from rows.
    pub persist_indices: bool,

    /// Whether the planner may replace filtered full scans with index range
    /// scans.
    pub index_scans: bool,

    /// Whether equi-joins use the hash join algorithm.
    pub hash_joins: bool,

    /// Largest observed result diffed entry by entry. Larger results are
    /// reported as a full replacement when they change.
    pub observer_diff_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persist_indices: false,
            index_scans: true,
            hash_joins: true,
            observer_diff_limit: 10_000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether index contents are persisted.
    #[must_use]
    pub const fn persist_indices(mut self, value: bool) -> Self {
        self.persist_indices = value;
        self
    }

    /// Sets whether index range scans are planned.
    #[must_use]
    pub const fn index_scans(mut self, value: bool) -> Self {
        self.index_scans = value;
        self
    }

    /// Sets whether hash joins are planned.
    #[must_use]
    pub const fn hash_joins(mut self, value: bool) -> Self {
        self.hash_joins = value;
        self
    }

    /// Sets the observer diff limit.
    #[must_use]
    pub const fn observer_diff_limit(mut self, limit: usize) -> Self {
        self.observer_diff_limit = limit;
        self
    }
}
