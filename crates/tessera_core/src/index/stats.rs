//! Per-index statistics.

use crate::index::key::Key;

/// Row count and largest key seen by an index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of live (key, row id) entries.
    pub total_rows: usize,
    /// Largest key ever added, in value order. Not lowered by removals.
    pub max_key_encountered: Option<Key>,
}

impl IndexStats {
    /// Creates empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, key: &Key, count: usize) {
        self.total_rows += count;
        if self.max_key_encountered.as_ref().map_or(true, |max| key > max) {
            self.max_key_encountered = Some(key.clone());
        }
    }

    pub(crate) fn remove(&mut self, count: usize) {
        self.total_rows = self.total_rows.saturating_sub(count);
    }

    pub(crate) fn clear(&mut self) {
        self.total_rows = 0;
    }

    /// Replaces the row count with the sum of `list`.
    ///
    /// Used to estimate the size of an input spanning several tables; pass
    /// one index per table so no table is counted twice.
    pub fn update_from_list(&mut self, list: &[&IndexStats]) {
        self.total_rows = list.iter().map(|s| s.total_rows).sum();
    }
}
