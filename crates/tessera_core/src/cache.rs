//! Row cache.
//!
//! The cache is the authoritative in-memory copy of every committed row. It
//! is only mutated by journal commits and context reseeding.

use crate::row::Row;
use crate::types::RowId;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Map of row id to committed row, plus the set of ids per table.
#[derive(Debug, Default)]
pub struct Cache {
    rows: HashMap<RowId, Arc<Row>>,
    tables: HashMap<String, BTreeSet<RowId>>,
}

impl Cache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `row` under `table`, replacing any row with the same id.
    pub fn set(&mut self, table: &str, row: Arc<Row>) {
        let id = row.id();
        self.rows.insert(id, row);
        self.tables.entry(table.to_string()).or_default().insert(id);
    }

    /// Stores several rows under `table`.
    pub fn set_many(&mut self, table: &str, rows: impl IntoIterator<Item = Arc<Row>>) {
        let ids = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            ids.insert(row.id());
            self.rows.insert(row.id(), row);
        }
    }

    /// Returns the row with `id`.
    #[must_use]
    pub fn get(&self, id: RowId) -> Option<Arc<Row>> {
        self.rows.get(&id).cloned()
    }

    /// Returns the row with `id` if it belongs to `table`.
    #[must_use]
    pub fn get_in(&self, table: &str, id: RowId) -> Option<Arc<Row>> {
        let owned = self.tables.get(table).is_some_and(|ids| ids.contains(&id));
        if owned {
            self.get(id)
        } else {
            None
        }
    }

    /// Returns one entry per requested id, `None` where the row is missing.
    #[must_use]
    pub fn get_many(&self, ids: &[RowId]) -> Vec<Option<Arc<Row>>> {
        ids.iter().map(|id| self.get(*id)).collect()
    }

    /// Removes rows of `table`. Ids that are not cached are ignored.
    pub fn remove(&mut self, table: &str, ids: &[RowId]) {
        if let Some(table_ids) = self.tables.get_mut(table) {
            for id in ids {
                if table_ids.remove(id) {
                    self.rows.remove(id);
                }
            }
        }
    }

    /// Returns the rows of `table` with ids in `[from, to]`, in id order.
    ///
    /// A missing bound is open on that side.
    #[must_use]
    pub fn get_range(&self, table: &str, from: Option<RowId>, to: Option<RowId>) -> Vec<Arc<Row>> {
        let Some(ids) = self.tables.get(table) else {
            return Vec::new();
        };
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Vec::new();
            }
        }
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        let upper = to.map_or(Bound::Unbounded, Bound::Included);
        ids.range((lower, upper))
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }

    /// Returns the ids of `table` in ascending order.
    #[must_use]
    pub fn table_ids(&self, table: &str) -> Vec<RowId> {
        self.tables
            .get(table)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the row count of `table`, or of the whole cache.
    #[must_use]
    pub fn get_count(&self, table: Option<&str>) -> usize {
        match table {
            Some(table) => self.tables.get(table).map_or(0, BTreeSet::len),
            None => self.rows.len(),
        }
    }

    /// Returns the largest cached row id.
    #[must_use]
    pub fn max_row_id(&self) -> Option<RowId> {
        self.tables.values().filter_map(|ids| ids.last().copied()).max()
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.tables.clear();
    }
}
