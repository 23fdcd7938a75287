//! Index trait.

use crate::error::CoreResult;
use crate::index::key::{Comparator, Key, KeyRange};
use crate::index::stats::IndexStats;
use crate::types::RowId;
use std::fmt;

/// Structural kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Identity index over the live row ids of a table.
    RowId,
    /// Sorted index over keys derived from row columns.
    BTree,
}

impl IndexKind {
    /// Returns the tag written to persisted index partitions.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RowId => "ROW_ID",
            Self::BTree => "BTREE",
        }
    }

    /// Parses a persisted tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "ROW_ID" => Some(Self::RowId),
            "BTREE" => Some(Self::BTree),
            _ => None,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered mapping from keys to row ids.
///
/// Indices are only mutated by journal commits and context reseeding.
/// Readers go through the journal, which overlays staged changes.
pub trait Index: Send + Sync + fmt::Debug {
    /// Returns the qualified index name.
    fn name(&self) -> &str;

    /// Returns the structural kind.
    fn kind(&self) -> IndexKind;

    /// Returns whether duplicate keys are rejected.
    fn is_unique(&self) -> bool;

    /// Returns the comparator defining index order.
    fn comparator(&self) -> &Comparator;

    /// Adds an entry.
    ///
    /// # Errors
    ///
    /// Returns a constraint error (201) if the index is unique and `key` is
    /// already mapped to another row. Nothing is inserted in that case.
    fn add(&mut self, key: Key, row_id: RowId) -> CoreResult<()>;

    /// Removes an entry. Missing entries are ignored.
    fn remove(&mut self, key: &Key, row_id: RowId);

    /// Returns the rows mapped to exactly `key`.
    fn get(&self, key: &Key) -> Vec<RowId>;

    /// Returns the rows whose keys fall in any of `ranges`, in index order.
    ///
    /// `reverse` flips the order before `skip` and `limit` are applied.
    fn get_range(
        &self,
        ranges: &[KeyRange],
        reverse: bool,
        limit: Option<usize>,
        skip: usize,
    ) -> Vec<RowId>;

    /// Returns the number of entries a scan of `ranges` would visit.
    fn cost(&self, ranges: &[KeyRange]) -> usize;

    /// Returns the index statistics.
    fn stats(&self) -> &IndexStats;

    /// Removes every entry.
    fn clear(&mut self);

    /// Returns every entry in index order.
    fn entries(&self) -> Vec<(Key, RowId)>;

    /// Clones the index behind a box.
    fn clone_box(&self) -> Box<dyn Index>;
}

impl Clone for Box<dyn Index> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Applies `skip` and `limit` to ids in index order, reversing first.
pub(crate) fn page(
    mut ids: Vec<RowId>,
    reverse: bool,
    limit: Option<usize>,
    skip: usize,
) -> Vec<RowId> {
    if reverse {
        ids.reverse();
    }
    ids.into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
