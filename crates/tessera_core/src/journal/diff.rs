//! Per-table change sets.

use crate::row::Row;
use crate::types::RowId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rows added, modified and deleted in one table.
///
/// Recording a change merges it with what is already recorded for the same
/// row, so a diff always describes the net effect:
/// - add then delete cancels out
/// - delete then add becomes a modification
/// - modify after add stays an add with the newer row
/// - modify after modify keeps the original before-image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    name: String,
    added: BTreeMap<RowId, Row>,
    modified: BTreeMap<RowId, (Row, Row)>,
    deleted: BTreeMap<RowId, Row>,
}

impl TableDiff {
    /// Creates an empty diff for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            added: BTreeMap::new(),
            modified: BTreeMap::new(),
            deleted: BTreeMap::new(),
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records an inserted row.
    pub fn add(&mut self, row: Row) {
        let id = row.id();
        match self.deleted.remove(&id) {
            Some(before) => {
                self.modified.insert(id, (before, row));
            }
            None => {
                self.added.insert(id, row);
            }
        }
    }

    /// Records a row replaced by `after`.
    pub fn modify(&mut self, before: Row, after: Row) {
        let id = after.id();
        if self.added.contains_key(&id) {
            self.added.insert(id, after);
        } else if let Some(entry) = self.modified.get_mut(&id) {
            entry.1 = after;
        } else {
            self.modified.insert(id, (before, after));
        }
    }

    /// Records a deleted row.
    pub fn delete(&mut self, row: Row) {
        let id = row.id();
        if self.added.remove(&id).is_some() {
            return;
        }
        match self.modified.remove(&id) {
            Some((before, _)) => {
                self.deleted.insert(id, before);
            }
            None => {
                self.deleted.insert(id, row);
            }
        }
    }

    /// Merges every change of `other` into this diff.
    pub fn merge(&mut self, other: TableDiff) {
        for (_, row) in other.added {
            self.add(row);
        }
        for (_, (before, after)) in other.modified {
            self.modify(before, after);
        }
        for (_, row) in other.deleted {
            self.delete(row);
        }
    }

    /// Returns the added rows by id.
    #[must_use]
    pub fn added(&self) -> &BTreeMap<RowId, Row> {
        &self.added
    }

    /// Returns the modified rows by id, as (before, after).
    #[must_use]
    pub fn modified(&self) -> &BTreeMap<RowId, (Row, Row)> {
        &self.modified
    }

    /// Returns the deleted rows by id, with their last committed content.
    #[must_use]
    pub fn deleted(&self) -> &BTreeMap<RowId, Row> {
        &self.deleted
    }

    /// Returns the staged version of `id`: `Some(Some(row))` if added or
    /// modified, `Some(None)` if deleted, `None` if untouched.
    #[must_use]
    pub fn staged(&self, id: RowId) -> Option<Option<&Row>> {
        if let Some(row) = self.added.get(&id) {
            return Some(Some(row));
        }
        if let Some((_, after)) = self.modified.get(&id) {
            return Some(Some(after));
        }
        if self.deleted.contains_key(&id) {
            return Some(None);
        }
        None
    }

    /// Returns every row the diff makes live: added rows and the new side
    /// of modifications.
    pub fn live_rows(&self) -> impl Iterator<Item = &Row> {
        self.added
            .values()
            .chain(self.modified.values().map(|(_, after)| after))
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Returns the total number of recorded changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    fn row(id: u64, name: &str) -> Row {
        Row::new(RowId(id), payload! { "name" => name })
    }

    #[test]
    fn add_then_delete_cancels() {
        let mut diff = TableDiff::new("T");
        diff.add(row(1, "a"));
        diff.delete(row(1, "a"));
        assert!(diff.is_empty());
    }

    #[test]
    fn delete_then_add_becomes_modify() {
        let mut diff = TableDiff::new("T");
        diff.delete(row(1, "old"));
        diff.add(row(1, "new"));

        assert_eq!(diff.len(), 1);
        let (before, after) = &diff.modified()[&RowId(1)];
        assert_eq!(before.get("name").as_str(), Some("old"));
        assert_eq!(after.get("name").as_str(), Some("new"));
    }

    #[test]
    fn modify_keeps_original_before_image() {
        let mut diff = TableDiff::new("T");
        diff.modify(row(1, "v1"), row(1, "v2"));
        diff.modify(row(1, "v2"), row(1, "v3"));

        let (before, after) = &diff.modified()[&RowId(1)];
        assert_eq!(before.get("name").as_str(), Some("v1"));
        assert_eq!(after.get("name").as_str(), Some("v3"));
    }

    #[test]
    fn modify_after_add_stays_added() {
        let mut diff = TableDiff::new("T");
        diff.add(row(1, "v1"));
        diff.modify(row(1, "v1"), row(1, "v2"));

        assert!(diff.modified().is_empty());
        assert_eq!(diff.added()[&RowId(1)].get("name").as_str(), Some("v2"));
    }

    #[test]
    fn delete_after_modify_records_original() {
        let mut diff = TableDiff::new("T");
        diff.modify(row(1, "v1"), row(1, "v2"));
        diff.delete(row(1, "v2"));

        assert!(diff.modified().is_empty());
        assert_eq!(diff.deleted()[&RowId(1)].get("name").as_str(), Some("v1"));
        assert_eq!(diff.staged(RowId(1)), Some(None));
        assert_eq!(diff.staged(RowId(2)), None);
    }

    #[test]
    fn merge_applies_in_order() {
        let mut base = TableDiff::new("T");
        base.add(row(1, "a"));
        let mut next = TableDiff::new("T");
        next.delete(row(1, "a"));
        next.add(row(2, "b"));

        base.merge(next);
        assert_eq!(base.added().keys().copied().collect::<Vec<_>>(), vec![RowId(2)]);
        assert!(base.deleted().is_empty());
    }
}
