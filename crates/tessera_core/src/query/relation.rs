//! Intermediate results passed between execution steps.

use crate::query::predicate::ColumnRef;
use crate::row::Row;
use crate::types::RowId;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

static NULL: Value = Value::Null;

/// One entry of a [`Relation`].
///
/// Maps each table the relation covers to a row, or to `None` for the
/// unmatched side of an outer join. Aggregation steps attach derived values
/// keyed by their label, e.g. `COUNT(Task.id)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationEntry {
    rows: BTreeMap<String, Option<Arc<Row>>>,
    derived: BTreeMap<String, Value>,
}

impl RelationEntry {
    /// Creates an entry over a single row.
    #[must_use]
    pub fn from_row(table: impl Into<String>, row: Arc<Row>) -> Self {
        let mut rows = BTreeMap::new();
        rows.insert(table.into(), Some(row));
        Self {
            rows,
            derived: BTreeMap::new(),
        }
    }

    /// Joins two entries into one.
    #[must_use]
    pub fn combine(&self, other: &RelationEntry) -> Self {
        let mut combined = self.clone();
        combined
            .rows
            .extend(other.rows.iter().map(|(t, r)| (t.clone(), r.clone())));
        combined
            .derived
            .extend(other.derived.iter().map(|(k, v)| (k.clone(), v.clone())));
        combined
    }

    /// Extends this entry with absent rows for `tables`.
    #[must_use]
    pub fn with_null_side(&self, tables: &BTreeSet<String>) -> Self {
        let mut combined = self.clone();
        for table in tables {
            combined.rows.entry(table.clone()).or_insert(None);
        }
        combined
    }

    /// Returns the row of `table`, if present.
    #[must_use]
    pub fn row(&self, table: &str) -> Option<&Arc<Row>> {
        self.rows.get(table).and_then(Option::as_ref)
    }

    /// Returns every table slot of the entry.
    #[must_use]
    pub fn rows(&self) -> &BTreeMap<String, Option<Arc<Row>>> {
        &self.rows
    }

    /// Returns the value of `column`, `Null` if its row is absent.
    #[must_use]
    pub fn value(&self, column: &ColumnRef) -> &Value {
        self.row(&column.table)
            .map_or(&NULL, |row| row.get(&column.name))
    }

    /// Returns a derived value by label.
    #[must_use]
    pub fn derived(&self, label: &str) -> Option<&Value> {
        self.derived.get(label)
    }

    /// Returns every derived value.
    #[must_use]
    pub fn derived_values(&self) -> &BTreeMap<String, Value> {
        &self.derived
    }

    /// Attaches a derived value.
    pub fn set_derived(&mut self, label: impl Into<String>, value: Value) {
        self.derived.insert(label.into(), value);
    }

    pub(crate) fn set_rows(&mut self, rows: BTreeMap<String, Option<Arc<Row>>>) {
        self.rows = rows;
    }

    /// Returns the row ids of the entry in table order.
    #[must_use]
    pub fn identity(&self) -> Vec<(String, Option<RowId>)> {
        self.rows
            .iter()
            .map(|(table, row)| (table.clone(), row.as_ref().map(|r| r.id())))
            .collect()
    }
}

/// An ordered list of entries and the tables they cover.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    entries: Vec<RelationEntry>,
    tables: BTreeSet<String>,
}

impl Relation {
    /// Creates a relation.
    #[must_use]
    pub fn new(entries: Vec<RelationEntry>, tables: BTreeSet<String>) -> Self {
        Self { entries, tables }
    }

    /// Creates an empty relation over `tables`.
    #[must_use]
    pub fn empty(tables: BTreeSet<String>) -> Self {
        Self::new(Vec::new(), tables)
    }

    /// Wraps rows of a single table.
    #[must_use]
    pub fn from_rows(table: &str, rows: Vec<Arc<Row>>) -> Self {
        let entries = rows
            .into_iter()
            .map(|row| RelationEntry::from_row(table, row))
            .collect();
        Self::new(entries, BTreeSet::from([table.to_string()]))
    }

    /// Returns the entries.
    #[must_use]
    pub fn entries(&self) -> &[RelationEntry] {
        &self.entries
    }

    /// Consumes the relation into its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<RelationEntry> {
        self.entries
    }

    /// Returns the covered tables.
    #[must_use]
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the present rows of `table`, in entry order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Arc<Row>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.row(table).cloned())
            .collect()
    }

    /// Returns the values of `column`, in entry order.
    #[must_use]
    pub fn values(&self, column: &ColumnRef) -> Vec<Value> {
        self.entries
            .iter()
            .map(|entry| entry.value(column).clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use crate::query::predicate::col;

    fn row(id: u64, name: &str) -> Arc<Row> {
        Arc::new(Row::new(RowId(id), payload! { "name" => name }))
    }

    #[test]
    fn combine_and_null_side() {
        let left = RelationEntry::from_row("A", row(1, "a"));
        let right = RelationEntry::from_row("B", row(2, "b"));
        let both = left.combine(&right);
        assert_eq!(both.value(&col("B", "name")), &Value::from("b"));

        let outer = left.with_null_side(&BTreeSet::from(["B".to_string()]));
        assert!(outer.row("B").is_none());
        assert!(outer.value(&col("B", "name")).is_null());
        assert_eq!(
            outer.identity(),
            vec![("A".to_string(), Some(RowId(1))), ("B".to_string(), None)]
        );
    }

    #[test]
    fn relation_accessors() {
        let relation = Relation::from_rows("A", vec![row(1, "x"), row(2, "y")]);
        assert_eq!(relation.len(), 2);
        assert_eq!(relation.tables().len(), 1);
        assert_eq!(
            relation.values(&col("A", "name")),
            vec![Value::from("x"), Value::from("y")]
        );
        assert_eq!(relation.rows("A")[1].id(), RowId(2));
        assert!(relation.rows("B").is_empty());
    }
}
