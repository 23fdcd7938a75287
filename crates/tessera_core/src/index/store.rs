//! Registry of every index in a database.

use crate::index::btree::BTreeIndex;
use crate::index::key::Comparator;
use crate::index::row_id::RowIdIndex;
use crate::index::traits::Index;
use crate::schema::Schema;
use std::collections::{BTreeMap, HashMap};

/// All indices of a database, by qualified name.
#[derive(Debug, Default, Clone)]
pub struct IndexStore {
    indices: HashMap<String, Box<dyn Index>>,
    tables: BTreeMap<String, Vec<String>>,
}

impl IndexStore {
    /// Creates one empty index per declared index of every table, plus the
    /// implicit row-id index `Table.#`.
    #[must_use]
    pub fn init(schema: &Schema) -> Self {
        let mut store = Self::default();
        for table in schema.tables() {
            store.set(
                table.name(),
                Box::new(RowIdIndex::new(table.row_id_index_name())),
            );
            for spec in table.all_indices() {
                let comparator = Comparator::for_columns(spec.orders(), spec.is_nullable());
                store.set(
                    table.name(),
                    Box::new(BTreeIndex::new(spec.name(), comparator, spec.is_unique())),
                );
            }
        }
        store
    }

    /// Returns the index called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Index> {
        self.indices.get(name).map(|index| &**index)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Index>> {
        self.indices.get_mut(name)
    }

    /// Returns the indices of `table`, row-id index first.
    #[must_use]
    pub fn get_table_indices(&self, table: &str) -> Vec<&dyn Index> {
        self.tables
            .get(table)
            .map(|names| names.iter().filter_map(|name| self.get(name)).collect())
            .unwrap_or_default()
    }

    /// Returns the table owning the index called `name`.
    #[must_use]
    pub fn table_of(&self, name: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == name))
            .map(|(table, _)| table.as_str())
    }

    /// Registers `index` under `table`, replacing any index with the same
    /// name.
    pub fn set(&mut self, table: &str, index: Box<dyn Index>) {
        let name = index.name().to_string();
        let names = self.tables.entry(table.to_string()).or_default();
        if !names.contains(&name) {
            names.push(name.clone());
        }
        self.indices.insert(name, index);
    }

    /// Returns the names of every registered index.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(String::as_str)
    }

    /// Empties every index.
    pub fn clear(&mut self) {
        for index in self.indices.values_mut() {
            index.clear();
        }
    }
}
