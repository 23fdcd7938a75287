//! Backing store contract.
//!
//! The engine keeps every committed row in memory; a backing store is where
//! those rows are persisted. On open the database loads a [`PersistedState`]
//! through [`BackingStore::init`], and every read-write commit hands a
//! [`CommitBatch`] to a [`StoreTransaction`] before touching the cache.
//!
//! Two adapters ship with the engine:
//! - [`MemoryStore`], shared in-memory tables with commit failure injection
//! - [`LogStore`], CBOR commit records framed over a `tessera_storage` backend

mod log;
mod memory;

pub use log::{CommitRecord, LogStore};
pub use memory::MemoryStore;

use crate::error::{CoreError, CoreResult};
use crate::journal::TableDiff;
use crate::row::Row;
use crate::schema::Schema;
use crate::types::{RowId, TransactionKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by backing store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = CoreResult<T>> + Send + 'a>>;

/// Everything a store holds when a database is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Rows per table, in row id order.
    pub tables: BTreeMap<String, Vec<Row>>,
    /// Index partitions by qualified index name. Empty unless the store
    /// persists indices.
    pub indices: BTreeMap<String, Vec<Row>>,
}

impl PersistedState {
    /// Returns the rows of `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    /// Returns the total number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// The changes of one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Net row changes per table.
    pub diffs: Vec<TableDiff>,
    /// Rewritten index partitions. Only filled for stores that persist
    /// indices.
    pub indices: BTreeMap<String, Vec<Row>>,
}

impl CommitBatch {
    /// Returns true if the batch carries nothing to persist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diffs.iter().all(TableDiff::is_empty) && self.indices.is_empty()
    }
}

/// A persistent home for committed rows.
pub trait BackingStore: Send + Sync {
    /// Loads the persisted state for `schema`.
    ///
    /// Tables the store has never seen are returned empty.
    fn init<'a>(&'a self, schema: &'a Schema) -> StoreFuture<'a, PersistedState>;

    /// Starts a store transaction over `scope`.
    fn begin(&self, kind: TransactionKind, scope: &BTreeSet<String>) -> Box<dyn StoreTransaction>;

    /// Returns true if the store keeps index partitions.
    fn persists_indices(&self) -> bool {
        false
    }
}

/// One transaction against a backing store.
pub trait StoreTransaction: Send {
    /// Returns the persisted rows of `table`.
    ///
    /// # Errors
    ///
    /// Returns a scope error if `table` is outside the transaction scope.
    fn get_table(&self, name: &str) -> CoreResult<Vec<Row>>;

    /// Persists `batch`. Resolves once the changes are durable.
    fn commit(self: Box<Self>, batch: CommitBatch) -> StoreFuture<'static, ()>;

    /// Abandons the transaction.
    fn abort(self: Box<Self>);
}

/// Materialized store contents shared by the reference adapters.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    tables: BTreeMap<String, BTreeMap<RowId, Row>>,
    indices: BTreeMap<String, Vec<Row>>,
}

impl StoreState {
    pub(crate) fn apply(&mut self, batch: CommitBatch) {
        for diff in batch.diffs {
            let table = self.tables.entry(diff.name().to_string()).or_default();
            for id in diff.deleted().keys() {
                table.remove(id);
            }
            for (id, row) in diff.added() {
                table.insert(*id, row.clone());
            }
            for (id, (_, after)) in diff.modified() {
                table.insert(*id, after.clone());
            }
        }
        self.indices.extend(batch.indices);
    }

    pub(crate) fn table(&self, name: &str) -> Vec<Row> {
        self.tables
            .get(name)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn snapshot(&self, schema: &Schema, with_indices: bool) -> PersistedState {
        let tables = schema
            .tables()
            .iter()
            .map(|t| (t.name().to_string(), self.table(t.name())))
            .collect();
        let indices = if with_indices {
            self.indices.clone()
        } else {
            BTreeMap::new()
        };
        PersistedState { tables, indices }
    }
}

/// Fails if `batch` touches a table outside `scope`.
pub(crate) fn check_batch_scope(scope: &BTreeSet<String>, batch: &CommitBatch) -> CoreResult<()> {
    match batch.diffs.iter().find(|d| !scope.contains(d.name())) {
        Some(diff) => Err(CoreError::out_of_scope(diff.name())),
        None => Ok(()),
    }
}

pub(crate) fn check_table_scope(scope: &BTreeSet<String>, table: &str) -> CoreResult<()> {
    if scope.contains(table) {
        Ok(())
    } else {
        Err(CoreError::out_of_scope(table))
    }
}
