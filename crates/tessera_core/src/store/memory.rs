//! In-memory backing store.

use super::{
    check_batch_scope, check_table_scope, BackingStore, CommitBatch, PersistedState, StoreFuture,
    StoreState, StoreTransaction,
};
use crate::error::{CoreError, CoreResult};
use crate::row::Row;
use crate::schema::Schema;
use crate::types::TransactionKind;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_storage::StorageError;
use tracing::debug;

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<StoreState>,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
}

/// A backing store that keeps tables in memory.
///
/// Clones share the same tables, so a store can outlive one database and
/// be reopened by another.
///
/// # Example
///
/// ```rust
/// use tessera_core::store::{BackingStore, MemoryStore};
///
/// let store = MemoryStore::new().with_index_persistence();
/// assert!(store.persists_indices());
/// assert_eq!(store.commit_count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    persist_indices: bool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the store keep index partitions.
    #[must_use]
    pub fn with_index_persistence(mut self) -> Self {
        self.persist_indices = true;
        self
    }

    /// Makes the next commit fail with an I/O error.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Returns the number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Returns the stored rows of `table`.
    #[must_use]
    pub fn table(&self, name: &str) -> Vec<Row> {
        self.shared.state.lock().table(name)
    }
}

impl BackingStore for MemoryStore {
    fn init<'a>(&'a self, schema: &'a Schema) -> StoreFuture<'a, PersistedState> {
        Box::pin(async move {
            let state = self.shared.state.lock().snapshot(schema, self.persist_indices);
            debug!(rows = state.row_count(), "memory store loaded");
            Ok(state)
        })
    }

    fn begin(&self, kind: TransactionKind, scope: &BTreeSet<String>) -> Box<dyn StoreTransaction> {
        Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            kind,
            scope: scope.clone(),
        })
    }

    fn persists_indices(&self) -> bool {
        self.persist_indices
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    kind: TransactionKind,
    scope: BTreeSet<String>,
}

impl StoreTransaction for MemoryTransaction {
    fn get_table(&self, name: &str) -> CoreResult<Vec<Row>> {
        check_table_scope(&self.scope, name)?;
        Ok(self.shared.state.lock().table(name))
    }

    fn commit(self: Box<Self>, batch: CommitBatch) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            if self.kind == TransactionKind::ReadOnly && !batch.is_empty() {
                return Err(CoreError::read_only("memory store"));
            }
            check_batch_scope(&self.scope, &batch)?;
            if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Storage(StorageError::Io(io::Error::other(
                    "injected commit failure",
                ))));
            }
            self.shared.state.lock().apply(batch);
            self.shared.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn abort(self: Box<Self>) {}
}
