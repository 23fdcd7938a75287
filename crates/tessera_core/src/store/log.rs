//! Append-based backing store.
//!
//! Each commit is one CBOR-encoded [`CommitRecord`] inside a checksummed
//! frame. Opening the store replays every intact frame in order; a torn
//! final frame, left behind by a crash mid-append, is cut off.

use super::{
    check_batch_scope, check_table_scope, BackingStore, CommitBatch, PersistedState, StoreFuture,
    StoreState, StoreTransaction,
};
use crate::error::{CoreError, CoreResult};
use crate::row::Row;
use crate::schema::Schema;
use crate::types::TransactionKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tessera_storage::{FileBackend, FrameLog, StorageBackend};
use tracing::{debug, trace};

/// One framed entry of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Position of the commit in the log, starting at 1.
    pub sequence: u64,
    /// The committed changes.
    pub batch: CommitBatch,
}

impl CommitRecord {
    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

#[derive(Debug)]
struct Inner {
    log: FrameLog,
    state: StoreState,
    sequence: u64,
}

/// A backing store that appends commit records to a byte log.
#[derive(Debug, Clone)]
pub struct LogStore {
    inner: Arc<Mutex<Inner>>,
    persist_indices: bool,
}

impl LogStore {
    /// Creates a store over `backend`. The log is read on [`BackingStore::init`].
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                log: FrameLog::new(backend),
                state: StoreState::default(),
                sequence: 0,
            })),
            persist_indices: false,
        }
    }

    /// Opens a store over the file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Ok(Self::new(Box::new(backend)))
    }

    /// Makes the store keep index partitions.
    #[must_use]
    pub fn with_index_persistence(mut self) -> Self {
        self.persist_indices = true;
        self
    }

    /// Returns the size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().log.size()?)
    }

    /// Returns the number of commits written or replayed.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    fn replay(&self, schema: &Schema) -> CoreResult<PersistedState> {
        let mut inner = self.inner.lock();
        let frames = inner.log.recover()?;

        let mut state = StoreState::default();
        let mut sequence = 0;
        for frame in &frames {
            let record = CommitRecord::decode(frame)?;
            if record.sequence != sequence + 1 {
                return Err(CoreError::codec(format!(
                    "commit record {} follows {sequence}",
                    record.sequence
                )));
            }
            sequence = record.sequence;
            state.apply(record.batch);
        }
        debug!(records = frames.len(), "log store replayed");

        let persisted = state.snapshot(schema, self.persist_indices);
        inner.state = state;
        inner.sequence = sequence;
        Ok(persisted)
    }
}

impl BackingStore for LogStore {
    fn init<'a>(&'a self, schema: &'a Schema) -> StoreFuture<'a, PersistedState> {
        Box::pin(async move { self.replay(schema) })
    }

    fn begin(&self, kind: TransactionKind, scope: &BTreeSet<String>) -> Box<dyn StoreTransaction> {
        Box::new(LogTransaction {
            inner: self.inner.clone(),
            kind,
            scope: scope.clone(),
        })
    }

    fn persists_indices(&self) -> bool {
        self.persist_indices
    }
}

struct LogTransaction {
    inner: Arc<Mutex<Inner>>,
    kind: TransactionKind,
    scope: BTreeSet<String>,
}

impl StoreTransaction for LogTransaction {
    fn get_table(&self, name: &str) -> CoreResult<Vec<Row>> {
        check_table_scope(&self.scope, name)?;
        Ok(self.inner.lock().state.table(name))
    }

    fn commit(self: Box<Self>, batch: CommitBatch) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            if batch.is_empty() {
                return Ok(());
            }
            if self.kind == TransactionKind::ReadOnly {
                return Err(CoreError::read_only("log store"));
            }
            check_batch_scope(&self.scope, &batch)?;

            let mut inner = self.inner.lock();
            let record = CommitRecord {
                sequence: inner.sequence + 1,
                batch,
            };
            inner.log.append(&record.encode()?)?;
            trace!(sequence = record.sequence, "commit record appended");
            inner.sequence = record.sequence;
            inner.state.apply(record.batch);
            Ok(())
        })
    }

    fn abort(self: Box<Self>) {}
}
