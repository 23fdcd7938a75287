//! Per-database engine state.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::CoreResult;
use crate::index::{deserialize_index, Index, IndexStore, Key};
use crate::schema::Schema;
use crate::stats::EngineStats;
use crate::store::{BackingStore, PersistedState};
use crate::types::RowId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Everything one database instance owns.
///
/// There is no process-wide registry: each [`Database`](crate::Database)
/// builds one context and hands it to the journal, query engine, runner and
/// observers. Locks are always taken cache first, then indices.
pub struct EngineContext {
    schema: Arc<Schema>,
    config: Config,
    store: Arc<dyn BackingStore>,
    cache: RwLock<Cache>,
    indices: RwLock<IndexStore>,
    next_row_id: AtomicU64,
    stats: EngineStats,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("tables", &self.schema.tables().len())
            .field("config", &self.config)
            .field("next_row_id", &self.next_row_id)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Creates an empty context. Call [`EngineContext::seed`] before use.
    #[must_use]
    pub fn new(schema: Arc<Schema>, config: Config, store: Arc<dyn BackingStore>) -> Self {
        let indices = IndexStore::init(&schema);
        Self {
            schema,
            config,
            store,
            cache: RwLock::new(Cache::new()),
            indices: RwLock::new(indices),
            next_row_id: AtomicU64::new(1),
            stats: EngineStats::new(),
        }
    }

    /// Returns the schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Returns the engine counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub(crate) fn cache(&self) -> &RwLock<Cache> {
        &self.cache
    }

    pub(crate) fn indices(&self) -> &RwLock<IndexStore> {
        &self.indices
    }

    /// Hands out a fresh row id.
    pub fn allocate_row_id(&self) -> RowId {
        RowId(self.next_row_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Makes sure future allocations stay above `id`.
    pub(crate) fn observe_row_id(&self, id: RowId) {
        self.next_row_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }

    /// Returns true if index partitions are read from and written to the
    /// backing store.
    #[must_use]
    pub fn persists_indices(&self) -> bool {
        self.config.persist_indices && self.store.persists_indices()
    }

    /// Replaces the cache and every index with `state`.
    ///
    /// Index partitions found in `state` are deserialized when index
    /// persistence is enabled; every other index is rebuilt from rows.
    ///
    /// # Errors
    ///
    /// Returns a codec error for unreadable partitions and a constraint
    /// error if persisted rows violate a unique index.
    pub fn seed(&self, state: PersistedState) -> CoreResult<()> {
        let mut cache = Cache::new();
        let mut indices = IndexStore::init(&self.schema);
        let load_partitions = self.persists_indices();
        let mut loaded = 0usize;

        for table in self.schema.tables() {
            let rows = state.rows(table.name());
            cache.set_many(table.name(), rows.iter().cloned().map(Arc::new));

            let row_id_name = table.row_id_index_name();
            let specs: Vec<_> = table.all_indices().collect();
            let mut names: Vec<&str> = vec![row_id_name.as_str()];
            names.extend(specs.iter().map(|spec| spec.name()));

            for name in names {
                let partition = state.indices.get(name).filter(|_| load_partitions);
                let Some(template) = indices.get_mut(name) else {
                    continue;
                };
                if let Some(partition) = partition {
                    let restored: Box<dyn Index> = deserialize_index(&**template, partition)?;
                    *template = restored;
                    loaded += 1;
                    continue;
                }

                let spec = specs.iter().find(|spec| spec.name() == name);
                for row in rows {
                    let key = match spec {
                        Some(spec) => Key::from_row(spec.columns(), row),
                        None => Key::row_id(row.id()),
                    };
                    template.add(key, row.id())?;
                }
            }
        }

        if let Some(max) = cache.max_row_id() {
            self.observe_row_id(max);
        }
        debug!(
            rows = cache.get_count(None),
            partitions = loaded,
            "engine context seeded"
        );

        let mut cache_guard = self.cache.write();
        let mut index_guard = self.indices.write();
        *cache_guard = cache;
        *index_guard = indices;
        Ok(())
    }
}
