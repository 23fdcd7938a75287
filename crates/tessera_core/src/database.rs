//! Database facade.

use crate::config::Config;
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexStats;
use crate::journal::TableDiff;
use crate::observer::{ChangeSet, ObserverHandle};
use crate::query::{Query, Relation, SelectQuery};
use crate::row::Row;
use crate::runner::{Runner, Task};
use crate::schema::Schema;
use crate::stats::StatsSnapshot;
use crate::store::BackingStore;
use crate::transaction::Transaction;
use crate::types::{RowId, TaskPriority, TransactionKind};
use crate::value::Payload;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// The main database handle.
///
/// `Database` owns one [`EngineContext`] (cache, indices, schema, store)
/// and the [`Runner`] that schedules every read and write against it.
/// Queries go through [`Database::exec`]; multi-query units of work through
/// [`Database::exec_all`] or an explicit [`Transaction`].
///
/// # Example
///
/// ```rust,ignore
/// use tessera_core::query::{col, InsertQuery, SelectQuery};
/// use tessera_core::store::MemoryStore;
/// use tessera_core::{payload, Config, Database};
///
/// let db = Database::open(schema, Arc::new(MemoryStore::new()), Config::default()).await?;
/// db.exec(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
///     .await?;
/// let open = db
///     .exec(SelectQuery::new().from("Task").filter(col("Task", "done").eq(false)))
///     .await?;
/// ```
pub struct Database {
    ctx: Arc<EngineContext>,
    runner: Arc<Runner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("ctx", &self.ctx)
            .field("runner", &self.runner)
            .finish()
    }
}

impl Database {
    /// Opens a database over `store`.
    ///
    /// Loads the persisted rows, then restores index partitions when the
    /// store and `config` persist them, rebuilding every other index from
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns the store's error, or a codec or constraint error if the
    /// persisted state cannot be loaded.
    pub async fn open(
        schema: Schema,
        store: Arc<dyn BackingStore>,
        config: Config,
    ) -> CoreResult<Self> {
        let schema = Arc::new(schema);
        let state = store.init(&schema).await?;
        let rows = state.row_count();
        let ctx = Arc::new(EngineContext::new(schema, config, store));
        ctx.seed(state)?;
        debug!(rows, tables = ctx.schema().tables().len(), "database opened");
        Ok(Self {
            runner: Runner::new(Arc::clone(&ctx)),
            ctx,
        })
    }

    /// Returns the schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        self.ctx.schema()
    }

    /// Returns the engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Builds a row with a fresh id.
    #[must_use]
    pub fn create_row(&self, payload: Payload) -> Row {
        Row::new(self.ctx.allocate_row_id(), payload)
    }

    /// Runs one query as its own task.
    ///
    /// # Errors
    ///
    /// Returns validation, constraint and scope errors, or the store's
    /// error on commit. Nothing is written on error.
    pub async fn exec(&self, query: impl Into<Query>) -> CoreResult<Relation> {
        let mut results = self.exec_all(vec![query.into()]).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Runs `queries` in order as one task. Either every write commits or
    /// none does.
    ///
    /// # Errors
    ///
    /// Returns the first error; nothing is written in that case.
    pub async fn exec_all(&self, queries: Vec<Query>) -> CoreResult<Vec<Relation>> {
        let plans = queries
            .into_iter()
            .map(|query| self.runner.engine().get_plan(Arc::new(query)))
            .collect::<CoreResult<Vec<_>>>()?;
        let task = Task::new(self.runner.next_task_id(), TaskPriority::User, plans);
        self.runner.schedule(task).await
    }

    /// Renders the optimized plan of `query`.
    ///
    /// # Errors
    ///
    /// Returns validation errors.
    pub fn explain(&self, query: impl Into<Query>) -> CoreResult<String> {
        Ok(self.runner.engine().get_plan(Arc::new(query.into()))?.explain())
    }

    /// Observes `query`. The callback receives every later change of its
    /// result.
    ///
    /// # Errors
    ///
    /// Returns validation errors and errors of the first evaluation.
    pub async fn observe<F>(&self, query: SelectQuery, callback: F) -> CoreResult<ObserverHandle>
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        let plan = self.runner.engine().get_plan(Arc::new(query.into()))?;
        self.runner.observe(plan, Arc::new(callback)).await
    }

    /// Stops observing. Returns false if the handle was unknown.
    pub fn unobserve(&self, handle: ObserverHandle) -> bool {
        self.runner.observers().remove_observer(handle)
    }

    /// Starts an explicit transaction over `tables`.
    ///
    /// Waits until the tables are free; they stay held until the
    /// transaction commits, rolls back or is dropped.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (101) for unknown tables.
    pub async fn begin(&self, tables: &[&str], kind: TransactionKind) -> CoreResult<Transaction> {
        let mut scope = BTreeSet::new();
        for table in tables {
            scope.insert(self.ctx.schema().table(table)?.name().to_string());
        }
        let admission = self.runner.acquire(TaskPriority::User, scope).await?;
        self.ctx.stats().record_task_scheduled();
        Ok(Transaction::new(Arc::clone(&self.runner), admission, kind))
    }

    /// Applies changes that already live in the backing store, such as
    /// writes made by another process, and notifies observers.
    ///
    /// # Errors
    ///
    /// Returns lookup or constraint errors; nothing changes in that case.
    pub async fn apply_external_change(&self, diffs: Vec<TableDiff>) -> CoreResult<()> {
        for diff in &diffs {
            self.ctx.schema().table(diff.name())?;
        }
        self.runner.apply_external(diffs).await
    }

    /// Drops the in-memory state and reloads it from the backing store.
    ///
    /// Runs once every table is free; observers are re-evaluated afterwards.
    ///
    /// # Errors
    ///
    /// Returns the store's error, leaving the previous state in place.
    pub async fn reset(&self) -> CoreResult<()> {
        let tables = self.ctx.schema().table_names();
        let admission = self
            .runner
            .acquire(TaskPriority::User, tables.clone())
            .await?;
        let state = self.ctx.store().init(self.ctx.schema()).await?;
        self.ctx.seed(state)?;
        debug!("database reset");

        let pending = self.runner.queue_observers(&tables);
        drop(admission);
        self.runner.deliver(pending).await;
        Ok(())
    }

    /// Returns committed rows by id, `None` where no row exists.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (101) for unknown tables.
    pub fn get_many(&self, table: &str, ids: &[RowId]) -> CoreResult<Vec<Option<Row>>> {
        self.ctx.schema().table(table)?;
        let cache = self.ctx.cache().read();
        Ok(ids
            .iter()
            .map(|id| cache.get_in(table, *id).map(|row| Row::clone(&row)))
            .collect())
    }

    /// Returns the number of committed rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (101) for unknown tables.
    pub fn get_count(&self, table: &str) -> CoreResult<usize> {
        self.ctx.schema().table(table)?;
        Ok(self.ctx.cache().read().get_count(Some(table)))
    }

    /// Returns the statistics of a committed index.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (102) for unknown indices.
    pub fn index_stats(&self, index: &str) -> CoreResult<IndexStats> {
        self.ctx
            .indices()
            .read()
            .get(index)
            .map(|index| index.stats().clone())
            .ok_or_else(|| CoreError::index_not_found(index))
    }

    /// Returns a snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats().snapshot()
    }

    /// Waits for running work, then closes the database.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) if the database is already closed.
    pub async fn close(self) -> CoreResult<()> {
        self.runner.close().await?;
        debug!("database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DUPLICATE_KEY, INVALID_STATE, OUT_OF_SCOPE};
    use crate::payload;
    use crate::query::{col, DeleteQuery, InsertQuery, UpdateQuery};
    use crate::schema::{ColumnType, TableSchema};
    use crate::store::MemoryStore;
    use crate::transaction::TransactionState;
    use crate::types::Order;
    use crate::value::Value;
    use parking_lot::Mutex;

    fn schema() -> Schema {
        Schema::new(vec![
            TableSchema::new("Task")
                .column("id", ColumnType::Text)
                .column("done", ColumnType::Bool)
                .primary_key(&["id"]),
            TableSchema::new("Tag")
                .column("name", ColumnType::Text)
                .unique_index("uqName", &[("name", Order::Asc)]),
        ])
        .unwrap()
    }

    async fn open(store: Arc<MemoryStore>) -> Database {
        Database::open(schema(), store, Config::default()).await.unwrap()
    }

    #[tokio::test]
    async fn exec_all_is_atomic() {
        let db = open(Arc::new(MemoryStore::new())).await;
        let err = db
            .exec_all(vec![
                InsertQuery::new("Tag").value(payload! { "name" => "a" }).into(),
                InsertQuery::new("Tag").value(payload! { "name" => "a" }).into(),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));
        assert_eq!(db.get_count("Tag").unwrap(), 0);
        assert_eq!(db.stats().tasks_failed, 1);
    }

    #[tokio::test]
    async fn store_failure_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::new());
        let db = open(Arc::clone(&store)).await;
        store.fail_next_commit();
        let result = db
            .exec(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
            .await;
        assert!(result.is_err());
        assert_eq!(db.get_count("Task").unwrap(), 0);
        assert_eq!(db.index_stats("Task.pkTask").unwrap().total_rows, 0);

        db.exec(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
            .await
            .unwrap();
        assert_eq!(store.table("Task").len(), 1);
    }

    #[tokio::test]
    async fn explicit_transaction_lifecycle() {
        let db = open(Arc::new(MemoryStore::new())).await;
        let mut tx = db.begin(&["Task"], TransactionKind::ReadWrite).await.unwrap();
        tx.attach(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
            .unwrap();
        let staged = tx.attach(SelectQuery::new().from("Task")).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(db.get_count("Task").unwrap(), 0);

        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(db.get_count("Task").unwrap(), 1);
        let err = tx.rollback().unwrap_err();
        assert_eq!(err.code(), Some(INVALID_STATE));
    }

    #[tokio::test]
    async fn failed_attach_rolls_back() {
        let db = open(Arc::new(MemoryStore::new())).await;
        let mut tx = db.begin(&["Task"], TransactionKind::ReadWrite).await.unwrap();
        tx.attach(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
            .unwrap();
        let err = tx
            .attach(InsertQuery::new("Tag").value(payload! { "name" => "x" }))
            .unwrap_err();
        assert_eq!(err.code(), Some(OUT_OF_SCOPE));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(tx.commit().await.unwrap_err().code(), Some(INVALID_STATE));

        // The scope was released.
        db.exec(DeleteQuery::new("Task")).await.unwrap();
        assert_eq!(db.get_count("Task").unwrap(), 0);
    }

    #[tokio::test]
    async fn observer_sees_committed_changes_only() {
        let db = open(Arc::new(MemoryStore::new())).await;
        db.exec(
            InsertQuery::new("Task")
                .value(payload! { "id" => "t1", "done" => false })
                .value(payload! { "id" => "t2", "done" => false }),
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::<ChangeSet>::new()));
        let sink = Arc::clone(&seen);
        let handle = db
            .observe(
                SelectQuery::new().from("Task").filter(col("Task", "done").eq(false)),
                move |changes| sink.lock().push(changes.clone()),
            )
            .await
            .unwrap();

        db.exec(
            UpdateQuery::new("Task")
                .set("done", true)
                .filter(col("Task", "id").eq("t1")),
        )
        .await
        .unwrap();
        db.exec(InsertQuery::new("Tag").value(payload! { "name" => "x" }))
            .await
            .unwrap();

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].removed.len(), 1);
            assert_eq!(
                seen[0].removed[0].value(&col("Task", "id")),
                &Value::from("t1")
            );
            assert!(seen[0].added.is_empty() && seen[0].modified.is_empty());
        }

        assert!(db.unobserve(handle));
        db.exec(DeleteQuery::new("Task")).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn reset_reloads_from_store() {
        let store = Arc::new(MemoryStore::new());
        let db = open(Arc::clone(&store)).await;
        db.exec(InsertQuery::new("Task").value(payload! { "id" => "t1", "done" => false }))
            .await
            .unwrap();

        let mut diff = TableDiff::new("Task");
        diff.add(db.create_row(payload! { "id" => "t2", "done" => true }));
        db.apply_external_change(vec![diff]).await.unwrap();
        assert_eq!(db.get_count("Task").unwrap(), 2);
        assert_eq!(store.table("Task").len(), 1);

        db.reset().await.unwrap();
        assert_eq!(db.get_count("Task").unwrap(), 1);
        db.close().await.unwrap();
    }
}
