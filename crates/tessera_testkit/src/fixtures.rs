//! Test fixtures and database helpers.
//!
//! Provides ready-made schemas and databases over each bundled backing
//! store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tessera_core::store::{LogStore, MemoryStore};
use tessera_core::query::Relation;
use tessera_core::{
    ColumnType, Config, Database, ForeignKeyAction, Order, RowId, Schema, TableSchema,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test subscriber filtered by `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// `Foo(id)` with a text primary key.
pub fn foo_schema() -> Schema {
    Schema::new(vec![TableSchema::new("Foo")
        .column("id", ColumnType::Text)
        .primary_key(&["id"])])
    .expect("valid schema")
}

/// `Item(id, price)` with a unique index on `id`.
pub fn item_schema() -> Schema {
    Schema::new(vec![TableSchema::new("Item")
        .column("id", ColumnType::Text)
        .nullable_column("price", ColumnType::Number)
        .primary_key(&["id"])
        .index("idxPrice", &[("price", Order::Asc)])])
    .expect("valid schema")
}

/// Projects, their tasks and notes on tasks.
///
/// - `Project(id, name)` with an auto-increment key
/// - `Task(id, project, title, done, rank)`, cascading from `Project`
/// - `Note(id, task, body)`, restricting deletes of `Task`
/// - `Label(name)`, unrelated to the others
pub fn todo_schema() -> Schema {
    Schema::new(vec![
        TableSchema::new("Project")
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::Text)
            .auto_increment_key("id"),
        TableSchema::new("Task")
            .column("id", ColumnType::Text)
            .column("project", ColumnType::Integer)
            .column("title", ColumnType::Text)
            .column("done", ColumnType::Bool)
            .nullable_column("rank", ColumnType::Integer)
            .primary_key(&["id"])
            .index("idxRank", &[("rank", Order::Desc)])
            .index("idxDone", &[("done", Order::Asc)])
            .foreign_key(
                "fkProject",
                "project",
                "Project",
                "id",
                ForeignKeyAction::Cascade,
            ),
        TableSchema::new("Note")
            .column("id", ColumnType::Text)
            .column("task", ColumnType::Text)
            .column("body", ColumnType::Text)
            .primary_key(&["id"])
            .foreign_key("fkTask", "task", "Task", "id", ForeignKeyAction::Restrict),
        TableSchema::new("Label")
            .column("name", ColumnType::Text)
            .unique_index("uqName", &[("name", Order::Asc)]),
    ])
    .expect("valid schema")
}

enum TestStore {
    Memory(MemoryStore),
    Log(PathBuf),
}

/// A test database that can be closed and reopened over the same store.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    schema: Schema,
    config: Config,
    store: TestStore,
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Opens a database over a fresh [`MemoryStore`].
    pub async fn memory(schema: Schema) -> Self {
        Self::memory_with(schema, Config::default(), MemoryStore::new()).await
    }

    /// Opens a database over `store`.
    pub async fn memory_with(schema: Schema, config: Config, store: MemoryStore) -> Self {
        init_tracing();
        let db = Database::open(schema.clone(), Arc::new(store.clone()), config.clone())
            .await
            .expect("open memory database");
        Self {
            db,
            schema,
            config,
            store: TestStore::Memory(store),
            _temp_dir: None,
        }
    }

    /// Opens a database over a [`LogStore`] in a temporary directory.
    pub async fn log_file(schema: Schema, config: Config) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("create temp directory");
        let path = temp_dir.path().join("tessera.log");
        let db = Self::open_log(&schema, &config, &path).await;
        Self {
            db,
            schema,
            config,
            store: TestStore::Log(path),
            _temp_dir: Some(temp_dir),
        }
    }

    async fn open_log(schema: &Schema, config: &Config, path: &Path) -> Database {
        let mut store = LogStore::open(path).expect("open log store");
        if config.persist_indices {
            store = store.with_index_persistence();
        }
        Database::open(schema.clone(), Arc::new(store), config.clone())
            .await
            .expect("open log database")
    }

    /// Returns the memory store, if the database uses one.
    pub fn memory_store(&self) -> Option<&MemoryStore> {
        match &self.store {
            TestStore::Memory(store) => Some(store),
            TestStore::Log(_) => None,
        }
    }

    /// Returns the log path, if the database uses a log store.
    pub fn log_path(&self) -> Option<&Path> {
        match &self.store {
            TestStore::Log(path) => Some(path),
            TestStore::Memory(_) => None,
        }
    }

    /// Closes the database and opens a new one over the same store.
    pub async fn reopen(self) -> Self {
        let Self {
            db,
            schema,
            config,
            store,
            _temp_dir,
        } = self;
        db.close().await.expect("close database");

        let db = match &store {
            TestStore::Memory(memory) => {
                Database::open(schema.clone(), Arc::new(memory.clone()), config.clone())
                    .await
                    .expect("reopen memory database")
            }
            TestStore::Log(path) => Self::open_log(&schema, &config, path).await,
        };
        Self {
            db,
            schema,
            config,
            store,
            _temp_dir,
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Returns the row ids of `table` in result order.
pub fn row_ids(relation: &Relation, table: &str) -> Vec<RowId> {
    relation.rows(table).iter().map(|row| row.id()).collect()
}
