//! End-to-end scenarios against full databases.

use std::sync::Arc;

use parking_lot::Mutex;
use tessera_core::query::{col, AggregateFn, DeleteQuery, InsertQuery, SelectQuery, UpdateQuery};
use tessera_core::store::{BackingStore, LogStore, MemoryStore};
use tessera_core::{
    payload, ChangeSet, Config, Database, Order, Row, RowId, TransactionKind, Value,
    DUPLICATE_KEY, FK_PARENT_MISSING, FK_RESTRICT, OUT_OF_SCOPE,
};
use tessera_storage::{InMemoryBackend, StorageBackend};
use tessera_testkit::prelude::*;

async fn seed_foo(db: &TestDatabase, count: usize) {
    let payloads = (0..count).map(|n| payload! { "id" => format!("foo-{n}") });
    db.exec(InsertQuery::new("Foo").payloads(payloads))
        .await
        .expect("seed Foo");
}

#[tokio::test]
async fn remove_then_get_many_reports_missing_rows() {
    let db = TestDatabase::memory(foo_schema()).await;
    seed_foo(&db, 5).await;
    assert_eq!(db.get_count("Foo").unwrap(), 5);

    let all = db.exec(SelectQuery::new().from("Foo")).await.unwrap();
    let ids = row_ids(&all, "Foo");
    assert_eq!(ids.len(), 5);

    db.exec(DeleteQuery::new("Foo").filter(col("Foo", "id").in_list(["foo-1", "foo-3"])))
        .await
        .unwrap();
    assert_eq!(db.get_count("Foo").unwrap(), 3);

    let fetched = db.get_many("Foo", &ids).unwrap();
    let present: Vec<bool> = fetched.iter().map(Option::is_some).collect();
    assert_eq!(present, vec![true, false, true, false, true]);
    assert!(db.get_many("Foo", &[RowId(9_999)]).unwrap()[0].is_none());
}

#[tokio::test]
async fn upsert_replaces_in_place() {
    let db = TestDatabase::memory(item_schema()).await;
    db.exec(InsertQuery::new("Item").value(payload! { "id" => "a", "price" => 1.5 }))
        .await
        .unwrap();
    let before = db.exec(SelectQuery::new().from("Item")).await.unwrap();

    db.exec(
        InsertQuery::new("Item")
            .or_replace()
            .value(payload! { "id" => "a", "price" => 2.5 }),
    )
    .await
    .unwrap();

    assert_eq!(db.get_count("Item").unwrap(), 1);
    let after = db.exec(SelectQuery::new().from("Item")).await.unwrap();
    assert_eq!(row_ids(&before, "Item"), row_ids(&after, "Item"));
    assert_eq!(after.values(&col("Item", "price")), vec![Value::Number(2.5)]);
    assert_eq!(db.index_stats("Item.idxPrice").unwrap().total_rows, 1);

    let stats = db.stats();
    assert_eq!(stats.rows_inserted, 1);
    assert_eq!(stats.rows_updated, 1);
}

#[tokio::test]
async fn observer_fires_only_for_its_tables() {
    let db = TestDatabase::memory(todo_schema()).await;
    db.exec(InsertQuery::new("Project").value(payload! { "name" => "home" }))
        .await
        .unwrap();
    db.exec(
        InsertQuery::new("Task")
            .value(payload! {
                "id" => "t1", "project" => 1, "title" => "sweep", "done" => false, "rank" => 1,
            })
            .value(payload! {
                "id" => "t2", "project" => 1, "title" => "cook", "done" => false, "rank" => 2,
            }),
    )
    .await
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<ChangeSet>::new()));
    let sink = Arc::clone(&seen);
    db.observe(
        SelectQuery::new()
            .from("Task")
            .filter(col("Task", "done").eq(false)),
        move |changes| sink.lock().push(changes.clone()),
    )
    .await
    .unwrap();

    db.exec(
        UpdateQuery::new("Task")
            .set("done", true)
            .filter(col("Task", "id").eq("t2")),
    )
    .await
    .unwrap();
    db.exec(InsertQuery::new("Label").value(payload! { "name" => "urgent" }))
        .await
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].added.is_empty());
    assert_eq!(seen[0].removed.len(), 1);
    assert_eq!(
        seen[0].removed[0].value(&col("Task", "id")),
        &Value::from("t2")
    );
}

#[tokio::test]
async fn reader_queued_behind_writer_sees_the_write() {
    let db = TestDatabase::memory(foo_schema()).await;
    let (written, read) = tokio::join!(
        db.exec(InsertQuery::new("Foo").value(payload! { "id" => "x" })),
        db.exec(SelectQuery::new().from("Foo")),
    );
    written.unwrap();
    assert_eq!(read.unwrap().len(), 1);
}

#[tokio::test]
async fn unique_violation_leaves_table_unchanged() {
    let db = TestDatabase::memory(todo_schema()).await;
    db.exec(InsertQuery::new("Label").value(payload! { "name" => "a" }))
        .await
        .unwrap();

    let err = db
        .exec(
            InsertQuery::new("Label")
                .value(payload! { "name" => "b" })
                .value(payload! { "name" => "a" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(DUPLICATE_KEY));
    assert_eq!(db.get_count("Label").unwrap(), 1);
    assert_eq!(db.index_stats("Label.uqName").unwrap().total_rows, 1);
}

#[tokio::test]
async fn foreign_keys_cascade_and_restrict() {
    let db = TestDatabase::memory(todo_schema()).await;
    db.exec(
        InsertQuery::new("Project")
            .value(payload! { "name" => "home" })
            .value(payload! { "name" => "work" }),
    )
    .await
    .unwrap();
    db.exec(
        InsertQuery::new("Task")
            .value(payload! { "id" => "t1", "project" => 1, "title" => "a", "done" => false })
            .value(payload! { "id" => "t2", "project" => 1, "title" => "b", "done" => true })
            .value(payload! { "id" => "t3", "project" => 2, "title" => "c", "done" => false }),
    )
    .await
    .unwrap();

    let err = db
        .exec(InsertQuery::new("Task").value(
            payload! { "id" => "t4", "project" => 99, "title" => "d", "done" => false },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(FK_PARENT_MISSING));

    db.exec(
        InsertQuery::new("Note").value(payload! { "id" => "n1", "task" => "t3", "body" => "x" }),
    )
    .await
    .unwrap();
    let err = db
        .exec(DeleteQuery::new("Task").filter(col("Task", "id").eq("t3")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(FK_RESTRICT));
    assert_eq!(db.get_count("Task").unwrap(), 3);

    db.exec(DeleteQuery::new("Project").filter(col("Project", "id").eq(1)))
        .await
        .unwrap();
    assert_eq!(db.get_count("Project").unwrap(), 1);
    let left = db.exec(SelectQuery::new().from("Task")).await.unwrap();
    assert_eq!(left.values(&col("Task", "id")), vec![Value::from("t3")]);
}

#[tokio::test]
async fn auto_increment_continues_after_explicit_keys() {
    let db = TestDatabase::memory(todo_schema()).await;
    db.exec(
        InsertQuery::new("Project")
            .value(payload! { "name" => "a" })
            .value(payload! { "name" => "b" }),
    )
    .await
    .unwrap();
    db.exec(InsertQuery::new("Project").value(payload! { "id" => 10, "name" => "c" }))
        .await
        .unwrap();
    db.exec(InsertQuery::new("Project").value(payload! { "name" => "d" }))
        .await
        .unwrap();

    let projects = db
        .exec(
            SelectQuery::new()
                .from("Project")
                .order_by(col("Project", "id"), Order::Asc),
        )
        .await
        .unwrap();
    assert_eq!(
        projects.values(&col("Project", "id")),
        vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(10),
            Value::Integer(11)
        ]
    );
}

#[tokio::test]
async fn disjoint_transactions_stay_isolated() {
    let db = TestDatabase::memory(todo_schema()).await;
    let mut labels = db
        .begin(&["Label"], TransactionKind::ReadWrite)
        .await
        .unwrap();
    labels
        .attach(InsertQuery::new("Label").value(payload! { "name" => "staged" }))
        .unwrap();

    let mut projects = db
        .begin(&["Project"], TransactionKind::ReadWrite)
        .await
        .unwrap();
    let err = projects
        .attach(SelectQuery::new().from("Label"))
        .unwrap_err();
    assert_eq!(err.code(), Some(OUT_OF_SCOPE));
    assert_eq!(db.get_count("Label").unwrap(), 0);

    labels.commit().await.unwrap();
    assert_eq!(db.get_count("Label").unwrap(), 1);
}

#[tokio::test]
async fn read_only_queries_are_idempotent() {
    let db = TestDatabase::memory(item_schema()).await;
    db.exec(
        InsertQuery::new("Item")
            .value(payload! { "id" => "a", "price" => 3.0 })
            .value(payload! { "id" => "b" })
            .value(payload! { "id" => "c", "price" => 1.0 }),
    )
    .await
    .unwrap();
    let store = db.memory_store().unwrap().clone();
    let commits = store.commit_count();

    let query = || {
        SelectQuery::new()
            .from("Item")
            .aggregate(AggregateFn::Count, col("Item", "price"))
            .aggregate(AggregateFn::Sum, col("Item", "price"))
    };
    let first = db.exec(query()).await.unwrap();
    let second = db.exec(query()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.commit_count(), commits);
}

#[tokio::test]
async fn log_store_replays_on_reopen() {
    let db = TestDatabase::log_file(todo_schema(), Config::default()).await;
    db.exec(InsertQuery::new("Project").value(payload! { "name" => "home" }))
        .await
        .unwrap();
    db.exec(
        InsertQuery::new("Task").value(payload! {
            "id" => "t1", "project" => 1, "title" => "a", "done" => false, "rank" => 5,
        }),
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
    assert!(db.log_path().is_some());

    let db = db.reopen().await;
    assert_eq!(db.get_count("Project").unwrap(), 1);
    let tasks = db
        .exec(SelectQuery::new().from("Task").filter(col("Task", "done").eq(true)))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(db.index_stats("Task.idxRank").unwrap().total_rows, 1);

    db.exec(InsertQuery::new("Project").value(payload! { "name" => "work" }))
        .await
        .unwrap();
    let ids = db
        .exec(SelectQuery::new().from("Project"))
        .await
        .unwrap()
        .values(&col("Project", "id"));
    assert!(ids.contains(&Value::Integer(2)));
}

#[tokio::test]
async fn torn_log_tail_is_discarded() {
    let backend = InMemoryBackend::new();
    let store = LogStore::new(Box::new(backend.clone()));
    let db = Database::open(foo_schema(), Arc::new(store), Config::default())
        .await
        .unwrap();
    db.exec(InsertQuery::new("Foo").value(payload! { "id" => "kept" }))
        .await
        .unwrap();
    let intact = backend.data().len() as u64;
    db.exec(InsertQuery::new("Foo").value(payload! { "id" => "torn" }))
        .await
        .unwrap();
    db.close().await.unwrap();

    let mut damaged = InMemoryBackend::with_data(backend.data());
    let full = damaged.size().unwrap();
    damaged.truncate(full - 3).unwrap();
    assert!(damaged.size().unwrap() > intact);

    let store = LogStore::new(Box::new(damaged));
    let db = Database::open(foo_schema(), Arc::new(store.clone()), Config::default())
        .await
        .unwrap();
    let rows = db.exec(SelectQuery::new().from("Foo")).await.unwrap();
    assert_eq!(rows.values(&col("Foo", "id")), vec![Value::from("kept")]);
    assert_eq!(store.sequence(), 1);
    assert_eq!(store.size().unwrap(), intact);
}

#[tokio::test]
async fn persisted_indices_survive_reopen() {
    let config = Config::default().persist_indices(true);
    let store = MemoryStore::new().with_index_persistence();
    let db = TestDatabase::memory_with(item_schema(), config, store.clone()).await;
    db.exec(
        InsertQuery::new("Item")
            .value(payload! { "id" => "a", "price" => 3.0 })
            .value(payload! { "id" => "b", "price" => 1.0 }),
    )
    .await
    .unwrap();

    let persisted = store.init(&item_schema()).await.unwrap();
    assert_eq!(persisted.rows("Item").len(), 2);
    assert!(persisted.indices.contains_key("Item.idxPrice"));

    let db = db.reopen().await;
    assert_eq!(db.index_stats("Item.idxPrice").unwrap().total_rows, 2);
    let cheap = db
        .exec(
            SelectQuery::new()
                .from("Item")
                .filter(col("Item", "price").lt(2.0)),
        )
        .await
        .unwrap();
    assert_eq!(cheap.values(&col("Item", "id")), vec![Value::from("b")]);
}

#[tokio::test]
async fn insert_with_a_live_row_id_is_rejected() {
    let db = TestDatabase::memory(item_schema()).await;
    db.exec(InsertQuery::new("Item").value(payload! { "id" => "a", "price" => 1.0 }))
        .await
        .unwrap();
    let existing = db.exec(SelectQuery::new().from("Item")).await.unwrap();
    let taken = row_ids(&existing, "Item")[0];

    let err = db
        .exec(InsertQuery::new("Item").values([Row::new(
            taken,
            payload! { "id" => "b", "price" => 2.0 },
        )]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(DUPLICATE_KEY));

    let count = db.get_count("Item").unwrap();
    assert_eq!(count, 1);
    assert_eq!(db.index_stats("Item.pkItem").unwrap().total_rows, count);
    assert_eq!(db.index_stats("Item.idxPrice").unwrap().total_rows, count);
    let rows = db.exec(SelectQuery::new().from("Item")).await.unwrap();
    assert_eq!(rows.values(&col("Item", "id")), vec![Value::from("a")]);

    // Fresh explicit ids are kept as given.
    let fresh = db.create_row(payload! { "id" => "c" });
    db.exec(InsertQuery::new("Item").values([fresh.clone()]))
        .await
        .unwrap();
    assert_eq!(db.get_many("Item", &[fresh.id()]).unwrap()[0], Some(fresh));
}

#[tokio::test]
async fn observers_see_each_queued_write_separately() {
    let db = TestDatabase::memory(item_schema()).await;
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    let sink = Arc::clone(&seen);
    db.observe(SelectQuery::new().from("Item"), move |changes| {
        sink.lock().push(changes.added.len());
    })
    .await
    .unwrap();

    let held = db.begin(&["Item"], TransactionKind::ReadWrite).await.unwrap();
    let release = async move {
        // Let both writes queue up behind the transaction first.
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        drop(held);
    };
    let (first, second, ()) = tokio::join!(
        db.exec(InsertQuery::new("Item").value(payload! { "id" => "a" })),
        db.exec(InsertQuery::new("Item").value(payload! { "id" => "b" })),
        release,
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(db.get_count("Item").unwrap(), 2);
    assert_eq!(*seen.lock(), vec![1, 1]);
}
