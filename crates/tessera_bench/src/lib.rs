//! Benchmark utilities.

use rand::Rng;
use std::sync::Arc;
use tessera_core::query::InsertQuery;
use tessera_core::store::MemoryStore;
use tessera_core::{payload, ColumnType, Config, Database, Order, Payload, Schema, TableSchema};
use tokio::runtime::Runtime;

/// Builds a single-threaded runtime for driving database futures.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("build runtime")
}

/// `Dept(id, name)` and `Emp(id, dept, salary)` with an index on salary.
pub fn bench_schema() -> Schema {
    Schema::new(vec![
        TableSchema::new("Dept")
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::Text)
            .primary_key(&["id"]),
        TableSchema::new("Emp")
            .column("id", ColumnType::Integer)
            .column("dept", ColumnType::Integer)
            .column("salary", ColumnType::Integer)
            .primary_key(&["id"])
            .index("idxSalary", &[("salary", Order::Asc)]),
    ])
    .expect("valid schema")
}

/// Generates `count` employees spread over `depts` departments.
pub fn employees(count: usize, depts: usize) -> Vec<Payload> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|n| {
            payload! {
                "id" => n as i64,
                "dept" => rng.gen_range(0..depts as i64),
                "salary" => rng.gen_range(10_000i64..200_000),
            }
        })
        .collect()
}

/// Opens an in-memory database seeded with `emps` employees and `depts`
/// departments.
pub fn populated(rt: &Runtime, emps: usize, depts: usize, config: Config) -> Database {
    rt.block_on(async {
        let db = Database::open(bench_schema(), Arc::new(MemoryStore::new()), config)
            .await
            .expect("open database");
        let departments =
            (0..depts).map(|n| payload! { "id" => n as i64, "name" => format!("dept-{n}") });
        db.exec(InsertQuery::new("Dept").payloads(departments))
            .await
            .expect("seed departments");
        db.exec(InsertQuery::new("Emp").payloads(employees(emps, depts)))
            .await
            .expect("seed employees");
        db
    })
}
