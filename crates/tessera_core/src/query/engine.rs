//! Query planning entry point.

use crate::context::EngineContext;
use crate::error::CoreResult;
use crate::journal::Journal;
use crate::query::descriptor::Query;
use crate::query::exec::Executor;
use crate::query::logical::LogicalPlanFactory;
use crate::query::optimize::{PhysicalContext, PhysicalPlanRewriter};
use crate::query::physical::{PhysicalPlan, PhysicalPlanFactory};
use crate::query::relation::Relation;
use crate::query::rewrite::{LogicalPlanRewriter, RewriteContext};
use std::sync::Arc;
use tracing::debug;

/// Turns query descriptions into executable plans and runs them.
pub struct QueryEngine {
    ctx: Arc<EngineContext>,
    logical: LogicalPlanRewriter,
    physical: PhysicalPlanRewriter,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Creates an engine with the default rewrite passes.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            logical: LogicalPlanRewriter::new(),
            physical: PhysicalPlanRewriter::new(),
        }
    }

    /// Validates `query` and builds its optimized physical plan.
    ///
    /// Index costs and statistics are read from the committed indices at
    /// planning time.
    ///
    /// # Errors
    ///
    /// Returns a syntax error for malformed queries and a lookup error for
    /// unknown tables or columns.
    pub fn get_plan(&self, query: Arc<Query>) -> CoreResult<PhysicalPlan> {
        let schema = self.ctx.schema();
        let config = self.ctx.config();
        query.validate(schema)?;
        let scope = query.scope(schema)?;

        let logical = LogicalPlanFactory::create(&query);
        let logical = self.logical.rewrite(
            logical,
            &RewriteContext {
                schema,
                arena: query.arena(),
                config,
            },
        );
        let physical = PhysicalPlanFactory::create(logical, &query, config);
        let root = {
            let indices = self.ctx.indices().read();
            self.physical.rewrite(
                physical,
                &PhysicalContext {
                    schema,
                    arena: query.arena(),
                    indices: &indices,
                    config,
                },
            )
        };

        let plan = PhysicalPlan::new(root, query, scope);
        debug!(kind = ?plan.query().kind(), scope = ?plan.scope(), "planned query");
        Ok(plan)
    }

    /// Runs `plan` against `journal`. Writes stay staged in the journal.
    ///
    /// # Errors
    ///
    /// Returns scope errors for tables outside the journal scope and
    /// constraint errors raised while staging writes.
    pub fn execute(&self, plan: &PhysicalPlan, journal: &mut Journal) -> CoreResult<Relation> {
        Executor::new(journal, plan.query()).run(plan.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{FOREIGN_COLUMN, TABLE_NOT_FOUND};
    use crate::payload;
    use crate::query::descriptor::{AggregateFn, DeleteQuery, InsertQuery, SelectQuery, UpdateQuery};
    use crate::query::predicate::col;
    use crate::schema::{ColumnType, Schema, TableSchema};
    use crate::store::{MemoryStore, PersistedState};
    use crate::types::{Order, TransactionKind};
    use crate::value::Value;

    fn context(config: Config) -> Arc<EngineContext> {
        let schema = Schema::new(vec![
            TableSchema::new("Emp")
                .column("id", ColumnType::Integer)
                .column("dept", ColumnType::Text)
                .nullable_column("salary", ColumnType::Integer)
                .primary_key(&["id"])
                .index("idxSalary", &[("salary", Order::Asc)]),
            TableSchema::new("Dept")
                .column("id", ColumnType::Text)
                .column("name", ColumnType::Text)
                .primary_key(&["id"]),
        ])
        .unwrap();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(schema),
            config,
            Arc::new(MemoryStore::new()),
        ));
        ctx.seed(PersistedState::default()).unwrap();
        ctx
    }

    async fn run(
        engine: &QueryEngine,
        ctx: &Arc<EngineContext>,
        query: impl Into<Query>,
    ) -> Relation {
        let plan = engine.get_plan(Arc::new(query.into())).unwrap();
        let kind = plan.query().kind();
        let mut journal = Journal::new(Arc::clone(ctx), plan.scope().clone(), kind);
        let relation = engine.execute(&plan, &mut journal).unwrap();
        if kind == TransactionKind::ReadWrite {
            journal.commit().await.unwrap();
        }
        relation
    }

    async fn seeded(config: Config) -> (Arc<EngineContext>, QueryEngine) {
        let ctx = context(config);
        let engine = QueryEngine::new(Arc::clone(&ctx));
        run(
            &engine,
            &ctx,
            InsertQuery::new("Dept")
                .value(payload! { "id" => "d1", "name" => "Eng" })
                .value(payload! { "id" => "d2", "name" => "Ops" }),
        )
        .await;
        run(
            &engine,
            &ctx,
            InsertQuery::new("Emp")
                .value(payload! { "id" => 1, "dept" => "d1", "salary" => 300 })
                .value(payload! { "id" => 2, "dept" => "d1", "salary" => 100 })
                .value(payload! { "id" => 3, "dept" => "d2", "salary" => Value::Null })
                .value(payload! { "id" => 4, "dept" => "d9", "salary" => 200 }),
        )
        .await;
        (ctx, engine)
    }

    #[tokio::test]
    async fn filtered_select_uses_index() {
        let (ctx, engine) = seeded(Config::default()).await;
        let query = SelectQuery::new()
            .from("Emp")
            .filter(col("Emp", "salary").gte(150));
        let plan = engine.get_plan(Arc::new(query.clone().into())).unwrap();
        assert!(plan.explain().contains("index_range_scan(Emp.idxSalary"));

        let result = run(&engine, &ctx, query).await;
        let mut ids = result.values(&col("Emp", "id"));
        ids.sort();
        assert_eq!(ids, vec![Value::Integer(1), Value::Integer(4)]);
        assert_eq!(ctx.stats().snapshot().index_scans, 1);
    }

    #[tokio::test]
    async fn join_group_and_order() {
        for hash_joins in [false, true] {
            let config = Config::default().hash_joins(hash_joins);
            let (ctx, engine) = seeded(config).await;
            let query = SelectQuery::new()
                .column(col("Dept", "name"))
                .aggregate(AggregateFn::Sum, col("Emp", "salary"))
                .from("Emp")
                .inner_join("Dept", col("Emp", "dept").eq_col(&col("Dept", "id")))
                .group_by(col("Dept", "name"))
                .order_by(col("Dept", "name"), Order::Asc);
            let result = run(&engine, &ctx, query).await;

            assert_eq!(
                result.values(&col("Dept", "name")),
                vec![Value::from("Eng"), Value::from("Ops")]
            );
            let sums: Vec<_> = result
                .entries()
                .iter()
                .map(|e| e.derived("SUM(Emp.salary)").cloned())
                .collect();
            assert_eq!(sums, vec![Some(Value::Integer(400)), Some(Value::Null)]);
        }
    }

    #[tokio::test]
    async fn outer_join_keeps_orphans() {
        let (ctx, engine) = seeded(Config::default()).await;
        let query = SelectQuery::new()
            .from("Emp")
            .left_outer_join("Dept", col("Emp", "dept").eq_col(&col("Dept", "id")))
            .order_by(col("Emp", "id"), Order::Asc);
        let result = run(&engine, &ctx, query).await;

        assert_eq!(result.len(), 4);
        let orphan = &result.entries()[3];
        assert_eq!(orphan.value(&col("Emp", "id")), &Value::Integer(4));
        assert!(orphan.row("Dept").is_none());
        assert!(orphan.value(&col("Dept", "name")).is_null());
    }

    #[tokio::test]
    async fn ordered_page_with_nulls_first() {
        let (ctx, engine) = seeded(Config::default().index_scans(false)).await;
        let query = SelectQuery::new()
            .from("Emp")
            .order_by(col("Emp", "salary"), Order::Desc)
            .skip(1)
            .limit(2);
        let result = run(&engine, &ctx, query).await;
        assert_eq!(
            result.values(&col("Emp", "salary")),
            vec![Value::Integer(300), Value::Integer(200)]
        );
    }

    #[tokio::test]
    async fn update_and_delete() {
        let (ctx, engine) = seeded(Config::default()).await;
        run(
            &engine,
            &ctx,
            UpdateQuery::new("Emp")
                .set("salary", 50)
                .filter(col("Emp", "dept").eq("d1")),
        )
        .await;
        run(
            &engine,
            &ctx,
            DeleteQuery::new("Emp").filter(col("Emp", "salary").is_null()),
        )
        .await;

        let result = run(
            &engine,
            &ctx,
            SelectQuery::new()
                .aggregate(AggregateFn::Count, col("Emp", "id"))
                .aggregate(AggregateFn::Sum, col("Emp", "salary"))
                .from("Emp"),
        )
        .await;
        let entry = &result.entries()[0];
        assert_eq!(entry.derived("COUNT(Emp.id)"), Some(&Value::Integer(3)));
        assert_eq!(entry.derived("SUM(Emp.salary)"), Some(&Value::Integer(300)));
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let ctx = context(Config::default());
        let engine = QueryEngine::new(Arc::clone(&ctx));

        let err = engine
            .get_plan(Arc::new(SelectQuery::new().from("Nope").into()))
            .unwrap_err();
        assert_eq!(err.code(), Some(TABLE_NOT_FOUND));

        let err = engine
            .get_plan(Arc::new(
                SelectQuery::new()
                    .from("Emp")
                    .filter(col("Dept", "id").eq("d1"))
                    .into(),
            ))
            .unwrap_err();
        assert_eq!(err.code(), Some(FOREIGN_COLUMN));
    }
}
