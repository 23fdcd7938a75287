//! Logical plan rewriting.
//!
//! Each [`RewritePass`] is a pure tree-to-tree transform that keeps the
//! result set unchanged. [`LogicalPlanRewriter`] runs them in order:
//! 1. [`AndSplit`] breaks conjunctions into chained selects
//! 2. [`PushdownSelects`] moves selects toward table access
//! 3. [`ImplicitJoins`] turns a join predicate over a cross product into a join
//! 4. [`IndexCandidates`] marks selects an index could answer

use crate::config::Config;
use crate::query::logical::LogicalNode;
use crate::query::predicate::{PredicateArena, PredicateId};
use crate::schema::Schema;
use std::collections::BTreeSet;
use tracing::trace;

/// Inputs shared by every logical pass.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    /// Database schema.
    pub schema: &'a Schema,
    /// Predicates of the query being planned.
    pub arena: &'a PredicateArena,
    /// Database configuration.
    pub config: &'a Config,
}

/// A logical rewrite.
pub trait RewritePass: Send + Sync {
    /// Returns the pass name used in logs.
    fn name(&self) -> &'static str;

    /// Rewrites `node`.
    fn rewrite(&self, node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode;
}

/// Runs logical passes in order.
pub struct LogicalPlanRewriter {
    passes: Vec<Box<dyn RewritePass>>,
}

impl std::fmt::Debug for LogicalPlanRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.passes.iter().map(|p| p.name()).collect();
        f.debug_struct("LogicalPlanRewriter")
            .field("passes", &names)
            .finish()
    }
}

impl Default for LogicalPlanRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalPlanRewriter {
    /// Creates a rewriter with the default passes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_passes(vec![
            Box::new(AndSplit),
            Box::new(PushdownSelects),
            Box::new(ImplicitJoins),
            Box::new(IndexCandidates),
        ])
    }

    /// Creates a rewriter with custom passes.
    #[must_use]
    pub fn with_passes(passes: Vec<Box<dyn RewritePass>>) -> Self {
        Self { passes }
    }

    /// Applies every pass to `node`.
    #[must_use]
    pub fn rewrite(&self, mut node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode {
        for pass in &self.passes {
            node = pass.rewrite(node, ctx);
            trace!(pass = pass.name(), "logical pass applied");
        }
        node
    }
}

/// Rebuilds `node` with `f` applied to each child.
pub(crate) fn map_children<F>(node: LogicalNode, f: &mut F) -> LogicalNode
where
    F: FnMut(LogicalNode) -> LogicalNode,
{
    let mut apply = |child: Box<LogicalNode>| Box::new(f(*child));
    match node {
        LogicalNode::TableAccess { .. } | LogicalNode::Insert { .. } => node,
        LogicalNode::Select {
            predicate,
            indexable,
            child,
        } => LogicalNode::Select {
            predicate,
            indexable,
            child: apply(child),
        },
        LogicalNode::CrossProduct { left, right } => LogicalNode::CrossProduct {
            left: apply(left),
            right: apply(right),
        },
        LogicalNode::Join {
            predicate,
            outer,
            left,
            right,
        } => LogicalNode::Join {
            predicate,
            outer,
            left: apply(left),
            right: apply(right),
        },
        LogicalNode::Project { columns, child } => LogicalNode::Project {
            columns,
            child: apply(child),
        },
        LogicalNode::GroupBy { columns, child } => LogicalNode::GroupBy {
            columns,
            child: apply(child),
        },
        LogicalNode::Aggregation { aggregates, child } => LogicalNode::Aggregation {
            aggregates,
            child: apply(child),
        },
        LogicalNode::OrderBy { keys, child } => LogicalNode::OrderBy {
            keys,
            child: apply(child),
        },
        LogicalNode::Skip { count, child } => LogicalNode::Skip {
            count,
            child: apply(child),
        },
        LogicalNode::Limit { count, child } => LogicalNode::Limit {
            count,
            child: apply(child),
        },
        LogicalNode::Update { table, child } => LogicalNode::Update {
            table,
            child: apply(child),
        },
        LogicalNode::Delete { table, child } => LogicalNode::Delete {
            table,
            child: apply(child),
        },
    }
}

fn select(predicate: PredicateId, child: LogicalNode) -> LogicalNode {
    LogicalNode::Select {
        predicate,
        indexable: false,
        child: Box::new(child),
    }
}

/// Splits `a AND b` into `select(a) -> select(b)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AndSplit;

impl RewritePass for AndSplit {
    fn name(&self) -> &'static str {
        "and_split"
    }

    fn rewrite(&self, node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode {
        match node {
            LogicalNode::Select {
                predicate, child, ..
            } => {
                let child = self.rewrite(*child, ctx);
                ctx.arena
                    .conjuncts(predicate)
                    .into_iter()
                    .rev()
                    .fold(child, |node, conjunct| select(conjunct, node))
            }
            other => map_children(other, &mut |child| self.rewrite(child, ctx)),
        }
    }
}

/// Moves each select to the lowest node covering its tables.
///
/// Selects never move into the right side of an outer join, which would
/// turn filtered-out matches into null-extended entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushdownSelects;

impl PushdownSelects {
    fn place(predicate: PredicateId, node: LogicalNode, needed: &BTreeSet<String>) -> LogicalNode {
        match node {
            LogicalNode::CrossProduct { left, right } => {
                if needed.is_subset(&left.tables()) {
                    LogicalNode::CrossProduct {
                        left: Box::new(Self::place(predicate, *left, needed)),
                        right,
                    }
                } else if needed.is_subset(&right.tables()) {
                    LogicalNode::CrossProduct {
                        left,
                        right: Box::new(Self::place(predicate, *right, needed)),
                    }
                } else {
                    select(predicate, LogicalNode::CrossProduct { left, right })
                }
            }
            LogicalNode::Join {
                predicate: on,
                outer,
                left,
                right,
            } => {
                if needed.is_subset(&left.tables()) {
                    LogicalNode::Join {
                        predicate: on,
                        outer,
                        left: Box::new(Self::place(predicate, *left, needed)),
                        right,
                    }
                } else if !outer && needed.is_subset(&right.tables()) {
                    LogicalNode::Join {
                        predicate: on,
                        outer,
                        left,
                        right: Box::new(Self::place(predicate, *right, needed)),
                    }
                } else {
                    select(
                        predicate,
                        LogicalNode::Join {
                            predicate: on,
                            outer,
                            left,
                            right,
                        },
                    )
                }
            }
            LogicalNode::Select {
                predicate: other,
                indexable,
                child,
            } => LogicalNode::Select {
                predicate: other,
                indexable,
                child: Box::new(Self::place(predicate, *child, needed)),
            },
            other => select(predicate, other),
        }
    }
}

impl RewritePass for PushdownSelects {
    fn name(&self) -> &'static str {
        "pushdown_selects"
    }

    fn rewrite(&self, node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode {
        match node {
            LogicalNode::Select {
                predicate, child, ..
            } => {
                let child = self.rewrite(*child, ctx);
                Self::place(predicate, child, &ctx.arena.tables(predicate))
            }
            other => map_children(other, &mut |child| self.rewrite(child, ctx)),
        }
    }
}

/// Replaces `select(join predicate) -> cross_product` with an inner join.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImplicitJoins;

impl RewritePass for ImplicitJoins {
    fn name(&self) -> &'static str {
        "implicit_joins"
    }

    fn rewrite(&self, node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode {
        let node = map_children(node, &mut |child| self.rewrite(child, ctx));
        match node {
            LogicalNode::Select {
                predicate,
                indexable,
                child,
            } => match *child {
                LogicalNode::CrossProduct { left, right }
                    if ctx.arena.is_join(predicate)
                        && spans(ctx.arena, predicate, &left.tables(), &right.tables()) =>
                {
                    LogicalNode::Join {
                        predicate,
                        outer: false,
                        left,
                        right,
                    }
                }
                child => LogicalNode::Select {
                    predicate,
                    indexable,
                    child: Box::new(child),
                },
            },
            other => other,
        }
    }
}

fn spans(
    arena: &PredicateArena,
    predicate: PredicateId,
    left: &BTreeSet<String>,
    right: &BTreeSet<String>,
) -> bool {
    let tables = arena.tables(predicate);
    tables.iter().any(|t| left.contains(t)) && tables.iter().any(|t| right.contains(t))
}

/// Marks selects over a table access whose predicate an index could answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexCandidates;

impl IndexCandidates {
    fn is_candidate(predicate: PredicateId, table: &str, ctx: &RewriteContext<'_>) -> bool {
        let Some((column, _)) = ctx.arena.key_ranges(predicate) else {
            return false;
        };
        if column.table != table {
            return false;
        }
        ctx.schema.table(table).is_ok_and(|schema| {
            schema
                .all_indices()
                .any(|spec| spec.leading_column() == Some(column.name.as_str()))
        })
    }
}

pub(crate) fn access_table(node: &LogicalNode) -> Option<&str> {
    match node {
        LogicalNode::TableAccess { table } => Some(table),
        LogicalNode::Select { child, .. } => access_table(child),
        _ => None,
    }
}

impl RewritePass for IndexCandidates {
    fn name(&self) -> &'static str {
        "index_candidates"
    }

    fn rewrite(&self, node: LogicalNode, ctx: &RewriteContext<'_>) -> LogicalNode {
        if !ctx.config.index_scans {
            return node;
        }
        let node = map_children(node, &mut |child| self.rewrite(child, ctx));
        match node {
            LogicalNode::Select {
                predicate, child, ..
            } => {
                let indexable = access_table(&child)
                    .is_some_and(|table| Self::is_candidate(predicate, table, ctx));
                LogicalNode::Select {
                    predicate,
                    indexable,
                    child,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{Query, SelectQuery};
    use crate::query::logical::LogicalPlanFactory;
    use crate::query::predicate::col;
    use crate::schema::{ColumnType, TableSchema};
    use crate::types::Order;

    fn schema() -> Schema {
        Schema::new(vec![
            TableSchema::new("A")
                .column("id", ColumnType::Integer)
                .column("x", ColumnType::Integer)
                .primary_key(&["id"]),
            TableSchema::new("B")
                .column("a", ColumnType::Integer)
                .column("y", ColumnType::Integer)
                .index("idxY", &[("y", Order::Asc)]),
            TableSchema::new("C").column("a", ColumnType::Integer),
        ])
        .unwrap()
    }

    fn plan(query: SelectQuery, config: &Config) -> String {
        let schema = schema();
        let query: Query = query.into();
        let ctx = RewriteContext {
            schema: &schema,
            arena: query.arena(),
            config,
        };
        let node = LogicalPlanRewriter::new().rewrite(LogicalPlanFactory::create(&query), &ctx);
        node.explain(query.arena())
    }

    #[test]
    fn selects_split_push_down_and_join() {
        let query = SelectQuery::new()
            .from("A")
            .from("B")
            .filter(
                col("A", "id")
                    .eq_col(&col("B", "a"))
                    .and(col("B", "y").gt(3))
                    .and(col("A", "x").eq(1)),
            );
        assert_eq!(
            plan(query, &Config::default()),
            "join(inner, A.id = B.a)\n\
             -select(A.x = 1)\n\
             --table_access(A)\n\
             -select(B.y > 3, indexable)\n\
             --table_access(B)\n"
        );
    }

    #[test]
    fn outer_join_right_side_is_not_filtered_early() {
        let query = SelectQuery::new()
            .from("A")
            .left_outer_join("C", col("C", "a").eq_col(&col("A", "id")))
            .filter(col("C", "a").is_null().and(col("A", "id").eq(2)));
        assert_eq!(
            plan(query, &Config::default()),
            "select(C.a IS NULL)\n\
             -join(outer, C.a = A.id)\n\
             --select(A.id = 2, indexable)\n\
             ---table_access(A)\n\
             --table_access(C)\n"
        );
    }

    #[test]
    fn index_candidates_respect_config() {
        let query = SelectQuery::new().from("B").filter(col("B", "y").eq(1));
        assert!(plan(query.clone(), &Config::default()).contains("indexable"));
        assert!(!plan(query, &Config::new().index_scans(false)).contains("indexable"));

        let unindexed = SelectQuery::new().from("B").filter(col("B", "a").eq(1));
        assert!(!plan(unindexed, &Config::default()).contains("indexable"));
    }
}
