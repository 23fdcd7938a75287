//! Logical plans.

use crate::query::descriptor::{AggregateFn, Projection, Query, SelectQuery};
use crate::query::predicate::{ColumnRef, PredicateArena, PredicateId};
use crate::types::Order;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// A relational operator, independent of how it is executed.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalNode {
    /// Reads every row of a table.
    TableAccess {
        /// Source table.
        table: String,
    },
    /// Filters by a predicate.
    Select {
        /// Predicate in the query arena.
        predicate: PredicateId,
        /// Set when an index could answer the predicate.
        indexable: bool,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Pairs every entry of `left` with every entry of `right`.
    CrossProduct {
        /// Left input.
        left: Box<LogicalNode>,
        /// Right input.
        right: Box<LogicalNode>,
    },
    /// Joins two inputs on a predicate.
    Join {
        /// Join predicate.
        predicate: PredicateId,
        /// Keeps unmatched left entries.
        outer: bool,
        /// Left input.
        left: Box<LogicalNode>,
        /// Right input.
        right: Box<LogicalNode>,
    },
    /// Keeps the listed columns.
    Project {
        /// Projected columns and aggregates.
        columns: Vec<Projection>,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Groups entries by column values.
    GroupBy {
        /// Grouping columns.
        columns: Vec<ColumnRef>,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Computes aggregates per group.
    Aggregation {
        /// Aggregates to compute.
        aggregates: Vec<(AggregateFn, ColumnRef)>,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Sorts entries.
    OrderBy {
        /// Sort keys, most significant first.
        keys: Vec<(Projection, Order)>,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Drops leading entries.
    Skip {
        /// Entries to drop.
        count: usize,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Truncates the input.
    Limit {
        /// Entries to keep.
        count: usize,
        /// Input.
        child: Box<LogicalNode>,
    },
    /// Stages the query's rows.
    Insert {
        /// Target table.
        table: String,
        /// Replace rows with matching primary keys.
        or_replace: bool,
    },
    /// Stages updates of the input rows.
    Update {
        /// Target table.
        table: String,
        /// Rows to update.
        child: Box<LogicalNode>,
    },
    /// Stages removal of the input rows.
    Delete {
        /// Target table.
        table: String,
        /// Rows to remove.
        child: Box<LogicalNode>,
    },
}

impl LogicalNode {
    /// Returns the tables the node's output covers.
    #[must_use]
    pub fn tables(&self) -> BTreeSet<String> {
        match self {
            Self::TableAccess { table }
            | Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. } => BTreeSet::from([table.clone()]),
            Self::CrossProduct { left, right } | Self::Join { left, right, .. } => {
                let mut tables = left.tables();
                tables.extend(right.tables());
                tables
            }
            Self::Select { child, .. }
            | Self::Project { child, .. }
            | Self::GroupBy { child, .. }
            | Self::Aggregation { child, .. }
            | Self::OrderBy { child, .. }
            | Self::Skip { child, .. }
            | Self::Limit { child, .. } => child.tables(),
        }
    }

    /// Renders the tree, one node per line, children indented.
    #[must_use]
    pub fn explain(&self, arena: &PredicateArena) -> String {
        let mut out = String::new();
        self.explain_into(arena, 0, &mut out);
        out
    }

    fn explain_into(&self, arena: &PredicateArena, depth: usize, out: &mut String) {
        let _ = write!(out, "{}", "-".repeat(depth));
        let children: Vec<&LogicalNode> = match self {
            Self::TableAccess { table } => {
                let _ = writeln!(out, "table_access({table})");
                Vec::new()
            }
            Self::Select {
                predicate,
                indexable,
                child,
            } => {
                let mark = if *indexable { ", indexable" } else { "" };
                let _ = writeln!(out, "select({}{mark})", arena.describe(*predicate));
                vec![child.as_ref()]
            }
            Self::CrossProduct { left, right } => {
                let _ = writeln!(out, "cross_product");
                vec![left.as_ref(), right.as_ref()]
            }
            Self::Join {
                predicate,
                outer,
                left,
                right,
            } => {
                let kind = if *outer { "outer" } else { "inner" };
                let _ = writeln!(out, "join({kind}, {})", arena.describe(*predicate));
                vec![left.as_ref(), right.as_ref()]
            }
            Self::Project { columns, child } => {
                let _ = writeln!(out, "project({})", join_display(columns));
                vec![child.as_ref()]
            }
            Self::GroupBy { columns, child } => {
                let _ = writeln!(out, "group_by({})", join_display(columns));
                vec![child.as_ref()]
            }
            Self::Aggregation { aggregates, child } => {
                let labels: Vec<String> = aggregates.iter().map(|(f, c)| f.label(c)).collect();
                let _ = writeln!(out, "aggregation({})", labels.join(", "));
                vec![child.as_ref()]
            }
            Self::OrderBy { keys, child } => {
                let keys: Vec<String> = keys.iter().map(|(p, o)| format!("{p} {o}")).collect();
                let _ = writeln!(out, "order_by({})", keys.join(", "));
                vec![child.as_ref()]
            }
            Self::Skip { count, child } => {
                let _ = writeln!(out, "skip({count})");
                vec![child.as_ref()]
            }
            Self::Limit { count, child } => {
                let _ = writeln!(out, "limit({count})");
                vec![child.as_ref()]
            }
            Self::Insert { table, or_replace } => {
                let verb = if *or_replace { "insert_or_replace" } else { "insert" };
                let _ = writeln!(out, "{verb}({table})");
                Vec::new()
            }
            Self::Update { table, child } => {
                let _ = writeln!(out, "update({table})");
                vec![child.as_ref()]
            }
            Self::Delete { table, child } => {
                let _ = writeln!(out, "delete({table})");
                vec![child.as_ref()]
            }
        };
        for child in children {
            child.explain_into(arena, depth + 1, out);
        }
    }
}

pub(crate) fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds un-optimized logical plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogicalPlanFactory;

impl LogicalPlanFactory {
    /// Builds the logical tree of `query`. The query must be valid.
    #[must_use]
    pub fn create(query: &Query) -> LogicalNode {
        match query {
            Query::Select(select) => Self::select(select),
            Query::Insert(insert) => LogicalNode::Insert {
                table: insert.table.clone(),
                or_replace: insert.or_replace,
            },
            Query::Update(update) => LogicalNode::Update {
                table: update.table.clone(),
                child: Box::new(filtered(&update.table, update.predicate)),
            },
            Query::Delete(delete) => LogicalNode::Delete {
                table: delete.table.clone(),
                child: Box::new(filtered(&delete.table, delete.predicate)),
            },
        }
    }

    fn select(query: &SelectQuery) -> LogicalNode {
        let mut sources = query.from.iter().map(|table| LogicalNode::TableAccess {
            table: table.clone(),
        });
        let mut node = sources.next().unwrap_or(LogicalNode::TableAccess {
            table: String::new(),
        });
        for right in sources {
            node = LogicalNode::CrossProduct {
                left: Box::new(node),
                right: Box::new(right),
            };
        }
        for (table, predicate) in &query.outer_joins {
            node = LogicalNode::Join {
                predicate: *predicate,
                outer: true,
                left: Box::new(node),
                right: Box::new(LogicalNode::TableAccess {
                    table: table.clone(),
                }),
            };
        }
        if let Some(predicate) = query.predicate {
            node = LogicalNode::Select {
                predicate,
                indexable: false,
                child: Box::new(node),
            };
        }

        let aggregates = query.aggregates();
        if !query.group_by.is_empty() {
            node = LogicalNode::GroupBy {
                columns: query.group_by.clone(),
                child: Box::new(node),
            };
        }
        if !aggregates.is_empty() || !query.group_by.is_empty() {
            node = LogicalNode::Aggregation {
                aggregates,
                child: Box::new(node),
            };
        }
        if !query.order_by.is_empty() {
            node = LogicalNode::OrderBy {
                keys: query.order_by.clone(),
                child: Box::new(node),
            };
        }
        if let Some(count) = query.skip {
            node = LogicalNode::Skip {
                count,
                child: Box::new(node),
            };
        }
        if let Some(count) = query.limit {
            node = LogicalNode::Limit {
                count,
                child: Box::new(node),
            };
        }
        if !query.projections.is_empty() {
            node = LogicalNode::Project {
                columns: query.projections.clone(),
                child: Box::new(node),
            };
        }
        node
    }
}

fn filtered(table: &str, predicate: Option<PredicateId>) -> LogicalNode {
    let access = LogicalNode::TableAccess {
        table: table.to_string(),
    };
    match predicate {
        Some(predicate) => LogicalNode::Select {
            predicate,
            indexable: false,
            child: Box::new(access),
        },
        None => access,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{DeleteQuery, InsertQuery};
    use crate::query::predicate::col;

    #[test]
    fn select_shape() {
        let query: Query = SelectQuery::new()
            .column(col("A", "x"))
            .from("A")
            .from("B")
            .left_outer_join("C", col("C", "a").eq_col(&col("A", "x")))
            .filter(col("A", "x").eq_col(&col("B", "y")))
            .order_by(col("A", "x"), Order::Desc)
            .skip(1)
            .limit(2)
            .into();
        let plan = LogicalPlanFactory::create(&query);

        assert_eq!(
            plan.explain(query.arena()),
            "project(A.x)\n\
             -limit(2)\n\
             --skip(1)\n\
             ---order_by(A.x DESC)\n\
             ----select(A.x = B.y)\n\
             -----join(outer, C.a = A.x)\n\
             ------cross_product\n\
             -------table_access(A)\n\
             -------table_access(B)\n\
             ------table_access(C)\n"
        );
        assert_eq!(plan.tables().len(), 3);
    }

    #[test]
    fn dml_shapes() {
        let delete: Query = DeleteQuery::new("A").filter(col("A", "x").lt(3)).into();
        assert_eq!(
            LogicalPlanFactory::create(&delete).explain(delete.arena()),
            "delete(A)\n-select(A.x < 3)\n--table_access(A)\n"
        );

        let insert: Query = InsertQuery::new("A").or_replace().into();
        assert_eq!(
            LogicalPlanFactory::create(&insert),
            LogicalNode::Insert {
                table: "A".to_string(),
                or_replace: true
            }
        );
    }
}
