//! Physical plans.

use crate::config::Config;
use crate::index::KeyRange;
use crate::query::descriptor::{AggregateFn, Projection, Query};
use crate::query::logical::{join_display, LogicalNode};
use crate::query::predicate::{ColumnRef, PredicateArena, PredicateId};
use crate::types::Order;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// How many inputs a step consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    /// Leaf step.
    NoChild,
    /// Consumes the output of its first child.
    FirstChild,
    /// Consumes the outputs of every child.
    AllChildren,
}

/// Join evaluation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAlgorithm {
    /// Evaluates the predicate on every pair.
    NestedLoop,
    /// Builds a hash table on the right input, probes with the left.
    Hash,
}

/// An executable step.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalStep {
    /// Reads every live row of a table.
    TableAccessFull {
        /// Source table.
        table: String,
    },
    /// Reads the rows whose ids the child produced.
    TableAccessByRowId {
        /// Source table.
        table: String,
    },
    /// Produces row ids from an index.
    IndexRangeScan {
        /// Owning table.
        table: String,
        /// Qualified index name.
        index: String,
        /// Key ranges, in value space.
        ranges: Vec<KeyRange>,
        /// Reverse index order.
        reverse: bool,
        /// Maximum number of ids.
        limit: Option<usize>,
        /// Leading ids to drop.
        skip: usize,
    },
    /// Filters by a predicate of the query.
    Select {
        /// Predicate id in the query arena.
        predicate: PredicateId,
        /// Set when an index could answer the predicate instead.
        index_candidate: bool,
    },
    /// Joins two inputs.
    Join {
        /// Join predicate.
        predicate: PredicateId,
        /// Keeps unmatched left entries.
        outer: bool,
        /// Evaluation strategy.
        algorithm: JoinAlgorithm,
    },
    /// Pairs every left entry with every right entry.
    CrossProduct,
    /// Keeps the listed columns and aggregates.
    Project {
        /// Projections.
        columns: Vec<Projection>,
    },
    /// Groups entries.
    GroupBy {
        /// Grouping columns.
        columns: Vec<ColumnRef>,
    },
    /// Computes aggregates, one entry per group.
    Aggregation {
        /// Aggregates.
        aggregates: Vec<(AggregateFn, ColumnRef)>,
    },
    /// Sorts entries; nulls first in either direction.
    OrderBy {
        /// Sort keys.
        keys: Vec<(Projection, Order)>,
    },
    /// Drops leading entries.
    Skip {
        /// Entries to drop.
        count: usize,
    },
    /// Truncates.
    Limit {
        /// Entries to keep.
        count: usize,
    },
    /// Stages the query's rows as inserts.
    Insert {
        /// Target table.
        table: String,
    },
    /// Stages the query's rows, replacing matching primary keys.
    InsertOrReplace {
        /// Target table.
        table: String,
    },
    /// Stages updates of the input rows.
    Update {
        /// Target table.
        table: String,
    },
    /// Stages removal of the input rows.
    Delete {
        /// Target table.
        table: String,
    },
}

impl PhysicalStep {
    /// Returns how many inputs the step consumes.
    #[must_use]
    pub fn exec_type(&self) -> ExecType {
        match self {
            Self::TableAccessFull { .. }
            | Self::IndexRangeScan { .. }
            | Self::Insert { .. }
            | Self::InsertOrReplace { .. } => ExecType::NoChild,
            Self::Join { .. } | Self::CrossProduct => ExecType::AllChildren,
            _ => ExecType::FirstChild,
        }
    }

    fn describe(&self, arena: &PredicateArena) -> String {
        match self {
            Self::TableAccessFull { table } => format!("table_access({table})"),
            Self::TableAccessByRowId { table } => format!("table_access_by_row_id({table})"),
            Self::IndexRangeScan {
                index,
                ranges,
                reverse,
                limit,
                skip,
                ..
            } => {
                let mut out = format!(
                    "index_range_scan({index}, {}, {})",
                    join_display(ranges),
                    if *reverse { "reverse" } else { "natural" }
                );
                if let Some(limit) = limit {
                    let _ = write!(out, ", limit:{limit}");
                }
                if *skip > 0 {
                    let _ = write!(out, ", skip:{skip}");
                }
                out
            }
            Self::Select { predicate, .. } => format!("select({})", arena.describe(*predicate)),
            Self::Join {
                predicate,
                outer,
                algorithm,
            } => format!(
                "join({}, {}, {})",
                if *outer { "outer" } else { "inner" },
                match algorithm {
                    JoinAlgorithm::NestedLoop => "nested_loop",
                    JoinAlgorithm::Hash => "hash",
                },
                arena.describe(*predicate)
            ),
            Self::CrossProduct => "cross_product".to_string(),
            Self::Project { columns } => format!("project({})", join_display(columns)),
            Self::GroupBy { columns } => format!("group_by({})", join_display(columns)),
            Self::Aggregation { aggregates } => {
                let labels: Vec<String> = aggregates.iter().map(|(f, c)| f.label(c)).collect();
                format!("aggregation({})", labels.join(", "))
            }
            Self::OrderBy { keys } => {
                let keys: Vec<String> = keys.iter().map(|(p, o)| format!("{p} {o}")).collect();
                format!("order_by({})", keys.join(", "))
            }
            Self::Skip { count } => format!("skip({count})"),
            Self::Limit { count } => format!("limit({count})"),
            Self::Insert { table } => format!("insert({table})"),
            Self::InsertOrReplace { table } => format!("insert_or_replace({table})"),
            Self::Update { table } => format!("update({table})"),
            Self::Delete { table } => format!("delete({table})"),
        }
    }
}

/// A step and its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalNode {
    /// The step.
    pub step: PhysicalStep,
    /// Inputs, executed before the step.
    pub children: Vec<PhysicalNode>,
}

impl PhysicalNode {
    /// Creates a leaf.
    #[must_use]
    pub fn leaf(step: PhysicalStep) -> Self {
        Self {
            step,
            children: Vec::new(),
        }
    }

    /// Creates a node over `children`.
    #[must_use]
    pub fn new(step: PhysicalStep, children: Vec<PhysicalNode>) -> Self {
        Self { step, children }
    }

    /// Returns the tables read by the subtree.
    #[must_use]
    pub fn tables(&self) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, tables: &mut BTreeSet<String>) {
        if let PhysicalStep::TableAccessFull { table }
        | PhysicalStep::TableAccessByRowId { table } = &self.step
        {
            tables.insert(table.clone());
        }
        for child in &self.children {
            child.collect_tables(tables);
        }
    }

    fn explain_into(&self, arena: &PredicateArena, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{}{}", "-".repeat(depth), self.step.describe(arena));
        for child in &self.children {
            child.explain_into(arena, depth + 1, out);
        }
    }
}

/// A planned query, ready to run against a journal.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    root: PhysicalNode,
    query: Arc<Query>,
    scope: BTreeSet<String>,
}

impl PhysicalPlan {
    /// Creates a plan.
    #[must_use]
    pub fn new(root: PhysicalNode, query: Arc<Query>, scope: BTreeSet<String>) -> Self {
        Self { root, query, scope }
    }

    /// Returns the root step.
    #[must_use]
    pub fn root(&self) -> &PhysicalNode {
        &self.root
    }

    /// Returns the planned query.
    #[must_use]
    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Returns the tables the plan may touch.
    #[must_use]
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Renders the step tree, one step per line, children indented.
    #[must_use]
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.root.explain_into(self.query.arena(), 0, &mut out);
        out
    }
}

/// Lowers logical plans into steps.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalPlanFactory;

impl PhysicalPlanFactory {
    /// Lowers `node`. Equi-joins use a hash join when `config` allows it.
    #[must_use]
    pub fn create(node: LogicalNode, query: &Query, config: &Config) -> PhysicalNode {
        let lower = |child: Box<LogicalNode>| Self::create(*child, query, config);
        match node {
            LogicalNode::TableAccess { table } => {
                PhysicalNode::leaf(PhysicalStep::TableAccessFull { table })
            }
            LogicalNode::Select {
                predicate,
                indexable,
                child,
            } => PhysicalNode::new(
                PhysicalStep::Select {
                    predicate,
                    index_candidate: indexable,
                },
                vec![lower(child)],
            ),
            LogicalNode::CrossProduct { left, right } => {
                PhysicalNode::new(PhysicalStep::CrossProduct, vec![lower(left), lower(right)])
            }
            LogicalNode::Join {
                predicate,
                outer,
                left,
                right,
            } => {
                let algorithm = if config.hash_joins && query.arena().equi_join(predicate).is_some()
                {
                    JoinAlgorithm::Hash
                } else {
                    JoinAlgorithm::NestedLoop
                };
                PhysicalNode::new(
                    PhysicalStep::Join {
                        predicate,
                        outer,
                        algorithm,
                    },
                    vec![lower(left), lower(right)],
                )
            }
            LogicalNode::Project { columns, child } => {
                PhysicalNode::new(PhysicalStep::Project { columns }, vec![lower(child)])
            }
            LogicalNode::GroupBy { columns, child } => {
                PhysicalNode::new(PhysicalStep::GroupBy { columns }, vec![lower(child)])
            }
            LogicalNode::Aggregation { aggregates, child } => {
                PhysicalNode::new(PhysicalStep::Aggregation { aggregates }, vec![lower(child)])
            }
            LogicalNode::OrderBy { keys, child } => {
                PhysicalNode::new(PhysicalStep::OrderBy { keys }, vec![lower(child)])
            }
            LogicalNode::Skip { count, child } => {
                PhysicalNode::new(PhysicalStep::Skip { count }, vec![lower(child)])
            }
            LogicalNode::Limit { count, child } => {
                PhysicalNode::new(PhysicalStep::Limit { count }, vec![lower(child)])
            }
            LogicalNode::Insert { table, or_replace } => PhysicalNode::leaf(if or_replace {
                PhysicalStep::InsertOrReplace { table }
            } else {
                PhysicalStep::Insert { table }
            }),
            LogicalNode::Update { table, child } => {
                PhysicalNode::new(PhysicalStep::Update { table }, vec![lower(child)])
            }
            LogicalNode::Delete { table, child } => {
                PhysicalNode::new(PhysicalStep::Delete { table }, vec![lower(child)])
            }
        }
    }
}
