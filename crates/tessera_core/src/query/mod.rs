//! Query processing.
//!
//! A query goes through these stages:
//! - a [`Query`] description is validated against the schema
//! - [`LogicalPlanFactory`] builds a relational tree, rewritten by the
//!   [`LogicalPlanRewriter`] passes
//! - [`PhysicalPlanFactory`] maps it to executable steps, rewritten by the
//!   [`PhysicalPlanRewriter`] passes
//! - the [`QueryEngine`] runs the resulting [`PhysicalPlan`] on a journal and
//!   returns a [`Relation`]

mod descriptor;
mod engine;
mod exec;
mod logical;
mod optimize;
mod physical;
mod predicate;
mod relation;
mod rewrite;

pub use descriptor::{
    AggregateFn, DeleteQuery, InsertQuery, Projection, Query, SelectQuery, UpdateQuery,
};
pub use engine::QueryEngine;
pub use logical::{LogicalNode, LogicalPlanFactory};
pub use optimize::{
    IndexRangeScanPass, JoinReorderPass, LimitSkipPushdownPass, OrderByIndexPass,
    PhysicalContext, PhysicalPass, PhysicalPlanRewriter,
};
pub use physical::{
    ExecType, JoinAlgorithm, PhysicalNode, PhysicalPlan, PhysicalPlanFactory, PhysicalStep,
};
pub use predicate::{
    col, ColumnRef, Combinator, JoinOp, Predicate, PredicateArena, PredicateId, PredicateNode,
    ValueOp,
};
pub use relation::{Relation, RelationEntry};
pub use rewrite::{
    AndSplit, ImplicitJoins, IndexCandidates, LogicalPlanRewriter, PushdownSelects, RewriteContext,
    RewritePass,
};
