//! Query descriptors.
//!
//! Queries are built programmatically:
//!
//! ```rust
//! use tessera_core::query::{col, AggregateFn, SelectQuery};
//! use tessera_core::Order;
//!
//! let query = SelectQuery::new()
//!     .column(col("Project", "name"))
//!     .aggregate(AggregateFn::Count, col("Task", "id"))
//!     .from("Project")
//!     .inner_join("Task", col("Task", "project").eq_col(&col("Project", "id")))
//!     .group_by(col("Project", "name"))
//!     .order_by(col("Project", "name"), Order::Asc);
//!
//! assert_eq!(query.tables(), vec!["Project", "Task"]);
//! ```

use crate::error::{
    CoreError, CoreResult, AGGREGATE_MISMATCH, EMPTY_INSERT, FOREIGN_COLUMN, NO_SOURCE,
};
use crate::query::predicate::{ColumnRef, Predicate, PredicateArena, PredicateId};
use crate::query::relation::RelationEntry;
use crate::row::Row;
use crate::schema::Schema;
use crate::types::{Order, RowId, TransactionKind};
use crate::value::{Payload, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    /// Number of non-null values.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Avg,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
}

impl AggregateFn {
    /// Returns the function name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// Returns the label of the derived value, e.g. `COUNT(Task.id)`.
    #[must_use]
    pub fn label(self, column: &ColumnRef) -> String {
        format!("{}({column})", self.as_str())
    }
}

/// A projected column or aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// A plain column.
    Column(ColumnRef),
    /// An aggregate over a column.
    Aggregate(AggregateFn, ColumnRef),
}

static NULL: Value = Value::Null;

impl Projection {
    /// Returns the column the projection reads.
    #[must_use]
    pub fn column(&self) -> &ColumnRef {
        match self {
            Self::Column(column) | Self::Aggregate(_, column) => column,
        }
    }

    /// Returns true for aggregates.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate(..))
    }

    /// Reads the projected value out of an entry.
    #[must_use]
    pub fn eval<'a>(&self, entry: &'a RelationEntry) -> &'a Value {
        match self {
            Self::Column(column) => entry.value(column),
            Self::Aggregate(func, column) => entry.derived(&func.label(column)).unwrap_or(&NULL),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(column) => write!(f, "{column}"),
            Self::Aggregate(func, column) => f.write_str(&func.label(column)),
        }
    }
}

/// A read query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub(crate) projections: Vec<Projection>,
    pub(crate) from: Vec<String>,
    pub(crate) outer_joins: Vec<(String, PredicateId)>,
    pub(crate) predicate: Option<PredicateId>,
    pub(crate) group_by: Vec<ColumnRef>,
    pub(crate) order_by: Vec<(Projection, Order)>,
    pub(crate) limit: Option<usize>,
    pub(crate) skip: Option<usize>,
    pub(crate) arena: PredicateArena,
}

impl SelectQuery {
    /// Starts a query that projects every column.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Projects `column`.
    #[must_use]
    pub fn column(mut self, column: ColumnRef) -> Self {
        self.projections.push(Projection::Column(column));
        self
    }

    /// Projects every column in `columns`.
    #[must_use]
    pub fn columns(mut self, columns: impl IntoIterator<Item = ColumnRef>) -> Self {
        self.projections
            .extend(columns.into_iter().map(Projection::Column));
        self
    }

    /// Projects an aggregate.
    #[must_use]
    pub fn aggregate(mut self, func: AggregateFn, column: ColumnRef) -> Self {
        self.projections.push(Projection::Aggregate(func, column));
        self
    }

    /// Adds a source table. Several sources form a cross product.
    #[must_use]
    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.from.push(table.into());
        self
    }

    /// Adds `table` as a source and `on` to the where clause.
    #[must_use]
    pub fn inner_join(self, table: impl Into<String>, on: Predicate) -> Self {
        self.from(table).filter(on)
    }

    /// Left outer joins `table` on `on`.
    #[must_use]
    pub fn left_outer_join(mut self, table: impl Into<String>, on: Predicate) -> Self {
        let id = self.arena.lower(on);
        self.outer_joins.push((table.into(), id));
        self
    }

    /// Adds `predicate` to the where clause with AND.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(and_into(&mut self.arena, self.predicate, predicate));
        self
    }

    /// Groups by `column`.
    #[must_use]
    pub fn group_by(mut self, column: ColumnRef) -> Self {
        self.group_by.push(column);
        self
    }

    /// Sorts by `column`.
    #[must_use]
    pub fn order_by(mut self, column: ColumnRef, order: Order) -> Self {
        self.order_by.push((Projection::Column(column), order));
        self
    }

    /// Sorts by an aggregate that is also projected.
    #[must_use]
    pub fn order_by_aggregate(
        mut self,
        func: AggregateFn,
        column: ColumnRef,
        order: Order,
    ) -> Self {
        self.order_by
            .push((Projection::Aggregate(func, column), order));
        self
    }

    /// Returns at most `count` entries.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Skips the first `count` entries.
    #[must_use]
    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    /// Returns every table read, sources first.
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        self.from
            .iter()
            .chain(self.outer_joins.iter().map(|(table, _)| table))
            .map(String::as_str)
            .collect()
    }

    /// Returns the where clause.
    #[must_use]
    pub fn predicate(&self) -> Option<PredicateId> {
        self.predicate
    }

    /// Returns the projections; empty means every column.
    #[must_use]
    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub(crate) fn aggregates(&self) -> Vec<(AggregateFn, ColumnRef)> {
        let mut aggregates = Vec::new();
        for projection in self.projections.iter().chain(self.order_by.iter().map(|(p, _)| p)) {
            if let Projection::Aggregate(func, column) = projection {
                if !aggregates.contains(&(*func, column.clone())) {
                    aggregates.push((*func, column.clone()));
                }
            }
        }
        aggregates
    }
}

/// An insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertQuery {
    pub(crate) table: String,
    pub(crate) rows: Vec<Row>,
    pub(crate) or_replace: bool,
    pub(crate) arena: PredicateArena,
}

impl InsertQuery {
    /// Starts an insert into `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Adds rows. Rows with id 0 get a fresh id when the insert runs.
    #[must_use]
    pub fn values(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Adds rows built from payloads.
    #[must_use]
    pub fn payloads(self, payloads: impl IntoIterator<Item = Payload>) -> Self {
        self.values(payloads.into_iter().map(|p| Row::new(RowId(0), p)))
    }

    /// Adds one row built from a payload.
    #[must_use]
    pub fn value(self, payload: Payload) -> Self {
        self.payloads([payload])
    }

    /// Replaces live rows with the same primary key instead of failing.
    #[must_use]
    pub fn or_replace(mut self) -> Self {
        self.or_replace = true;
        self
    }

    /// Returns the target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the rows to insert.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// An update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateQuery {
    pub(crate) table: String,
    pub(crate) assignments: Vec<(String, Value)>,
    pub(crate) predicate: Option<PredicateId>,
    pub(crate) arena: PredicateArena,
}

impl UpdateQuery {
    /// Starts an update of `table`. Without a filter every row is updated.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Sets `column` to `value`.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }

    /// Adds `predicate` to the where clause with AND.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(and_into(&mut self.arena, self.predicate, predicate));
        self
    }

    /// Returns the column assignments.
    #[must_use]
    pub fn assignments(&self) -> &[(String, Value)] {
        &self.assignments
    }
}

/// A delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteQuery {
    pub(crate) table: String,
    pub(crate) predicate: Option<PredicateId>,
    pub(crate) arena: PredicateArena,
}

impl DeleteQuery {
    /// Starts a delete from `table`. Without a filter every row is deleted.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Adds `predicate` to the where clause with AND.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(and_into(&mut self.arena, self.predicate, predicate));
        self
    }
}

fn and_into(
    arena: &mut PredicateArena,
    existing: Option<PredicateId>,
    predicate: Predicate,
) -> PredicateId {
    let id = arena.lower(predicate);
    match existing {
        Some(existing) => arena.conjoin(vec![existing, id]),
        None => id,
    }
}

/// Any query the engine can plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Read.
    Select(SelectQuery),
    /// Insert, optionally replacing.
    Insert(InsertQuery),
    /// Update.
    Update(UpdateQuery),
    /// Delete.
    Delete(DeleteQuery),
}

impl From<SelectQuery> for Query {
    fn from(query: SelectQuery) -> Self {
        Self::Select(query)
    }
}

impl From<InsertQuery> for Query {
    fn from(query: InsertQuery) -> Self {
        Self::Insert(query)
    }
}

impl From<UpdateQuery> for Query {
    fn from(query: UpdateQuery) -> Self {
        Self::Update(query)
    }
}

impl From<DeleteQuery> for Query {
    fn from(query: DeleteQuery) -> Self {
        Self::Delete(query)
    }
}

impl Query {
    /// Returns the arena owning the query's predicates.
    #[must_use]
    pub fn arena(&self) -> &PredicateArena {
        match self {
            Self::Select(q) => &q.arena,
            Self::Insert(q) => &q.arena,
            Self::Update(q) => &q.arena,
            Self::Delete(q) => &q.arena,
        }
    }

    /// Returns the transaction kind needed to run the query.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        match self {
            Self::Select(_) => TransactionKind::ReadOnly,
            _ => TransactionKind::ReadWrite,
        }
    }

    /// Returns the tables the query may touch.
    ///
    /// Writes extend the scope so constraint checks stay inside it:
    /// - inserts add the parent tables of the target
    /// - deletes add every table that transitively references the target
    /// - updates and replacing inserts add those tables and their parents
    ///
    /// # Errors
    ///
    /// Returns a not-found error (101) for unknown tables.
    pub fn scope(&self, schema: &Schema) -> CoreResult<BTreeSet<String>> {
        let mut scope = BTreeSet::new();
        match self {
            Self::Select(q) => {
                for table in q.tables() {
                    schema.table(table)?;
                    scope.insert(table.to_string());
                }
            }
            Self::Insert(q) if !q.or_replace => {
                schema.table(&q.table)?;
                scope.insert(q.table.clone());
                scope.extend(schema.parent_tables(&q.table));
            }
            Self::Insert(InsertQuery { table, .. }) | Self::Update(UpdateQuery { table, .. }) => {
                schema.table(table)?;
                for descendant in schema.descendant_tables(table) {
                    scope.extend(schema.parent_tables(&descendant));
                    scope.insert(descendant);
                }
            }
            Self::Delete(q) => {
                schema.table(&q.table)?;
                scope.extend(schema.descendant_tables(&q.table));
            }
        }
        Ok(scope)
    }

    /// Checks the query against `schema`.
    ///
    /// # Errors
    ///
    /// - 501 for a select without source table
    /// - 101 for unknown tables and 103 for unknown columns
    /// - 502 for columns of tables the query does not read
    /// - 505 for plain columns mixed with aggregates outside the grouping
    /// - 506 for an insert without rows
    pub fn validate(&self, schema: &Schema) -> CoreResult<()> {
        match self {
            Self::Select(q) => validate_select(schema, q),
            Self::Insert(q) => {
                let table = schema.table(&q.table)?;
                if q.rows.is_empty() {
                    return Err(CoreError::validation(EMPTY_INSERT, [&q.table]));
                }
                for row in &q.rows {
                    if let Some(column) = row.payload().keys().find(|c| !table.has_column(c)) {
                        return Err(CoreError::column_not_found(&q.table, column));
                    }
                }
                Ok(())
            }
            Self::Update(q) => {
                let table = schema.table(&q.table)?;
                for (column, _) in &q.assignments {
                    if !table.has_column(column) {
                        return Err(CoreError::column_not_found(&q.table, column));
                    }
                }
                let readable = BTreeSet::from([q.table.clone()]);
                validate_predicate(schema, &readable, &q.arena, q.predicate)
            }
            Self::Delete(q) => {
                schema.table(&q.table)?;
                let readable = BTreeSet::from([q.table.clone()]);
                validate_predicate(schema, &readable, &q.arena, q.predicate)
            }
        }
    }
}

fn validate_select(schema: &Schema, q: &SelectQuery) -> CoreResult<()> {
    if q.from.is_empty() {
        return Err(CoreError::validation(NO_SOURCE, ["select"]));
    }
    let mut readable = BTreeSet::new();
    for table in q.tables() {
        schema.table(table)?;
        readable.insert(table.to_string());
    }

    let projected = q.projections.iter().map(Projection::column);
    let ordered = q.order_by.iter().map(|(p, _)| p.column());
    for column in projected.chain(ordered).chain(q.group_by.iter()) {
        validate_column(schema, &readable, column)?;
    }
    validate_predicate(schema, &readable, &q.arena, q.predicate)?;
    for (_, on) in &q.outer_joins {
        validate_predicate(schema, &readable, &q.arena, Some(*on))?;
    }

    let aggregated = q.projections.iter().any(Projection::is_aggregate);
    if aggregated || !q.group_by.is_empty() {
        let ungrouped = q
            .projections
            .iter()
            .chain(q.order_by.iter().map(|(p, _)| p))
            .find(|p| matches!(p, Projection::Column(c) if !q.group_by.contains(c)));
        if let Some(projection) = ungrouped {
            return Err(CoreError::validation(
                AGGREGATE_MISMATCH,
                [projection.to_string()],
            ));
        }
    }
    if let Some((projection, _)) = q
        .order_by
        .iter()
        .find(|(p, _)| p.is_aggregate() && !q.projections.contains(p))
    {
        return Err(CoreError::validation(
            AGGREGATE_MISMATCH,
            [projection.to_string()],
        ));
    }
    Ok(())
}

fn validate_predicate(
    schema: &Schema,
    readable: &BTreeSet<String>,
    arena: &PredicateArena,
    predicate: Option<PredicateId>,
) -> CoreResult<()> {
    let Some(id) = predicate else {
        return Ok(());
    };
    for column in arena.columns(id) {
        validate_column(schema, readable, column)?;
    }
    Ok(())
}

fn validate_column(
    schema: &Schema,
    readable: &BTreeSet<String>,
    column: &ColumnRef,
) -> CoreResult<()> {
    if !readable.contains(&column.table) {
        return Err(CoreError::validation(FOREIGN_COLUMN, [column.to_string()]));
    }
    if !schema.table(&column.table)?.has_column(&column.name) {
        return Err(CoreError::column_not_found(&column.table, &column.name));
    }
    Ok(())
}
