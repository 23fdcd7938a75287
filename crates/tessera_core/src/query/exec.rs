//! Plan execution.
//!
//! Steps run children first, as declared by [`ExecType`], and read and write
//! only through the [`Journal`] of the running task.

use crate::error::CoreResult;
use crate::journal::Journal;
use crate::query::descriptor::{AggregateFn, Projection, Query};
use crate::query::physical::{ExecType, JoinAlgorithm, PhysicalNode, PhysicalStep};
use crate::query::predicate::{ColumnRef, PredicateArena, PredicateId};
use crate::query::relation::{Relation, RelationEntry};
use crate::row::Row;
use crate::types::{Order, RowId};
use crate::value::{Payload, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Output of one step.
#[derive(Debug)]
enum StepOutput {
    RowIds(Vec<RowId>),
    Relation(Relation),
    Groups(Vec<Relation>, BTreeSet<String>),
}

impl StepOutput {
    fn into_relation(self) -> Relation {
        match self {
            Self::Relation(relation) => relation,
            Self::Groups(groups, tables) => Relation::new(
                groups.into_iter().flat_map(Relation::into_entries).collect(),
                tables,
            ),
            Self::RowIds(_) => Relation::default(),
        }
    }
}

/// Runs physical steps against a journal.
pub(crate) struct Executor<'a> {
    journal: &'a mut Journal,
    query: &'a Query,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(journal: &'a mut Journal, query: &'a Query) -> Self {
        Self { journal, query }
    }

    /// Executes the tree rooted at `root`.
    pub(crate) fn run(&mut self, root: &PhysicalNode) -> CoreResult<Relation> {
        Ok(self.execute(root)?.into_relation())
    }

    fn arena(&self) -> &'a PredicateArena {
        self.query.arena()
    }

    fn execute(&mut self, node: &PhysicalNode) -> CoreResult<StepOutput> {
        let mut inputs = Vec::with_capacity(node.children.len());
        match node.step.exec_type() {
            ExecType::NoChild => {}
            ExecType::FirstChild => {
                if let Some(child) = node.children.first() {
                    inputs.push(self.execute(child)?);
                }
            }
            ExecType::AllChildren => {
                for child in &node.children {
                    inputs.push(self.execute(child)?);
                }
            }
        }
        self.step(&node.step, inputs)
    }

    fn step(&mut self, step: &PhysicalStep, inputs: Vec<StepOutput>) -> CoreResult<StepOutput> {
        let mut inputs = inputs.into_iter();
        let ctx = Arc::clone(self.journal.context());
        let stats = ctx.stats();

        let output = match step {
            PhysicalStep::TableAccessFull { table } => {
                stats.record_full_scan();
                Relation::from_rows(table, self.journal.get_table_rows(table)?)
            }
            PhysicalStep::IndexRangeScan {
                index,
                ranges,
                reverse,
                limit,
                skip,
                ..
            } => {
                stats.record_index_scan();
                let ids = self
                    .journal
                    .get_index_range(index, ranges, *reverse, *limit, *skip)?;
                return Ok(StepOutput::RowIds(ids));
            }
            PhysicalStep::TableAccessByRowId { table } => {
                let ids = match inputs.next() {
                    Some(StepOutput::RowIds(ids)) => ids,
                    Some(other) => other
                        .into_relation()
                        .rows(table)
                        .iter()
                        .map(|row| row.id())
                        .collect(),
                    None => Vec::new(),
                };
                Relation::from_rows(table, self.journal.get_rows(table, &ids)?)
            }
            PhysicalStep::Select { predicate, .. } => {
                select(self.arena(), *predicate, next_relation(&mut inputs))
            }
            PhysicalStep::CrossProduct => {
                let left = next_relation(&mut inputs);
                let right = next_relation(&mut inputs);
                cross_product(&left, &right)
            }
            PhysicalStep::Join {
                predicate,
                outer,
                algorithm,
            } => {
                let left = next_relation(&mut inputs);
                let right = next_relation(&mut inputs);
                match algorithm {
                    JoinAlgorithm::Hash => {
                        hash_join(self.arena(), *predicate, *outer, &left, &right)
                    }
                    JoinAlgorithm::NestedLoop => {
                        nested_loop_join(self.arena(), *predicate, *outer, &left, &right)
                    }
                }
            }
            PhysicalStep::Project { columns } => project(columns, next_relation(&mut inputs)),
            PhysicalStep::GroupBy { columns } => {
                let input = next_relation(&mut inputs);
                let tables = input.tables().clone();
                return Ok(StepOutput::Groups(group_by(columns, input), tables));
            }
            PhysicalStep::Aggregation { aggregates } => match inputs.next() {
                Some(StepOutput::Groups(groups, tables)) => {
                    let entries = groups
                        .iter()
                        .map(|group| aggregate_group(aggregates, group.entries()))
                        .collect();
                    Relation::new(entries, tables)
                }
                other => {
                    let input = other.map(StepOutput::into_relation).unwrap_or_default();
                    let entry = aggregate_group(aggregates, input.entries());
                    Relation::new(vec![entry], input.tables().clone())
                }
            },
            PhysicalStep::OrderBy { keys } => order_by(keys, next_relation(&mut inputs)),
            PhysicalStep::Skip { count } => {
                let input = next_relation(&mut inputs);
                let tables = input.tables().clone();
                Relation::new(input.into_entries().into_iter().skip(*count).collect(), tables)
            }
            PhysicalStep::Limit { count } => {
                let input = next_relation(&mut inputs);
                let tables = input.tables().clone();
                Relation::new(input.into_entries().into_iter().take(*count).collect(), tables)
            }
            PhysicalStep::Insert { table } | PhysicalStep::InsertOrReplace { table } => {
                let rows = self.insert_rows();
                if matches!(step, PhysicalStep::InsertOrReplace { .. }) {
                    self.journal.insert_or_replace(table, rows)?;
                } else {
                    self.journal.insert(table, rows)?;
                }
                Relation::empty(BTreeSet::from([table.clone()]))
            }
            PhysicalStep::Update { table } => {
                let assignments = match self.query {
                    Query::Update(update) => update.assignments(),
                    _ => &[],
                };
                let rows = next_relation(&mut inputs)
                    .rows(table)
                    .iter()
                    .map(|row| {
                        let mut row = Row::clone(row);
                        for (column, value) in assignments {
                            row.set(column.clone(), value.clone());
                        }
                        row
                    })
                    .collect();
                self.journal.update(table, rows)?;
                Relation::empty(BTreeSet::from([table.clone()]))
            }
            PhysicalStep::Delete { table } => {
                let ids = next_relation(&mut inputs)
                    .rows(table)
                    .iter()
                    .map(|row| row.id())
                    .collect();
                self.journal.remove(table, ids)?;
                Relation::empty(BTreeSet::from([table.clone()]))
            }
        };
        Ok(StepOutput::Relation(output))
    }

    /// Returns the rows of an insert query, with fresh ids for rows at id 0.
    fn insert_rows(&self) -> Vec<Row> {
        let Query::Insert(insert) = self.query else {
            return Vec::new();
        };
        let ctx = self.journal.context();
        insert
            .rows()
            .iter()
            .map(|row| {
                if row.id() == RowId(0) {
                    Row::new(ctx.allocate_row_id(), row.payload().clone())
                } else {
                    row.clone()
                }
            })
            .collect()
    }
}

fn next_relation(inputs: &mut impl Iterator<Item = StepOutput>) -> Relation {
    inputs.next().map(StepOutput::into_relation).unwrap_or_default()
}

fn select(arena: &PredicateArena, predicate: PredicateId, input: Relation) -> Relation {
    let tables = input.tables().clone();
    let entries = input
        .into_entries()
        .into_iter()
        .filter(|entry| arena.eval(predicate, entry))
        .collect();
    Relation::new(entries, tables)
}

fn union_tables(left: &Relation, right: &Relation) -> BTreeSet<String> {
    left.tables().union(right.tables()).cloned().collect()
}

fn cross_product(left: &Relation, right: &Relation) -> Relation {
    let entries = left
        .entries()
        .iter()
        .flat_map(|l| right.entries().iter().map(move |r| l.combine(r)))
        .collect();
    Relation::new(entries, union_tables(left, right))
}

fn nested_loop_join(
    arena: &PredicateArena,
    predicate: PredicateId,
    outer: bool,
    left: &Relation,
    right: &Relation,
) -> Relation {
    let mut entries = Vec::new();
    for l in left.entries() {
        let before = entries.len();
        for r in right.entries() {
            let combined = l.combine(r);
            if arena.eval(predicate, &combined) {
                entries.push(combined);
            }
        }
        if outer && entries.len() == before {
            entries.push(l.with_null_side(right.tables()));
        }
    }
    Relation::new(entries, union_tables(left, right))
}

/// Builds on `right` and probes with `left`, keeping left order.
fn hash_join(
    arena: &PredicateArena,
    predicate: PredicateId,
    outer: bool,
    left: &Relation,
    right: &Relation,
) -> Relation {
    let Some((a, b)) = arena.equi_join(predicate) else {
        return nested_loop_join(arena, predicate, outer, left, right);
    };
    let (probe_column, build_column): (&ColumnRef, &ColumnRef) =
        if left.tables().contains(&a.table) {
            (a, b)
        } else {
            (b, a)
        };

    let mut table: HashMap<&Value, Vec<&RelationEntry>> = HashMap::new();
    for r in right.entries() {
        let key = r.value(build_column);
        if !key.is_null() {
            table.entry(key).or_default().push(r);
        }
    }

    let mut entries = Vec::new();
    for l in left.entries() {
        let before = entries.len();
        let key = l.value(probe_column);
        if let Some(matches) = table.get(key).filter(|_| !key.is_null()) {
            entries.extend(
                matches
                    .iter()
                    .map(|r| l.combine(r))
                    .filter(|combined| arena.eval(predicate, combined)),
            );
        }
        if outer && entries.len() == before {
            entries.push(l.with_null_side(right.tables()));
        }
    }
    Relation::new(entries, union_tables(left, right))
}

fn project(columns: &[Projection], input: Relation) -> Relation {
    let mut per_table: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut labels = Vec::new();
    for projection in columns {
        match projection {
            Projection::Column(column) => per_table
                .entry(column.table.as_str())
                .or_default()
                .push(column.name.as_str()),
            Projection::Aggregate(func, column) => labels.push(func.label(column)),
        }
    }

    let entries = input
        .entries()
        .iter()
        .map(|entry| {
            let mut projected = RelationEntry::default();
            let rows = entry
                .rows()
                .iter()
                .filter_map(|(table, row)| {
                    let names = per_table.get(table.as_str())?;
                    let row = row.as_ref().map(|row| {
                        let payload: Payload = names
                            .iter()
                            .map(|name| (name.to_string(), row.get(name).clone()))
                            .collect();
                        Arc::new(row.with_payload(payload))
                    });
                    Some((table.clone(), row))
                })
                .collect();
            projected.set_rows(rows);
            for label in &labels {
                if let Some(value) = entry.derived(label) {
                    projected.set_derived(label.clone(), value.clone());
                }
            }
            projected
        })
        .collect();
    let tables = per_table.keys().map(|t| t.to_string()).collect();
    Relation::new(entries, tables)
}

fn group_by(columns: &[ColumnRef], input: Relation) -> Vec<Relation> {
    let tables = input.tables().clone();
    let mut positions: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<Vec<RelationEntry>> = Vec::new();
    for entry in input.into_entries() {
        let key: Vec<Value> = columns.iter().map(|c| entry.value(c).clone()).collect();
        let position = *positions.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[position].push(entry);
    }
    groups
        .into_iter()
        .map(|entries| Relation::new(entries, tables.clone()))
        .collect()
}

fn aggregate_group(
    aggregates: &[(AggregateFn, ColumnRef)],
    entries: &[RelationEntry],
) -> RelationEntry {
    let mut out = entries.first().cloned().unwrap_or_default();
    for (func, column) in aggregates {
        out.set_derived(func.label(column), aggregate(*func, column, entries));
    }
    out
}

/// Computes one aggregate. Nulls are ignored; an empty input counts 0 and
/// yields null for every other function.
pub(crate) fn aggregate(func: AggregateFn, column: &ColumnRef, entries: &[RelationEntry]) -> Value {
    let values = entries
        .iter()
        .map(|entry| entry.value(column))
        .filter(|value| !value.is_null());
    match func {
        AggregateFn::Count => Value::Integer(values.count() as i64),
        AggregateFn::Sum => {
            let mut exact: Option<i64> = Some(0);
            let mut total = 0.0;
            let mut integers_only = true;
            let mut seen = false;
            for value in values {
                match value {
                    Value::Integer(v) => exact = exact.and_then(|sum| sum.checked_add(*v)),
                    Value::Number(_) => integers_only = false,
                    _ => continue,
                }
                total += value.as_f64().unwrap_or_default();
                seen = true;
            }
            match (seen, integers_only, exact) {
                (false, _, _) => Value::Null,
                (true, true, Some(sum)) => Value::Integer(sum),
                _ => Value::Number(total),
            }
        }
        AggregateFn::Avg => {
            let numbers: Vec<f64> = values.filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFn::Min => values.min().cloned().unwrap_or(Value::Null),
        AggregateFn::Max => values.max().cloned().unwrap_or(Value::Null),
    }
}

/// Compares two sort values: nulls first whatever the direction.
pub(crate) fn compare_sort_values(a: &Value, b: &Value, order: Order) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => order.apply(a.cmp(b)),
    }
}

fn order_by(keys: &[(Projection, Order)], input: Relation) -> Relation {
    let tables = input.tables().clone();
    let mut entries = input.into_entries();
    entries.sort_by(|a, b| {
        keys.iter()
            .map(|(key, order)| compare_sort_values(key.eval(a), key.eval(b), *order))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Relation::new(entries, tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use crate::query::predicate::col;

    fn entries(values: &[Option<i64>]) -> Vec<RelationEntry> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let row = Row::new(RowId(i as u64 + 1), payload! { "v" => *v });
                RelationEntry::from_row("T", Arc::new(row))
            })
            .collect()
    }

    #[test]
    fn aggregates_skip_nulls() {
        let column = col("T", "v");
        let input = entries(&[Some(4), None, Some(1), Some(7)]);

        assert_eq!(aggregate(AggregateFn::Count, &column, &input), Value::Integer(3));
        assert_eq!(aggregate(AggregateFn::Sum, &column, &input), Value::Integer(12));
        assert_eq!(aggregate(AggregateFn::Avg, &column, &input), Value::Number(4.0));
        assert_eq!(aggregate(AggregateFn::Min, &column, &input), Value::Integer(1));
        assert_eq!(aggregate(AggregateFn::Max, &column, &input), Value::Integer(7));

        assert_eq!(aggregate(AggregateFn::Count, &column, &[]), Value::Integer(0));
        assert!(aggregate(AggregateFn::Sum, &column, &[]).is_null());
        assert!(aggregate(AggregateFn::Max, &column, &entries(&[None])).is_null());
    }

    #[test]
    fn mixed_sum_widens() {
        let mut input = entries(&[Some(1)]);
        let row = Row::new(RowId(9), payload! { "v" => 0.5 });
        input.push(RelationEntry::from_row("T", Arc::new(row)));
        assert_eq!(aggregate(AggregateFn::Sum, &col("T", "v"), &input), Value::Number(1.5));
    }

    #[test]
    fn sort_puts_nulls_first_both_ways() {
        let relation = Relation::new(entries(&[Some(2), None, Some(5)]), BTreeSet::new());
        let key = Projection::Column(col("T", "v"));
        for order in [Order::Asc, Order::Desc] {
            let sorted = order_by(&[(key.clone(), order)], relation.clone());
            let values = sorted.values(&col("T", "v"));
            assert!(values[0].is_null());
            let expected = if order == Order::Asc { [2, 5] } else { [5, 2] };
            assert_eq!(values[1..], expected.map(Value::Integer));
        }
    }

    #[test]
    fn joins_agree_and_keep_outer_rows() {
        let left = Relation::new(entries(&[Some(1), Some(2), None]), BTreeSet::from(["T".into()]));
        let right = Relation::new(
            vec![
                RelationEntry::from_row("U", Arc::new(Row::new(RowId(10), payload! { "k" => 2 }))),
                RelationEntry::from_row("U", Arc::new(Row::new(RowId(11), payload! { "k" => 2 }))),
            ],
            BTreeSet::from(["U".into()]),
        );
        let mut arena = PredicateArena::new();
        let on = arena.lower(col("U", "k").eq_col(&col("T", "v")));

        let hashed = hash_join(&arena, on, true, &left, &right);
        let looped = nested_loop_join(&arena, on, true, &left, &right);
        assert_eq!(hashed, looped);
        assert_eq!(hashed.len(), 4);
        assert!(hashed.entries()[0].row("U").is_none());
        assert_eq!(hashed.entries()[1].row("U").unwrap().id(), RowId(10));

        let inner = hash_join(&arena, on, false, &left, &right);
        assert_eq!(inner.len(), 2);
    }
}
