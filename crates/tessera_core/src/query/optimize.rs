//! Physical plan rewriting.
//!
//! Passes run in order:
//! 1. [`IndexRangeScanPass`] swaps a filtered full scan for an index scan
//! 2. [`OrderByIndexPass`] drops sorts an index scan already satisfies
//! 3. [`LimitSkipPushdownPass`] folds paging into an index scan
//! 4. [`JoinReorderPass`] puts the smaller input of inner joins on the left

use crate::config::Config;
use crate::index::{Index, IndexStats, IndexStore, KeyRange};
use crate::query::descriptor::Projection;
use crate::query::physical::{PhysicalNode, PhysicalStep};
use crate::query::predicate::PredicateArena;
use crate::schema::Schema;
use crate::types::Order;
use tracing::trace;

/// Inputs shared by every physical pass.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalContext<'a> {
    /// Database schema.
    pub schema: &'a Schema,
    /// Predicates of the query being planned.
    pub arena: &'a PredicateArena,
    /// Committed indices, read for costs and statistics.
    pub indices: &'a IndexStore,
    /// Database configuration.
    pub config: &'a Config,
}

/// A physical rewrite.
pub trait PhysicalPass: Send + Sync {
    /// Returns the pass name used in logs.
    fn name(&self) -> &'static str;

    /// Rewrites `node`.
    fn rewrite(&self, node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode;
}

/// Runs physical passes in order.
pub struct PhysicalPlanRewriter {
    passes: Vec<Box<dyn PhysicalPass>>,
}

impl std::fmt::Debug for PhysicalPlanRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.passes.iter().map(|p| p.name()).collect();
        f.debug_struct("PhysicalPlanRewriter")
            .field("passes", &names)
            .finish()
    }
}

impl Default for PhysicalPlanRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalPlanRewriter {
    /// Creates a rewriter with the default passes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_passes(vec![
            Box::new(IndexRangeScanPass),
            Box::new(OrderByIndexPass),
            Box::new(LimitSkipPushdownPass),
            Box::new(JoinReorderPass),
        ])
    }

    /// Creates a rewriter with custom passes.
    #[must_use]
    pub fn with_passes(passes: Vec<Box<dyn PhysicalPass>>) -> Self {
        Self { passes }
    }

    /// Applies every pass to `node`.
    #[must_use]
    pub fn rewrite(&self, mut node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        for pass in &self.passes {
            node = pass.rewrite(node, ctx);
            trace!(pass = pass.name(), "physical pass applied");
        }
        node
    }
}

fn map_children<F>(mut node: PhysicalNode, f: &mut F) -> PhysicalNode
where
    F: FnMut(PhysicalNode) -> PhysicalNode,
{
    node.children = std::mem::take(&mut node.children)
        .into_iter()
        .map(|child| f(child))
        .collect();
    node
}

fn index_scan(table: &str, index: &str, ranges: Vec<KeyRange>, reverse: bool) -> PhysicalNode {
    PhysicalNode::new(
        PhysicalStep::TableAccessByRowId {
            table: table.to_string(),
        },
        vec![PhysicalNode::leaf(PhysicalStep::IndexRangeScan {
            table: table.to_string(),
            index: index.to_string(),
            ranges,
            reverse,
            limit: None,
            skip: 0,
        })],
    )
}

/// Replaces the cheapest index-answerable select of a
/// `select* -> table_access` chain with an index range scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexRangeScanPass;

impl IndexRangeScanPass {
    fn chain_table(node: &PhysicalNode) -> Option<&str> {
        match &node.step {
            PhysicalStep::TableAccessFull { table } => Some(table),
            PhysicalStep::Select { .. } => node.children.first().and_then(Self::chain_table),
            _ => None,
        }
    }

    fn rewrite_chain(node: PhysicalNode, table: &str, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        let mut selects = Vec::new();
        let mut cursor = node;
        while let PhysicalStep::Select { .. } = cursor.step {
            let mut children = std::mem::take(&mut cursor.children);
            let Some(child) = children.pop() else { break };
            selects.push(cursor.step);
            cursor = child;
        }

        let Ok(schema) = ctx.schema.table(table) else {
            return rebuild(selects, cursor);
        };
        let mut best: Option<(usize, usize, String, Vec<KeyRange>)> = None;
        for (position, step) in selects.iter().enumerate() {
            let PhysicalStep::Select {
                predicate,
                index_candidate: true,
            } = step
            else {
                continue;
            };
            let Some((column, ranges)) = ctx.arena.key_ranges(*predicate) else {
                continue;
            };
            for spec in schema.all_indices() {
                if spec.leading_column() != Some(column.name.as_str()) {
                    continue;
                }
                let Some(index) = ctx.indices.get(spec.name()) else {
                    continue;
                };
                let cost = index.cost(&ranges);
                if best.as_ref().map_or(true, |(_, c, _, _)| cost < *c) {
                    best = Some((position, cost, spec.name().to_string(), ranges.clone()));
                }
            }
        }

        let Some((position, cost, index, ranges)) = best else {
            return rebuild(selects, cursor);
        };
        trace!(table, index = %index, cost, "index range scan chosen");
        selects.remove(position);
        rebuild(selects, index_scan(table, &index, ranges, false))
    }
}

fn rebuild(selects: Vec<PhysicalStep>, bottom: PhysicalNode) -> PhysicalNode {
    selects
        .into_iter()
        .rev()
        .fold(bottom, |child, step| PhysicalNode::new(step, vec![child]))
}

impl PhysicalPass for IndexRangeScanPass {
    fn name(&self) -> &'static str {
        "index_range_scan"
    }

    fn rewrite(&self, node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        if !ctx.config.index_scans {
            return node;
        }
        if matches!(node.step, PhysicalStep::Select { .. }) {
            if let Some(table) = Self::chain_table(&node).map(str::to_string) {
                return Self::rewrite_chain(node, &table, ctx);
            }
        }
        map_children(node, &mut |child| self.rewrite(child, ctx))
    }
}

/// Removes an order-by whose keys match the order of the index scan below
/// it, reversing the scan when every direction is flipped.
///
/// A full scan below the sort is turned into a scan of the whole index.
/// Indices over nullable columns are never reversed since their nulls sort
/// first in both directions.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderByIndexPass;

impl OrderByIndexPass {
    /// Returns `Some(reverse)` if `index` yields `keys` order on `table`.
    fn matches(
        keys: &[(Projection, Order)],
        table: &str,
        spec_columns: &[crate::schema::IndexColumn],
        index: &dyn Index,
    ) -> Option<bool> {
        if keys.is_empty() || keys.len() > spec_columns.len() {
            return None;
        }
        let mut same = true;
        let mut flipped = true;
        for ((projection, order), column) in keys.iter().zip(spec_columns) {
            let Projection::Column(key) = projection else {
                return None;
            };
            if key.table != table || key.name != column.name {
                return None;
            }
            same &= *order == column.order;
            flipped &= *order != column.order;
        }
        if same {
            Some(false)
        } else if flipped && !index.comparator().is_null_aware() {
            Some(true)
        } else {
            None
        }
    }

    fn try_remove(
        keys: &[(Projection, Order)],
        mut node: PhysicalNode,
        ctx: &PhysicalContext<'_>,
    ) -> Result<PhysicalNode, PhysicalNode> {
        match &mut node.step {
            PhysicalStep::Select { .. } => {
                let Some(child) = node.children.pop() else {
                    return Err(node);
                };
                match Self::try_remove(keys, child, ctx) {
                    Ok(child) => {
                        node.children.push(child);
                        Ok(node)
                    }
                    Err(child) => {
                        node.children.push(child);
                        Err(node)
                    }
                }
            }
            PhysicalStep::TableAccessFull { table } => {
                let table = table.clone();
                let Ok(schema) = ctx.schema.table(&table) else {
                    return Err(node);
                };
                for spec in schema.all_indices() {
                    let Some(index) = ctx.indices.get(spec.name()) else {
                        continue;
                    };
                    if let Some(reverse) = Self::matches(keys, &table, spec.columns(), index) {
                        return Ok(index_scan(&table, spec.name(), vec![KeyRange::all()], reverse));
                    }
                }
                Err(node)
            }
            PhysicalStep::TableAccessByRowId { table } => {
                let table = table.clone();
                let Some(PhysicalStep::IndexRangeScan {
                    index,
                    reverse: current @ false,
                    limit: None,
                    skip: 0,
                    ..
                }) = node.children.first_mut().map(|scan| &mut scan.step)
                else {
                    return Err(node);
                };
                let spec = ctx
                    .schema
                    .table(&table)
                    .ok()
                    .and_then(|t| t.all_indices().find(|s| s.name() == index.as_str()));
                let found = spec.zip(ctx.indices.get(index.as_str()));
                let Some((spec, shared)) = found else {
                    return Err(node);
                };
                match Self::matches(keys, &table, spec.columns(), shared) {
                    Some(reverse) => {
                        *current = reverse;
                        Ok(node)
                    }
                    None => Err(node),
                }
            }
            _ => Err(node),
        }
    }
}

impl PhysicalPass for OrderByIndexPass {
    fn name(&self) -> &'static str {
        "order_by_index"
    }

    fn rewrite(&self, node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        if !ctx.config.index_scans {
            return node;
        }
        let mut node = map_children(node, &mut |child| self.rewrite(child, ctx));
        let PhysicalStep::OrderBy { keys } = &node.step else {
            return node;
        };
        let keys = keys.clone();
        let Some(child) = node.children.pop() else {
            return node;
        };
        match Self::try_remove(&keys, child, ctx) {
            Ok(child) => {
                trace!("sort satisfied by index order");
                child
            }
            Err(child) => {
                node.children.push(child);
                node
            }
        }
    }
}

/// Folds `limit`/`skip` directly above an index scan into the scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct LimitSkipPushdownPass;

impl LimitSkipPushdownPass {
    /// Returns the paging fields of a `table_access_by_row_id -> index_range_scan`
    /// pair that has no limit yet.
    fn scan_mut(node: &mut PhysicalNode) -> Option<(&mut Option<usize>, &mut usize)> {
        if !matches!(node.step, PhysicalStep::TableAccessByRowId { .. }) {
            return None;
        }
        match node.children.first_mut().map(|scan| &mut scan.step) {
            Some(PhysicalStep::IndexRangeScan {
                limit: limit @ None,
                skip,
                ..
            }) => Some((limit, skip)),
            _ => None,
        }
    }
}

impl PhysicalPass for LimitSkipPushdownPass {
    fn name(&self) -> &'static str {
        "limit_skip_pushdown"
    }

    fn rewrite(&self, node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        let mut node = map_children(node, &mut |child| self.rewrite(child, ctx));
        if !matches!(
            node.step,
            PhysicalStep::Limit { .. } | PhysicalStep::Skip { .. }
        ) {
            return node;
        }
        let Some(mut child) = node.children.pop() else {
            return node;
        };
        let Some((scan_limit, scan_skip)) = Self::scan_mut(&mut child) else {
            node.children.push(child);
            return node;
        };
        match node.step {
            PhysicalStep::Limit { count } => *scan_limit = Some(count),
            PhysicalStep::Skip { count } => *scan_skip += count,
            _ => {}
        }
        child
    }
}

/// Puts the input with fewer rows on the left of inner joins.
#[derive(Debug, Default, Clone, Copy)]
pub struct JoinReorderPass;

impl JoinReorderPass {
    fn estimate(node: &PhysicalNode, ctx: &PhysicalContext<'_>) -> usize {
        let stats: Vec<&IndexStats> = node
            .tables()
            .iter()
            .filter_map(|table| ctx.schema.table(table).ok())
            .filter_map(|table| ctx.indices.get(&table.row_id_index_name()))
            .map(|index| index.stats())
            .collect();
        let mut combined = IndexStats::new();
        combined.update_from_list(&stats);
        combined.total_rows
    }
}

impl PhysicalPass for JoinReorderPass {
    fn name(&self) -> &'static str {
        "join_reorder"
    }

    fn rewrite(&self, node: PhysicalNode, ctx: &PhysicalContext<'_>) -> PhysicalNode {
        let mut node = map_children(node, &mut |child| self.rewrite(child, ctx));
        if let PhysicalStep::Join { outer: false, .. } = node.step {
            if let [left, right] = node.children.as_slice() {
                let (l, r) = (Self::estimate(left, ctx), Self::estimate(right, ctx));
                if l > r {
                    trace!(left = l, right = r, "join inputs swapped");
                    node.children.swap(0, 1);
                }
            }
        }
        node
    }
}
