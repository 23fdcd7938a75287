//! Row-id index.

use crate::error::CoreResult;
use crate::index::key::{Comparator, Key, KeyRange};
use crate::index::stats::IndexStats;
use crate::index::traits::{page, Index, IndexKind};
use crate::types::{Order, RowId};
use crate::value::Value;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Identity index over the live row ids of one table.
///
/// Keys are the row ids themselves, as [`Value::Integer`].
#[derive(Debug, Clone)]
pub struct RowIdIndex {
    name: String,
    comparator: Comparator,
    ids: BTreeSet<RowId>,
    stats: IndexStats,
}

impl RowIdIndex {
    /// Creates an empty row-id index.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comparator: Comparator::Single(Order::Asc),
            ids: BTreeSet::new(),
            stats: IndexStats::new(),
        }
    }

    fn key_id(key: &Key) -> Option<RowId> {
        match key.leading() {
            Some(Value::Integer(v)) if *v >= 0 => Some(RowId(*v as u64)),
            _ => None,
        }
    }

    /// Returns the navigation bounds of `range`, or `None` if nothing can
    /// match.
    fn bounds(range: &KeyRange) -> Option<(Bound<RowId>, Bound<RowId>)> {
        let lower = match range.lower().0.and_then(Key::leading) {
            None => Bound::Unbounded,
            Some(Value::Integer(v)) if *v < 0 => Bound::Unbounded,
            Some(Value::Integer(v)) => Bound::Included(RowId(*v as u64)),
            Some(_) => return None,
        };
        let upper = match range.upper().0.and_then(Key::leading) {
            None => Bound::Unbounded,
            Some(Value::Integer(v)) if *v < 0 => return None,
            Some(Value::Integer(v)) => Bound::Included(RowId(*v as u64)),
            Some(_) => return None,
        };
        if let (Bound::Included(lo), Bound::Included(hi)) = (lower, upper) {
            if lo > hi {
                return None;
            }
        }
        Some((lower, upper))
    }

    fn matching<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = RowId> + 'a {
        Self::bounds(range)
            .into_iter()
            .flat_map(move |bounds| self.ids.range(bounds))
            .copied()
            .filter(move |id| range.contains(&Key::row_id(*id)))
    }
}

impl Index for RowIdIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::RowId
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    fn add(&mut self, key: Key, row_id: RowId) -> CoreResult<()> {
        if self.ids.insert(row_id) {
            self.stats.add(&key, 1);
        }
        Ok(())
    }

    fn remove(&mut self, _key: &Key, row_id: RowId) {
        if self.ids.remove(&row_id) {
            self.stats.remove(1);
        }
    }

    fn get(&self, key: &Key) -> Vec<RowId> {
        Self::key_id(key)
            .filter(|id| self.ids.contains(id))
            .into_iter()
            .collect()
    }

    fn get_range(
        &self,
        ranges: &[KeyRange],
        reverse: bool,
        limit: Option<usize>,
        skip: usize,
    ) -> Vec<RowId> {
        let ids: Vec<RowId> = match ranges {
            [] => Vec::new(),
            [range] => self.matching(range).collect(),
            _ => ranges
                .iter()
                .flat_map(|range| self.matching(range))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        page(ids, reverse, limit, skip)
    }

    fn cost(&self, ranges: &[KeyRange]) -> usize {
        ranges.iter().map(|range| self.matching(range).count()).sum()
    }

    fn stats(&self) -> &IndexStats {
        &self.stats
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.stats.clear();
    }

    fn entries(&self) -> Vec<(Key, RowId)> {
        self.ids.iter().map(|id| (Key::row_id(*id), *id)).collect()
    }

    fn clone_box(&self) -> Box<dyn Index> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(ids: &[u64]) -> RowIdIndex {
        let mut index = RowIdIndex::new("Foo.#");
        for id in ids {
            index.add(Key::row_id(RowId(*id)), RowId(*id)).unwrap();
        }
        index
    }

    #[test]
    fn stats_follow_live_ids() {
        let mut index = index(&[1, 2, 3]);
        index.add(Key::row_id(RowId(2)), RowId(2)).unwrap();
        assert_eq!(index.stats().total_rows, 3);

        index.remove(&Key::row_id(RowId(2)), RowId(2));
        index.remove(&Key::row_id(RowId(9)), RowId(9));
        assert_eq!(index.stats().total_rows, 2);
        assert_eq!(index.get(&Key::row_id(RowId(2))), Vec::<RowId>::new());
        assert_eq!(index.get(&Key::row_id(RowId(3))), vec![RowId(3)]);
    }

    #[test]
    fn ranges_respect_open_bounds() {
        let index = index(&[1, 2, 3, 4, 5]);
        let range = KeyRange::new(
            Some(Key::single(2)),
            Some(Key::single(4)),
            true,
            false,
        );
        assert_eq!(index.get_range(&[range], false, None, 0), vec![RowId(3), RowId(4)]);
        assert_eq!(
            index.get_range(&[KeyRange::all()], true, Some(2), 1),
            vec![RowId(4), RowId(3)]
        );
        assert!(index
            .get_range(&[KeyRange::only(Key::single("x"))], false, None, 0)
            .is_empty());
    }

    #[test]
    fn multiple_ranges_are_merged_in_order() {
        let index = index(&[1, 2, 3, 4, 5]);
        let ranges = [
            KeyRange::only(Key::single(4)),
            KeyRange::only(Key::single(1)),
            KeyRange::only(Key::single(4)),
        ];
        assert_eq!(index.get_range(&ranges, false, None, 0), vec![RowId(1), RowId(4)]);
        assert_eq!(index.cost(&[KeyRange::at_least(Key::single(3))]), 3);
    }
}
