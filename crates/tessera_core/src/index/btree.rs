//! BTree index implementation.

use crate::error::{CoreError, CoreResult, DUPLICATE_KEY};
use crate::index::key::{Bias, Comparator, Key, KeyRange, SortKey};
use crate::index::stats::IndexStats;
use crate::index::traits::{page, Index, IndexKind};
use crate::types::{Order, RowId};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

/// Sorted index over keys derived from row columns.
///
/// `BTreeIndex` supports:
/// - Equality lookups
/// - Range scans in either direction
/// - Duplicate keys, unless the index is unique
///
/// Keys containing a null never conflict on a unique index.
///
/// # Example
///
/// ```rust
/// use tessera_core::index::{BTreeIndex, Comparator, Index, Key, KeyRange};
/// use tessera_core::{Order, RowId};
///
/// let mut index = BTreeIndex::new("Task.idxRank", Comparator::Single(Order::Asc), false);
/// index.add(Key::single(20), RowId(1)).unwrap();
/// index.add(Key::single(10), RowId(2)).unwrap();
///
/// let ids = index.get_range(&[KeyRange::at_least(Key::single(15))], false, None, 0);
/// assert_eq!(ids, vec![RowId(1)]);
/// ```
#[derive(Debug, Clone)]
pub struct BTreeIndex {
    name: String,
    comparator: Arc<Comparator>,
    unique: bool,
    entries: BTreeMap<SortKey, BTreeSet<RowId>>,
    stats: IndexStats,
}

impl BTreeIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(name: impl Into<String>, comparator: Comparator, unique: bool) -> Self {
        Self {
            name: name.into(),
            comparator: Arc::new(comparator),
            unique,
            entries: BTreeMap::new(),
            stats: IndexStats::new(),
        }
    }

    fn sort_key(&self, key: Key) -> SortKey {
        SortKey::exact(key, self.comparator.clone())
    }

    /// Returns navigation bounds in index order for a value-order range.
    fn bounds(&self, range: &KeyRange) -> Option<(Bound<SortKey>, Bound<SortKey>)> {
        let ((lower, lower_open), (upper, upper_open)) =
            if self.comparator.order_at(0) == Order::Desc {
                (range.upper(), range.lower())
            } else {
                (range.lower(), range.upper())
            };

        let start = lower.map(|key| {
            let bias = if lower_open { Bias::High } else { Bias::Low };
            SortKey::probe(key.clone(), self.comparator.clone(), bias)
        });
        let end = upper.map(|key| {
            let bias = if upper_open { Bias::Low } else { Bias::High };
            SortKey::probe(key.clone(), self.comparator.clone(), bias)
        });

        if let (Some(start), Some(end)) = (&start, &end) {
            if start > end {
                return None;
            }
        }
        Some((
            start.map_or(Bound::Unbounded, Bound::Included),
            end.map_or(Bound::Unbounded, Bound::Included),
        ))
    }

    fn matching<'a>(
        &'a self,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a SortKey, &'a BTreeSet<RowId>)> + 'a {
        self.bounds(range)
            .into_iter()
            .flat_map(move |bounds| self.entries.range(bounds))
            .filter(move |(key, _)| range.contains(&key.key))
    }
}

impl Index for BTreeIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::BTree
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    fn add(&mut self, key: Key, row_id: RowId) -> CoreResult<()> {
        let sort_key = self.sort_key(key);
        if self.unique && !sort_key.key.has_null() {
            if let Some(existing) = self.entries.get(&sort_key) {
                if existing.iter().any(|id| *id != row_id) {
                    return Err(CoreError::constraint(
                        DUPLICATE_KEY,
                        [self.name.clone(), sort_key.key.to_string()],
                    ));
                }
            }
        }

        let stats_key = sort_key.key.clone();
        if self.entries.entry(sort_key).or_default().insert(row_id) {
            self.stats.add(&stats_key, 1);
        }
        Ok(())
    }

    fn remove(&mut self, key: &Key, row_id: RowId) {
        let sort_key = self.sort_key(key.clone());
        let emptied = match self.entries.get_mut(&sort_key) {
            Some(ids) => {
                if ids.remove(&row_id) {
                    self.stats.remove(1);
                }
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.entries.remove(&sort_key);
        }
    }

    fn get(&self, key: &Key) -> Vec<RowId> {
        self.entries
            .get(&self.sort_key(key.clone()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
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
            [range] => self
                .matching(range)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            _ => {
                let mut keys: Vec<&SortKey> = ranges
                    .iter()
                    .flat_map(|range| self.matching(range).map(|(key, _)| key))
                    .collect();
                keys.sort();
                keys.dedup();
                keys.into_iter()
                    .filter_map(|key| self.entries.get(key))
                    .flat_map(|ids| ids.iter().copied())
                    .collect()
            }
        };
        page(ids, reverse, limit, skip)
    }

    fn cost(&self, ranges: &[KeyRange]) -> usize {
        ranges
            .iter()
            .map(|range| self.matching(range).map(|(_, ids)| ids.len()).sum::<usize>())
            .sum()
    }

    fn stats(&self) -> &IndexStats {
        &self.stats
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.stats.clear();
    }

    fn entries(&self) -> Vec<(Key, RowId)> {
        self.entries
            .iter()
            .flat_map(|(key, ids)| ids.iter().map(move |id| (key.key.clone(), *id)))
            .collect()
    }

    fn clone_box(&self) -> Box<dyn Index> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ids(raw: &[u64]) -> Vec<RowId> {
        raw.iter().copied().map(RowId).collect()
    }

    fn ranked(order: Order) -> BTreeIndex {
        let mut index = BTreeIndex::new("T.idxRank", Comparator::Single(order), false);
        for (id, rank) in [(1, 30), (2, 10), (3, 20), (4, 20), (5, 40)] {
            index.add(Key::single(rank), RowId(id)).unwrap();
        }
        index
    }

    #[test]
    fn unique_rejects_duplicates_without_inserting() {
        let mut index = BTreeIndex::new("Item.pkItem", Comparator::Single(Order::Asc), true);
        index.add(Key::single("a"), RowId(1)).unwrap();

        let err = index.add(Key::single("a"), RowId(2)).unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));
        assert_eq!(index.stats().total_rows, 1);
        assert_eq!(index.get(&Key::single("a")), ids(&[1]));

        index.add(Key::single("a"), RowId(1)).unwrap();
        assert_eq!(index.stats().total_rows, 1);
    }

    #[test]
    fn unique_allows_repeated_nulls() {
        let mut index = BTreeIndex::new(
            "T.idxCode",
            Comparator::NullAware(vec![Order::Asc]),
            true,
        );
        index.add(Key::single(Value::Null), RowId(1)).unwrap();
        index.add(Key::single(Value::Null), RowId(2)).unwrap();
        assert_eq!(index.stats().total_rows, 2);
    }

    #[test]
    fn duplicates_and_removal() {
        let mut index = ranked(Order::Asc);
        assert_eq!(index.get(&Key::single(20)), ids(&[3, 4]));
        assert_eq!(index.stats().total_rows, 5);

        index.remove(&Key::single(20), RowId(3));
        index.remove(&Key::single(20), RowId(3));
        assert_eq!(index.get(&Key::single(20)), ids(&[4]));
        assert_eq!(index.stats().total_rows, 4);
    }

    #[test]
    fn ascending_ranges() {
        let index = ranked(Order::Asc);
        let range = KeyRange::new(Some(Key::single(10)), Some(Key::single(30)), true, false);

        assert_eq!(index.get_range(&[range.clone()], false, None, 0), ids(&[3, 4, 1]));
        assert_eq!(index.get_range(&[range], true, Some(2), 0), ids(&[1, 4]));
        assert_eq!(index.cost(&[KeyRange::less_than(Key::single(25))]), 3);
    }

    #[test]
    fn descending_index_scans_high_to_low() {
        let index = ranked(Order::Desc);

        assert_eq!(
            index.get_range(&[KeyRange::all()], false, None, 0),
            ids(&[5, 1, 3, 4, 2])
        );
        assert_eq!(
            index.get_range(&[KeyRange::greater_than(Key::single(20))], false, None, 0),
            ids(&[5, 1])
        );
        assert_eq!(
            index.get_range(&[KeyRange::at_most(Key::single(20))], false, None, 0),
            ids(&[3, 4, 2])
        );
    }

    #[test]
    fn empty_and_inverted_ranges() {
        let index = ranked(Order::Asc);
        let inverted = KeyRange::between(Key::single(30), Key::single(10));
        assert!(index.get_range(&[inverted], false, None, 0).is_empty());

        let touching = KeyRange::new(Some(Key::single(20)), Some(Key::single(20)), false, true);
        assert!(index.get_range(&[touching], false, None, 0).is_empty());
    }

    #[test]
    fn multiple_ranges_follow_index_order() {
        let index = ranked(Order::Asc);
        let ranges = [
            KeyRange::only(Key::single(40)),
            KeyRange::only(Key::single(10)),
        ];
        assert_eq!(index.get_range(&ranges, false, None, 0), ids(&[2, 5]));
        assert_eq!(index.get_range(&ranges, false, Some(1), 1), ids(&[5]));
    }

    #[test]
    fn null_aware_range_skips_nulls() {
        let mut index = BTreeIndex::new(
            "T.idxDue",
            Comparator::NullAware(vec![Order::Desc]),
            false,
        );
        index.add(Key::single(Value::Null), RowId(1)).unwrap();
        index.add(Key::single(5), RowId(2)).unwrap();
        index.add(Key::single(7), RowId(3)).unwrap();

        assert_eq!(index.get_range(&[KeyRange::all()], false, None, 0), ids(&[1, 3, 2]));
        assert_eq!(
            index.get_range(&[KeyRange::less_than(Key::single(7))], false, None, 0),
            ids(&[2])
        );
        assert_eq!(
            index.get_range(&[KeyRange::only(Key::single(Value::Null))], false, None, 0),
            ids(&[1])
        );
    }

    #[test]
    fn prefix_ranges_on_composite_keys() {
        let mut index = BTreeIndex::new(
            "T.idxPair",
            Comparator::Multi(vec![Order::Asc, Order::Desc]),
            false,
        );
        for (id, a, b) in [(1, 1, 1), (2, 1, 2), (3, 2, 1), (4, 0, 9)] {
            index
                .add(Key::new(vec![Value::Integer(a), Value::Integer(b)]), RowId(id))
                .unwrap();
        }

        assert_eq!(
            index.get_range(&[KeyRange::only(Key::single(1))], false, None, 0),
            ids(&[2, 1])
        );
        assert_eq!(
            index.get_range(&[KeyRange::at_least(Key::single(1))], false, None, 0),
            ids(&[2, 1, 3])
        );
    }
}
