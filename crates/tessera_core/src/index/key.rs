//! Index keys, comparators and key ranges.

use crate::row::Row;
use crate::schema::IndexColumn;
use crate::types::{Order, RowId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Values projected from the indexed columns of a row.
///
/// The derived ordering is plain value order and is used for statistics.
/// Index order is defined by a [`Comparator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<Value>);

impl Key {
    /// Creates a key from values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Creates a single-column key.
    #[must_use]
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Creates the row-id index key for `id`.
    ///
    /// Row ids must not exceed `i64::MAX`; journals reject larger ids
    /// before they reach an index, and larger values saturate here.
    #[must_use]
    pub fn row_id(id: RowId) -> Self {
        Self(vec![Value::Integer(i64::try_from(id.0).unwrap_or(i64::MAX))])
    }

    /// Projects `columns` out of `row`.
    #[must_use]
    pub fn from_row(columns: &[IndexColumn], row: &Row) -> Self {
        Self(columns.iter().map(|c| row.get(&c.name).clone()).collect())
    }

    /// Returns the key values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a key with no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first value.
    #[must_use]
    pub fn leading(&self) -> Option<&Value> {
        self.0.first()
    }

    /// Returns true if any value is null.
    #[must_use]
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Orders keys within an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparator {
    /// One column in the given direction.
    Single(Order),
    /// Several columns compared lexicographically, each in its own direction.
    Multi(Vec<Order>),
    /// Like `Multi`, but nulls sort before every non-null value whatever the
    /// direction. Chosen whenever an indexed column is nullable.
    NullAware(Vec<Order>),
}

impl Comparator {
    /// Picks the comparator for an index over columns with `orders`.
    #[must_use]
    pub fn for_columns(orders: Vec<Order>, nullable: bool) -> Self {
        if nullable {
            Self::NullAware(orders)
        } else if orders.len() == 1 {
            Self::Single(orders[0])
        } else {
            Self::Multi(orders)
        }
    }

    /// Returns the direction of column `position`.
    #[must_use]
    pub fn order_at(&self, position: usize) -> Order {
        match self {
            Self::Single(order) => *order,
            Self::Multi(orders) | Self::NullAware(orders) => {
                orders.get(position).copied().unwrap_or_default()
            }
        }
    }

    /// Returns true for [`Comparator::NullAware`].
    #[must_use]
    pub fn is_null_aware(&self) -> bool {
        matches!(self, Self::NullAware(_))
    }

    /// Compares two full keys.
    #[must_use]
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        self.compare_prefix(a, b).then_with(|| a.len().cmp(&b.len()))
    }

    /// Compares the common prefix of two keys.
    #[must_use]
    pub fn compare_prefix(&self, a: &Key, b: &Key) -> Ordering {
        let null_aware = self.is_null_aware();
        for (position, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
            let ordering = match (null_aware, x.is_null(), y.is_null()) {
                (true, true, true) => Ordering::Equal,
                (true, true, false) => Ordering::Less,
                (true, false, true) => Ordering::Greater,
                _ => self.order_at(position).apply(x.cmp(y)),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// A range of keys in value order.
///
/// Bounds may be shorter than the index keys they are matched against; only
/// the bounded prefix is compared. Bounds only match values of the same
/// variant, and a key whose leading value is null only matches a point
/// range on null or [`KeyRange::all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// Creates a range. `None` leaves that side unbounded.
    #[must_use]
    pub fn new(lower: Option<Key>, upper: Option<Key>, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower,
            upper,
            lower_open,
            upper_open,
        }
    }

    /// Matches every key, nulls included.
    #[must_use]
    pub fn all() -> Self {
        Self::new(None, None, false, false)
    }

    /// Matches exactly `key`.
    #[must_use]
    pub fn only(key: Key) -> Self {
        Self::new(Some(key.clone()), Some(key), false, false)
    }

    /// Matches keys `>= key`.
    #[must_use]
    pub fn at_least(key: Key) -> Self {
        Self::new(Some(key), None, false, false)
    }

    /// Matches keys `> key`.
    #[must_use]
    pub fn greater_than(key: Key) -> Self {
        Self::new(Some(key), None, true, false)
    }

    /// Matches keys `<= key`.
    #[must_use]
    pub fn at_most(key: Key) -> Self {
        Self::new(None, Some(key), false, false)
    }

    /// Matches keys `< key`.
    #[must_use]
    pub fn less_than(key: Key) -> Self {
        Self::new(None, Some(key), false, true)
    }

    /// Matches keys in `[lower, upper]`.
    #[must_use]
    pub fn between(lower: Key, upper: Key) -> Self {
        Self::new(Some(lower), Some(upper), false, false)
    }

    /// Returns the lower bound and whether it is open.
    #[must_use]
    pub fn lower(&self) -> (Option<&Key>, bool) {
        (self.lower.as_ref(), self.lower_open)
    }

    /// Returns the upper bound and whether it is open.
    #[must_use]
    pub fn upper(&self) -> (Option<&Key>, bool) {
        (self.upper.as_ref(), self.upper_open)
    }

    /// Returns true for the unbounded range.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// Returns true if both bounds are the same closed key.
    #[must_use]
    pub fn is_point(&self) -> bool {
        !self.lower_open && !self.upper_open && self.lower.is_some() && self.lower == self.upper
    }

    /// Returns true if `key` lies within the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        if self.is_all() {
            return true;
        }
        let leading_null = key.leading().is_some_and(Value::is_null);
        if leading_null && (self.lower.is_none() || self.upper.is_none()) {
            return false;
        }
        if let Some(lower) = &self.lower {
            match compare_to_bound(key, lower) {
                Some(Ordering::Greater) => {}
                Some(Ordering::Equal) if !self.lower_open => {}
                _ => return false,
            }
        }
        if let Some(upper) = &self.upper {
            match compare_to_bound(key, upper) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if !self.upper_open => {}
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.lower_open { "(" } else { "[" })?;
        match &self.lower {
            Some(key) => write!(f, "{key}")?,
            None => f.write_str("unbound")?,
        }
        f.write_str(", ")?;
        match &self.upper {
            Some(key) => write!(f, "{key}")?,
            None => f.write_str("unbound")?,
        }
        f.write_str(if self.upper_open { ")" } else { "]" })
    }
}

/// Compares the prefix of `key` covered by `bound`, in value order.
///
/// Returns `None` when a position is not comparable.
fn compare_to_bound(key: &Key, bound: &Key) -> Option<Ordering> {
    for (position, expected) in bound.values().iter().enumerate() {
        let actual = key.values().get(position)?;
        let ordering = if expected.is_null() || actual.is_null() {
            if expected.is_null() && actual.is_null() {
                Ordering::Equal
            } else {
                return None;
            }
        } else {
            actual.compare_same_kind(expected)?
        };
        if ordering != Ordering::Equal {
            return Some(ordering);
        }
    }
    Some(Ordering::Equal)
}

/// Position of a lookup probe relative to stored keys sharing its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Bias {
    Low,
    Exact,
    High,
}

/// A key ordered by its index comparator.
///
/// Stored keys are `Exact`. Probes built from range bounds are `Low` or
/// `High`, which places them before or after every stored key sharing their
/// prefix, so a probe never compares equal to a stored key.
#[derive(Debug, Clone)]
pub(crate) struct SortKey {
    pub(crate) key: Key,
    comparator: Arc<Comparator>,
    bias: Bias,
}

impl SortKey {
    pub(crate) fn exact(key: Key, comparator: Arc<Comparator>) -> Self {
        Self {
            key,
            comparator,
            bias: Bias::Exact,
        }
    }

    pub(crate) fn probe(key: Key, comparator: Arc<Comparator>, bias: Bias) -> Self {
        Self {
            key,
            comparator,
            bias,
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.bias == Bias::Exact && other.bias == Bias::Exact {
            return self.comparator.compare(&self.key, &other.key);
        }
        self.comparator
            .compare_prefix(&self.key, &other.key)
            .then_with(|| self.bias.cmp(&other.bias))
    }
}
