//! Predicates.
//!
//! Callers build [`Predicate`] trees with the [`ColumnRef`] helpers. A query
//! lowers them into its [`PredicateArena`] when the predicate is attached;
//! every node gets a [`PredicateId`] that stays stable through clones, so
//! plan steps refer to predicates by id instead of carrying copies.

use crate::index::{Key, KeyRange};
use crate::query::relation::RelationEntry;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// A column qualified by its table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    /// Table name.
    pub table: String,
    /// Column name.
    pub name: String,
}

/// Shorthand for [`ColumnRef::new`].
#[must_use]
pub fn col(table: &str, name: &str) -> ColumnRef {
    ColumnRef::new(table, name)
}

impl ColumnRef {
    /// Creates a column reference.
    #[must_use]
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }

    fn value(&self, op: ValueOp, operands: Vec<Value>) -> Predicate {
        Predicate::Value {
            column: self.clone(),
            op,
            operands,
        }
    }

    fn join(&self, other: &ColumnRef, op: JoinOp) -> Predicate {
        Predicate::Join {
            left: self.clone(),
            right: other.clone(),
            op,
        }
    }

    /// `column = value`
    #[must_use]
    pub fn eq(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Eq, vec![value.into()])
    }

    /// `column <> value`
    #[must_use]
    pub fn neq(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Neq, vec![value.into()])
    }

    /// `column < value`
    #[must_use]
    pub fn lt(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Lt, vec![value.into()])
    }

    /// `column <= value`
    #[must_use]
    pub fn lte(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Lte, vec![value.into()])
    }

    /// `column > value`
    #[must_use]
    pub fn gt(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Gt, vec![value.into()])
    }

    /// `column >= value`
    #[must_use]
    pub fn gte(&self, value: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Gte, vec![value.into()])
    }

    /// `column BETWEEN low AND high`, both ends inclusive.
    #[must_use]
    pub fn between(&self, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
        self.value(ValueOp::Between, vec![low.into(), high.into()])
    }

    /// `column IN (values)`
    #[must_use]
    pub fn in_list<I, V>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.value(ValueOp::In, values.into_iter().map(Into::into).collect())
    }

    /// `column IS NULL`
    #[must_use]
    pub fn is_null(&self) -> Predicate {
        self.value(ValueOp::IsNull, Vec::new())
    }

    /// `column IS NOT NULL`
    #[must_use]
    pub fn is_not_null(&self) -> Predicate {
        self.value(ValueOp::IsNotNull, Vec::new())
    }

    /// `column = other`
    #[must_use]
    pub fn eq_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Eq)
    }

    /// `column <> other`
    #[must_use]
    pub fn neq_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Neq)
    }

    /// `column < other`
    #[must_use]
    pub fn lt_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Lt)
    }

    /// `column <= other`
    #[must_use]
    pub fn lte_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Lte)
    }

    /// `column > other`
    #[must_use]
    pub fn gt_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Gt)
    }

    /// `column >= other`
    #[must_use]
    pub fn gte_col(&self, other: &ColumnRef) -> Predicate {
        self.join(other, JoinOp::Gte)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}

/// Operator of a value predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Inclusive range.
    Between,
    /// Membership.
    In,
    /// Null test.
    IsNull,
    /// Non-null test.
    IsNotNull,
}

impl ValueOp {
    /// Returns true if an index range scan can answer the operator.
    #[must_use]
    pub fn is_indexable(self) -> bool {
        !matches!(self, Self::Neq | Self::IsNotNull)
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Between => "BETWEEN",
            Self::In => "IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

/// Operator of a join predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
}

impl JoinOp {
    fn matches(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Neq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }
}

/// How the children of a combined predicate are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// All children must hold.
    And,
    /// At least one child must hold.
    Or,
}

/// A predicate tree as built by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Compares a column with constants.
    Value {
        /// Tested column.
        column: ColumnRef,
        /// Operator.
        op: ValueOp,
        /// Constants; two for `Between`, any number for `In`, none for
        /// the null tests.
        operands: Vec<Value>,
    },
    /// Compares two columns.
    Join {
        /// Left column.
        left: ColumnRef,
        /// Right column.
        right: ColumnRef,
        /// Operator.
        op: JoinOp,
    },
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Combines `self` and `other` with AND.
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Self::And(mut children) => {
                children.push(other);
                Self::And(children)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Combines `self` and `other` with OR.
    #[must_use]
    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Self::Or(mut children) => {
                children.push(other);
                Self::Or(children)
            }
            first => Self::Or(vec![first, other]),
        }
    }
}

/// Arena index of a predicate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PredicateId(pub usize);

impl fmt::Display for PredicateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A lowered predicate node.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateNode {
    /// Compares a column with constants.
    Value {
        /// Tested column.
        column: ColumnRef,
        /// Operator.
        op: ValueOp,
        /// Constants.
        operands: Vec<Value>,
    },
    /// Compares two columns.
    Join {
        /// Left column.
        left: ColumnRef,
        /// Right column.
        right: ColumnRef,
        /// Operator.
        op: JoinOp,
    },
    /// Combines child nodes.
    Combined {
        /// AND or OR.
        combinator: Combinator,
        /// Child node ids.
        children: Vec<PredicateId>,
    },
}

static NULL: Value = Value::Null;

/// Owner of every predicate node of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateArena {
    nodes: Vec<PredicateNode>,
}

impl PredicateArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowers `predicate` and returns the id of its root node.
    pub fn lower(&mut self, predicate: Predicate) -> PredicateId {
        let node = match predicate {
            Predicate::Value {
                column,
                op,
                operands,
            } => PredicateNode::Value {
                column,
                op,
                operands,
            },
            Predicate::Join { left, right, op } => PredicateNode::Join { left, right, op },
            Predicate::And(children) => PredicateNode::Combined {
                combinator: Combinator::And,
                children: children.into_iter().map(|child| self.lower(child)).collect(),
            },
            Predicate::Or(children) => PredicateNode::Combined {
                combinator: Combinator::Or,
                children: children.into_iter().map(|child| self.lower(child)).collect(),
            },
        };
        self.push(node)
    }

    /// Adds an AND node over existing nodes.
    pub fn conjoin(&mut self, children: Vec<PredicateId>) -> PredicateId {
        self.push(PredicateNode::Combined {
            combinator: Combinator::And,
            children,
        })
    }

    fn push(&mut self, node: PredicateNode) -> PredicateId {
        self.nodes.push(node);
        PredicateId(self.nodes.len() - 1)
    }

    /// Returns the node with `id`.
    #[must_use]
    pub fn get(&self, id: PredicateId) -> Option<&PredicateNode> {
        self.nodes.get(id.0)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the arena holds no node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evaluates predicate `id` against `entry`.
    ///
    /// Comparisons only hold between values of the same kind; a null never
    /// satisfies anything but `IS NULL`.
    #[must_use]
    pub fn eval(&self, id: PredicateId, entry: &RelationEntry) -> bool {
        match self.get(id) {
            Some(PredicateNode::Value {
                column,
                op,
                operands,
            }) => eval_value(entry.value(column), *op, operands),
            Some(PredicateNode::Join { left, right, op }) => entry
                .value(left)
                .compare_same_kind(entry.value(right))
                .is_some_and(|ordering| op.matches(ordering)),
            Some(PredicateNode::Combined {
                combinator: Combinator::And,
                children,
            }) => children.iter().all(|child| self.eval(*child, entry)),
            Some(PredicateNode::Combined {
                combinator: Combinator::Or,
                children,
            }) => children.iter().any(|child| self.eval(*child, entry)),
            None => false,
        }
    }

    /// Returns every column referenced by `id`.
    #[must_use]
    pub fn columns(&self, id: PredicateId) -> Vec<&ColumnRef> {
        match self.get(id) {
            Some(PredicateNode::Value { column, .. }) => vec![column],
            Some(PredicateNode::Join { left, right, .. }) => vec![left, right],
            Some(PredicateNode::Combined { children, .. }) => children
                .iter()
                .flat_map(|child| self.columns(*child))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns the tables referenced by `id`.
    #[must_use]
    pub fn tables(&self, id: PredicateId) -> BTreeSet<String> {
        self.columns(id)
            .into_iter()
            .map(|column| column.table.clone())
            .collect()
    }

    /// Splits `id` into its AND-ed parts.
    #[must_use]
    pub fn conjuncts(&self, id: PredicateId) -> Vec<PredicateId> {
        match self.get(id) {
            Some(PredicateNode::Combined {
                combinator: Combinator::And,
                children,
            }) => children
                .iter()
                .flat_map(|child| self.conjuncts(*child))
                .collect(),
            _ => vec![id],
        }
    }

    /// Returns the two columns of an equality join predicate.
    #[must_use]
    pub fn equi_join(&self, id: PredicateId) -> Option<(&ColumnRef, &ColumnRef)> {
        match self.get(id) {
            Some(PredicateNode::Join {
                left,
                right,
                op: JoinOp::Eq,
            }) => Some((left, right)),
            _ => None,
        }
    }

    /// Returns true if `id` is a join predicate between two tables.
    #[must_use]
    pub fn is_join(&self, id: PredicateId) -> bool {
        matches!(
            self.get(id),
            Some(PredicateNode::Join { left, right, .. }) if left.table != right.table
        )
    }

    /// Returns the column and key ranges of an index-answerable value
    /// predicate.
    #[must_use]
    pub fn key_ranges(&self, id: PredicateId) -> Option<(&ColumnRef, Vec<KeyRange>)> {
        let Some(PredicateNode::Value {
            column,
            op,
            operands,
        }) = self.get(id)
        else {
            return None;
        };
        if !op.is_indexable() || operands.iter().any(Value::is_null) {
            return None;
        }
        let key = |i: usize| operands.get(i).cloned().map(Key::single);
        let ranges = match op {
            ValueOp::Eq => vec![KeyRange::only(key(0)?)],
            ValueOp::Lt => vec![KeyRange::less_than(key(0)?)],
            ValueOp::Lte => vec![KeyRange::at_most(key(0)?)],
            ValueOp::Gt => vec![KeyRange::greater_than(key(0)?)],
            ValueOp::Gte => vec![KeyRange::at_least(key(0)?)],
            ValueOp::Between => vec![KeyRange::between(key(0)?, key(1)?)],
            ValueOp::In => operands
                .iter()
                .map(|value| KeyRange::only(Key::single(value.clone())))
                .collect(),
            ValueOp::IsNull => vec![KeyRange::only(Key::single(Value::Null))],
            ValueOp::Neq | ValueOp::IsNotNull => return None,
        };
        Some((column, ranges))
    }

    /// Renders `id` for plan explanations.
    #[must_use]
    pub fn describe(&self, id: PredicateId) -> String {
        match self.get(id) {
            Some(PredicateNode::Value {
                column,
                op,
                operands,
            }) => match op {
                ValueOp::IsNull | ValueOp::IsNotNull => format!("{column} {}", op.symbol()),
                ValueOp::Between => format!(
                    "{column} BETWEEN {} AND {}",
                    operands.first().unwrap_or(&NULL),
                    operands.get(1).unwrap_or(&NULL)
                ),
                ValueOp::In => {
                    let list: Vec<String> = operands.iter().map(ToString::to_string).collect();
                    format!("{column} IN ({})", list.join(", "))
                }
                _ => format!(
                    "{column} {} {}",
                    op.symbol(),
                    operands.first().unwrap_or(&NULL)
                ),
            },
            Some(PredicateNode::Join { left, right, op }) => {
                format!("{left} {} {right}", op.symbol())
            }
            Some(PredicateNode::Combined {
                combinator,
                children,
            }) => {
                let glue = match combinator {
                    Combinator::And => " AND ",
                    Combinator::Or => " OR ",
                };
                let parts: Vec<String> = children.iter().map(|c| self.describe(*c)).collect();
                format!("({})", parts.join(glue))
            }
            None => format!("{id}?"),
        }
    }
}

fn eval_value(value: &Value, op: ValueOp, operands: &[Value]) -> bool {
    let compare = |i: usize| {
        operands
            .get(i)
            .and_then(|operand| value.compare_same_kind(operand))
    };
    match op {
        ValueOp::Eq => compare(0) == Some(Ordering::Equal),
        ValueOp::Neq => compare(0).is_some_and(|o| o != Ordering::Equal),
        ValueOp::Lt => compare(0) == Some(Ordering::Less),
        ValueOp::Lte => compare(0).is_some_and(|o| o != Ordering::Greater),
        ValueOp::Gt => compare(0) == Some(Ordering::Greater),
        ValueOp::Gte => compare(0).is_some_and(|o| o != Ordering::Less),
        ValueOp::Between => {
            compare(0).is_some_and(|o| o != Ordering::Less)
                && compare(1).is_some_and(|o| o != Ordering::Greater)
        }
        ValueOp::In => operands
            .iter()
            .any(|operand| value.compare_same_kind(operand) == Some(Ordering::Equal)),
        ValueOp::IsNull => value.is_null(),
        ValueOp::IsNotNull => !value.is_null(),
    }
}
