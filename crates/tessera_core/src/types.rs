//! Core identifier and enum types.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Database-wide row identifier.
///
/// Row ids are assigned monotonically by the database and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl RowId {
    /// Creates a row id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RowId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Order {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl Order {
    /// Applies this direction to an ascending comparison result.
    #[must_use]
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }

    /// Returns the opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => f.write_str("ASC"),
            Self::Desc => f.write_str("DESC"),
        }
    }
}

/// Kind of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Reads only; any staged write is rejected.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// Scheduling priority of a task.
///
/// Variants are declared from highest to lowest priority, so the derived
/// ordering sorts the task that should be admitted first to the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Re-evaluation of observed queries.
    Observer,
    /// Changes pushed in from the backing store.
    ExternalChange,
    /// User queries and transactions.
    User,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_apply() {
        assert_eq!(Order::Asc.apply(Ordering::Less), Ordering::Less);
        assert_eq!(Order::Desc.apply(Ordering::Less), Ordering::Greater);
        assert_eq!(Order::Desc.reverse(), Order::Asc);
    }

    #[test]
    fn priority_sorts_observer_first() {
        let mut priorities = vec![
            TaskPriority::User,
            TaskPriority::Observer,
            TaskPriority::ExternalChange,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                TaskPriority::Observer,
                TaskPriority::ExternalChange,
                TaskPriority::User
            ]
        );
    }
}
