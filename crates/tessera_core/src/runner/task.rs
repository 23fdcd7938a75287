//! Schedulable units of work.

use crate::query::PhysicalPlan;
use crate::types::{TaskId, TaskPriority, TransactionKind};
use std::collections::BTreeSet;

/// One or more plans executed in a single journal.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    kind: TransactionKind,
    priority: TaskPriority,
    scope: BTreeSet<String>,
    plans: Vec<PhysicalPlan>,
}

impl Task {
    /// Creates a task over `plans`.
    ///
    /// The scope is the union of the plan scopes. The task is read-write if
    /// any plan writes.
    #[must_use]
    pub fn new(id: TaskId, priority: TaskPriority, plans: Vec<PhysicalPlan>) -> Self {
        let scope = plans
            .iter()
            .flat_map(|plan| plan.scope().iter().cloned())
            .collect();
        let kind = if plans
            .iter()
            .any(|plan| plan.query().kind() == TransactionKind::ReadWrite)
        {
            TransactionKind::ReadWrite
        } else {
            TransactionKind::ReadOnly
        };
        Self {
            id,
            kind,
            priority,
            scope,
            plans,
        }
    }

    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the journal kind the task needs.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Returns the scheduling priority.
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Returns the tables the task may touch.
    #[must_use]
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Returns the plans, in execution order.
    #[must_use]
    pub fn plans(&self) -> &[PhysicalPlan] {
        &self.plans
    }
}
