//! Explicit transactions.

use crate::error::{CoreError, CoreResult};
use crate::journal::{Journal, JournalState};
use crate::query::{Query, Relation};
use crate::runner::{Admission, Runner};
use crate::types::TransactionKind;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// State of an explicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting queries.
    Active,
    /// Committed.
    Committed,
    /// Rolled back, explicitly or after a failed query.
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Committed => f.write_str("COMMITTED"),
            Self::RolledBack => f.write_str("ROLLED_BACK"),
        }
    }
}

/// A transaction holding its scope until it commits or rolls back.
///
/// Queries attached to the transaction run immediately against its journal
/// and see each other's staged writes. Nothing is visible to other tasks
/// before [`Transaction::commit`]. Dropping an active transaction rolls it
/// back.
pub struct Transaction {
    runner: Arc<Runner>,
    journal: Journal,
    admission: Option<Admission>,
    state: TransactionState,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.journal.kind())
            .field("scope", self.journal.scope())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(runner: Arc<Runner>, admission: Admission, kind: TransactionKind) -> Self {
        let journal = Journal::new(
            Arc::clone(runner.context()),
            admission.scope().clone(),
            kind,
        );
        Self {
            runner,
            journal,
            admission: Some(admission),
            state: TransactionState::Active,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the tables the transaction holds.
    #[must_use]
    pub fn scope(&self) -> &BTreeSet<String> {
        self.journal.scope()
    }

    /// Returns the transaction kind.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.journal.kind()
    }

    fn ensure_active(&self, operation: &str) -> CoreResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(CoreError::invalid_state(self.state, operation))
        }
    }

    /// Runs `query` inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) unless the transaction is active.
    /// Any other error rolls the transaction back before it is returned.
    pub fn attach(&mut self, query: impl Into<Query>) -> CoreResult<Relation> {
        self.ensure_active("attach")?;
        let engine = self.runner.engine();
        let result = engine
            .get_plan(Arc::new(query.into()))
            .and_then(|plan| engine.execute(&plan, &mut self.journal));
        if result.is_err() {
            self.discard()?;
        }
        result
    }

    /// Commits the staged writes and notifies observers.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) unless the transaction is active, or
    /// the commit error, in which case the transaction is rolled back.
    /// Observer failures after a successful commit are logged, not returned.
    pub async fn commit(&mut self) -> CoreResult<()> {
        self.ensure_active("commit")?;
        let ctx = Arc::clone(self.runner.context());
        let diffs = match self.journal.commit().await {
            Ok(diffs) => diffs,
            Err(err) => {
                self.admission = None;
                self.state = TransactionState::RolledBack;
                ctx.stats().record_task_failed();
                return Err(err);
            }
        };
        self.state = TransactionState::Committed;
        ctx.stats().record_task_committed();
        debug!(tables = diffs.len(), "transaction committed");

        let written: BTreeSet<String> = diffs.iter().map(|diff| diff.name().to_string()).collect();
        let pending = self.runner.queue_observers(&written);
        self.admission = None;
        self.runner.deliver(pending).await;
        Ok(())
    }

    /// Discards the staged writes and releases the scope.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) unless the transaction is active.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_active("rollback")?;
        self.discard()
    }

    fn discard(&mut self) -> CoreResult<()> {
        self.state = TransactionState::RolledBack;
        self.admission = None;
        if self.journal.state() == JournalState::Active {
            self.journal.abort()?;
        }
        debug!("transaction rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            let _ = self.discard();
        }
    }
}
