//! Task scheduling.
//!
//! The [`Runner`] admits work by scope: a task runs once no in-flight task
//! holds any of its tables. Waiting tasks are admitted by priority, then in
//! arrival order, and a waiting task holds back every later waiter that
//! shares a table with it. Read-only tasks are serialized like writers.
//!
//! Admission is handed out as an [`Admission`] guard through a
//! `tokio::sync::oneshot` channel; dropping the guard releases the scope and
//! admits the next waiters.

mod task;

pub use task::Task;

use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::journal::{Journal, TableDiff};
use crate::observer::{ObserverCallback, ObserverHandle, ObserverRegistry};
use crate::query::{PhysicalPlan, QueryEngine, Relation};
use crate::types::{TaskId, TaskPriority, TransactionKind};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

struct Waiter {
    seq: u64,
    priority: TaskPriority,
    scope: BTreeSet<String>,
    admit: oneshot::Sender<Admission>,
}

#[derive(Default)]
struct RunnerState {
    next_seq: u64,
    waiting: Vec<Waiter>,
    in_flight: HashMap<u64, BTreeSet<String>>,
    closed: bool,
}

/// Permission to touch a set of tables. Released on drop.
pub struct Admission {
    runner: Option<Arc<Runner>>,
    seq: u64,
    scope: BTreeSet<String>,
}

impl Admission {
    /// Returns the admitted tables.
    #[must_use]
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("seq", &self.seq)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.release(self.seq);
        }
    }
}

/// Schedules tasks and re-evaluates observers after writes.
pub struct Runner {
    ctx: Arc<EngineContext>,
    engine: QueryEngine,
    observers: ObserverRegistry,
    state: Mutex<RunnerState>,
    next_task_id: AtomicU64,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Runner")
            .field("waiting", &state.waiting.len())
            .field("in_flight", &state.in_flight.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner over `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let diff_limit = ctx.config().observer_diff_limit;
        Arc::new(Self {
            engine: QueryEngine::new(Arc::clone(&ctx)),
            observers: ObserverRegistry::new(diff_limit),
            ctx,
            state: Mutex::new(RunnerState::default()),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Returns the engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Returns the query engine.
    #[must_use]
    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Returns the observer registry.
    #[must_use]
    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Returns a fresh task id.
    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the number of tasks waiting for admission.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Waits until `scope` can be admitted at `priority`.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) once the runner is closed.
    pub async fn acquire(
        self: &Arc<Self>,
        priority: TaskPriority,
        scope: BTreeSet<String>,
    ) -> CoreResult<Admission> {
        let admitted = self.enqueue(priority, scope)?;
        admitted
            .await
            .map_err(|_| CoreError::invalid_state("CLOSED", "acquire"))
    }

    /// Adds a waiter and returns the channel its admission arrives on.
    fn enqueue(
        self: &Arc<Self>,
        priority: TaskPriority,
        scope: BTreeSet<String>,
    ) -> CoreResult<oneshot::Receiver<Admission>> {
        let (admit, admitted) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CoreError::invalid_state("CLOSED", "acquire"));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(seq, ?priority, ?scope, "task waiting");
            state.waiting.push(Waiter {
                seq,
                priority,
                scope,
                admit,
            });
        }
        self.pump();
        Ok(admitted)
    }

    fn release(self: &Arc<Self>, seq: u64) {
        self.state.lock().in_flight.remove(&seq);
        trace!(seq, "scope released");
        self.pump();
    }

    /// Admits every waiter whose scope is free.
    fn pump(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.waiting.sort_by_key(|waiter| (waiter.priority, waiter.seq));

        let mut blocked: BTreeSet<String> = state.in_flight.values().flatten().cloned().collect();
        let mut i = 0;
        while i < state.waiting.len() {
            if !state.waiting[i].scope.is_disjoint(&blocked) {
                blocked.extend(state.waiting[i].scope.iter().cloned());
                i += 1;
                continue;
            }

            let waiter = state.waiting.remove(i);
            blocked.extend(waiter.scope.iter().cloned());
            state.in_flight.insert(waiter.seq, waiter.scope.clone());
            let admission = Admission {
                runner: Some(Arc::clone(self)),
                seq: waiter.seq,
                scope: waiter.scope,
            };
            trace!(seq = waiter.seq, priority = ?waiter.priority, "task admitted");

            if let Err(mut orphan) = waiter.admit.send(admission) {
                // The waiting future was dropped. Release without re-entering.
                orphan.runner = None;
                state.in_flight.remove(&orphan.seq);
                blocked = state.in_flight.values().flatten().cloned().collect();
                i = 0;
            }
        }
    }

    /// Runs `task` once admitted and commits its journal.
    ///
    /// Returns one relation per plan. After a committed write, affected
    /// observers are re-evaluated before this returns.
    ///
    /// # Errors
    ///
    /// Returns the first execution error, or the commit error. The journal
    /// is discarded and nothing shared changes. Observer failures after the
    /// commit are logged, not returned.
    pub async fn schedule(self: &Arc<Self>, task: Task) -> CoreResult<Vec<Relation>> {
        let stats = self.ctx.stats();
        let admission = self.acquire(task.priority(), task.scope().clone()).await?;
        stats.record_task_scheduled();
        debug!(task = %task.id(), kind = ?task.kind(), scope = ?task.scope(), "running task");

        let mut journal = Journal::new(Arc::clone(&self.ctx), task.scope().clone(), task.kind());
        let mut results = Vec::with_capacity(task.plans().len());
        for plan in task.plans() {
            match self.engine.execute(plan, &mut journal) {
                Ok(relation) => results.push(relation),
                Err(err) => {
                    journal.abort()?;
                    stats.record_task_failed();
                    debug!(task = %task.id(), error = %err, "task failed");
                    return Err(err);
                }
            }
        }

        let diffs = match journal.commit().await {
            Ok(diffs) => diffs,
            Err(err) => {
                stats.record_task_failed();
                debug!(task = %task.id(), error = %err, "task commit failed");
                return Err(err);
            }
        };
        stats.record_task_committed();

        let pending = self.queue_observers(&written_tables(&diffs));
        drop(admission);
        self.deliver(pending).await;
        Ok(results)
    }

    /// Mirrors changes already persisted in the backing store.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown tables or rows and a constraint
    /// error if the changes collide with committed index entries.
    pub async fn apply_external(self: &Arc<Self>, diffs: Vec<TableDiff>) -> CoreResult<()> {
        let scope: BTreeSet<String> = diffs.iter().map(|diff| diff.name().to_string()).collect();
        let admission = self.acquire(TaskPriority::ExternalChange, scope.clone()).await?;

        let mut journal = Journal::external(Arc::clone(&self.ctx), scope);
        for diff in &diffs {
            if let Err(err) = journal.apply_external(diff) {
                journal.abort()?;
                return Err(err);
            }
        }
        let committed = journal.commit().await?;
        debug!(tables = committed.len(), "applied external change");

        let pending = self.queue_observers(&written_tables(&committed));
        drop(admission);
        self.deliver(pending).await;
        Ok(())
    }

    /// Evaluates `plan` and registers it for change notifications.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error of the first run.
    pub async fn observe(
        self: &Arc<Self>,
        plan: PhysicalPlan,
        callback: ObserverCallback,
    ) -> CoreResult<ObserverHandle> {
        let admission = self.acquire(TaskPriority::User, plan.scope().clone()).await?;
        let mut journal = Journal::new(
            Arc::clone(&self.ctx),
            plan.scope().clone(),
            TransactionKind::ReadOnly,
        );
        let initial = self.engine.execute(&plan, &mut journal)?;
        journal.abort()?;
        let handle = self
            .observers
            .add_observer(Arc::new(plan), initial, callback);
        drop(admission);
        debug!(observer = handle.as_u64(), "observer registered");
        Ok(handle)
    }

    /// Queues the re-evaluation of every observer of `written`.
    ///
    /// Call this while still holding the admission of the write: the
    /// observer waiter then outranks user work queued behind that write.
    pub(crate) fn queue_observers(
        self: &Arc<Self>,
        written: &BTreeSet<String>,
    ) -> Option<Pending> {
        if written.is_empty() {
            return None;
        }
        let affected = self.observers.affected(written);
        if affected.is_empty() {
            return None;
        }
        let scope: BTreeSet<String> = affected
            .iter()
            .flat_map(|(_, plan)| plan.scope().iter().cloned())
            .collect();
        match self.enqueue(TaskPriority::Observer, scope.clone()) {
            Ok(admitted) => Some(Pending {
                affected,
                scope,
                admitted,
            }),
            Err(err) => {
                warn!(error = %err, "observers not re-evaluated");
                None
            }
        }
    }

    /// Re-evaluates queued observers and delivers their changes.
    ///
    /// The write has already committed, so failures are logged rather than
    /// returned. An observer whose query fails keeps its previous result.
    /// Callbacks run after the observer admission is released.
    pub(crate) async fn deliver(self: &Arc<Self>, pending: Option<Pending>) {
        let Some(Pending {
            affected,
            scope,
            admitted,
        }) = pending
        else {
            return;
        };
        let Ok(admission) = admitted.await else {
            warn!("runner closed before observers were re-evaluated");
            return;
        };
        let stats = self.ctx.stats();

        let mut journal = Journal::new(Arc::clone(&self.ctx), scope, TransactionKind::ReadOnly);
        let mut deliveries = Vec::new();
        for (handle, plan) in affected {
            stats.record_observer_evaluation();
            match self.engine.execute(&plan, &mut journal) {
                Ok(result) => {
                    if let Some(delivery) = self.observers.update(handle, result) {
                        deliveries.push((handle, delivery));
                    }
                }
                Err(err) => warn!(
                    observer = handle.as_u64(),
                    error = %err,
                    "observer evaluation failed"
                ),
            }
        }
        if let Err(err) = journal.abort() {
            warn!(error = %err, "observer journal not discarded");
        }
        drop(admission);

        for (handle, (callback, changes)) in deliveries {
            stats.record_observer_notification();
            trace!(
                observer = handle.as_u64(),
                added = changes.added.len(),
                removed = changes.removed.len(),
                modified = changes.modified.len(),
                "delivering changes"
            );
            callback(&changes);
        }
    }

    /// Waits for admitted work on every table, then rejects new work.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) if the runner is already closed.
    pub async fn close(self: &Arc<Self>) -> CoreResult<()> {
        let admission = self
            .acquire(TaskPriority::User, self.ctx.schema().table_names())
            .await?;
        let abandoned = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiting)
        };
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "closing with waiting tasks");
        }
        drop(abandoned);
        drop(admission);
        self.observers.clear();
        Ok(())
    }
}

/// Observer work queued behind a write.
pub(crate) struct Pending {
    affected: Vec<(ObserverHandle, Arc<PhysicalPlan>)>,
    scope: BTreeSet<String>,
    admitted: oneshot::Receiver<Admission>,
}

fn written_tables(diffs: &[TableDiff]) -> BTreeSet<String> {
    diffs.iter().map(|diff| diff.name().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::INVALID_STATE;
    use crate::observer::ChangeSet;
    use crate::payload;
    use crate::query::{DeleteQuery, InsertQuery, Query, SelectQuery};
    use crate::schema::{ColumnType, Schema, TableSchema};
    use crate::store::{MemoryStore, PersistedState};

    fn runner() -> Arc<Runner> {
        let schema = Schema::new(vec![
            TableSchema::new("X").column("id", ColumnType::Integer),
            TableSchema::new("Y").column("id", ColumnType::Integer),
        ])
        .unwrap();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(schema),
            Config::default(),
            Arc::new(MemoryStore::new()),
        ));
        ctx.seed(PersistedState::default()).unwrap();
        Runner::new(ctx)
    }

    fn scope(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    async fn until_waiting(runner: &Runner, count: usize) {
        while runner.waiting() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn overlapping_scopes_serialize_by_priority() {
        let runner = runner();
        let held = runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let spawn = |priority, name: &'static str| {
            let runner = Arc::clone(&runner);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _admission = runner.acquire(priority, scope(&["X"])).await.unwrap();
                order.lock().push(name);
            })
        };
        let user = spawn(TaskPriority::User, "user");
        until_waiting(&runner, 1).await;
        let observer = spawn(TaskPriority::Observer, "observer");
        until_waiting(&runner, 2).await;

        let disjoint = runner.acquire(TaskPriority::User, scope(&["Y"])).await.unwrap();
        assert_eq!(disjoint.scope(), &scope(&["Y"]));
        assert!(order.lock().is_empty());

        drop(held);
        user.await.unwrap();
        observer.await.unwrap();
        assert_eq!(*order.lock(), vec!["observer", "user"]);
    }

    #[tokio::test]
    async fn waiter_blocks_later_overlapping_waiters() {
        let runner = runner();
        let held = runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap();

        let waiting_runner = Arc::clone(&runner);
        let both = tokio::spawn(async move {
            waiting_runner
                .acquire(TaskPriority::User, scope(&["X", "Y"]))
                .await
                .unwrap()
        });
        until_waiting(&runner, 1).await;

        // Y is free, but the earlier waiter on X and Y holds it back.
        let late_runner = Arc::clone(&runner);
        let late = tokio::spawn(async move {
            late_runner.acquire(TaskPriority::User, scope(&["Y"])).await.unwrap();
        });
        until_waiting(&runner, 2).await;
        tokio::task::yield_now().await;
        assert_eq!(runner.waiting(), 2);

        drop(held);
        let admission = both.await.unwrap();
        assert_eq!(runner.waiting(), 1);
        drop(admission);
        late.await.unwrap();
        assert_eq!(runner.waiting(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_is_skipped() {
        let runner = runner();
        let held = runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap();

        let abandoned_runner = Arc::clone(&runner);
        let abandoned = tokio::spawn(async move {
            let _ = abandoned_runner.acquire(TaskPriority::User, scope(&["X"])).await;
        });
        until_waiting(&runner, 1).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        let next = runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap();
        assert_eq!(runner.waiting(), 0);
        drop(next);
    }

    fn plan(runner: &Runner, query: impl Into<Query>) -> PhysicalPlan {
        runner.engine().get_plan(Arc::new(query.into())).unwrap()
    }

    #[tokio::test]
    async fn failing_observer_does_not_fail_the_write() {
        let runner = runner();
        // A delete cannot run in the read-only observer journal.
        runner.observers().add_observer(
            Arc::new(plan(&runner, DeleteQuery::new("X"))),
            Relation::default(),
            Arc::new(|_: &ChangeSet| panic!("never delivered")),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runner
            .observe(
                plan(&runner, SelectQuery::new().from("X")),
                Arc::new(move |changes: &ChangeSet| sink.lock().push(changes.added.len())),
            )
            .await
            .unwrap();

        let insert = plan(&runner, InsertQuery::new("X").value(payload! { "id" => 1 }));
        let task = Task::new(runner.next_task_id(), TaskPriority::User, vec![insert]);
        runner.schedule(task).await.unwrap();

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(runner.context().cache().read().get_count(Some("X")), 1);
        assert_eq!(runner.context().stats().snapshot().observer_evaluations, 2);
    }

    #[tokio::test]
    async fn observer_work_outranks_user_work_queued_behind_a_write() {
        let runner = runner();
        runner
            .observe(
                plan(&runner, SelectQuery::new().from("X")),
                Arc::new(|_: &ChangeSet| {}),
            )
            .await
            .unwrap();
        let write = runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap();

        let queued_runner = Arc::clone(&runner);
        let queued = tokio::spawn(async move {
            queued_runner.acquire(TaskPriority::User, scope(&["X"])).await.unwrap()
        });
        until_waiting(&runner, 1).await;

        let pending = runner.queue_observers(&scope(&["X"]));
        assert!(pending.is_some());
        assert_eq!(runner.waiting(), 2);
        drop(write);

        // The observer waiter is admitted first; the user waiter stays queued.
        assert_eq!(runner.waiting(), 1);
        runner.deliver(pending).await;
        let admission = queued.await.unwrap();
        assert_eq!(admission.scope(), &scope(&["X"]));
    }

    #[tokio::test]
    async fn closed_runner_rejects_work() {
        let runner = runner();
        runner.close().await.unwrap();
        let err = runner
            .acquire(TaskPriority::User, scope(&["X"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(INVALID_STATE));
    }
}
