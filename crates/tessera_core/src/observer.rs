//! Observed queries.
//!
//! The registry keeps, for each observer, the plan of its query and the
//! last result delivered. After a committed write the runner re-evaluates the
//! observers whose scope intersects the write and hands the new results to
//! [`ObserverRegistry::update`], which diffs them against the previous ones.

use crate::query::{PhysicalPlan, Relation, RelationEntry};
use crate::types::RowId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Difference between two results of an observed query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Entries that entered the result.
    pub added: Vec<RelationEntry>,
    /// Entries that left the result.
    pub removed: Vec<RelationEntry>,
    /// Entries whose values changed, as `(before, after)`.
    pub modified: Vec<(RelationEntry, RelationEntry)>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Computes the change from `before` to `after`.
    ///
    /// Entries are matched by row identity. Entries carrying aggregates are
    /// matched by position instead, since their rows stand for a whole group.
    /// Results with more than `limit` entries are compared as a whole and
    /// reported as a full replacement when they differ.
    #[must_use]
    pub fn between(before: &Relation, after: &Relation, limit: usize) -> Self {
        if before.len() > limit || after.len() > limit {
            if before.entries() == after.entries() {
                return Self::default();
            }
            return Self {
                added: after.entries().to_vec(),
                removed: before.entries().to_vec(),
                modified: Vec::new(),
            };
        }

        let mut previous: HashMap<EntryKey, VecDeque<&RelationEntry>> = HashMap::new();
        for (position, entry) in before.entries().iter().enumerate() {
            previous
                .entry(EntryKey::of(position, entry))
                .or_default()
                .push_back(entry);
        }

        let mut changes = Self::default();
        for (position, entry) in after.entries().iter().enumerate() {
            let matched = previous
                .get_mut(&EntryKey::of(position, entry))
                .and_then(VecDeque::pop_front);
            match matched {
                Some(old) if old == entry => {}
                Some(old) => changes.modified.push((old.clone(), entry.clone())),
                None => changes.added.push(entry.clone()),
            }
        }
        // Keep removals in their original order.
        for (position, entry) in before.entries().iter().enumerate() {
            let key = EntryKey::of(position, entry);
            if let Some(left) = previous.get_mut(&key) {
                if left.front().is_some_and(|e| std::ptr::eq(*e, entry)) {
                    left.pop_front();
                    changes.removed.push(entry.clone());
                }
            }
        }
        changes
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum EntryKey {
    Identity(Vec<(String, Option<RowId>)>),
    Position(usize),
}

impl EntryKey {
    fn of(position: usize, entry: &RelationEntry) -> Self {
        if entry.derived_values().is_empty() {
            Self::Identity(entry.identity())
        } else {
            Self::Position(position)
        }
    }
}

/// Callback invoked with the changes of an observed query.
pub type ObserverCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct Observer {
    plan: Arc<PhysicalPlan>,
    callback: ObserverCallback,
    last: Relation,
}

/// Registered observers and their last delivered results.
pub struct ObserverRegistry {
    observers: Mutex<BTreeMap<ObserverHandle, Observer>>,
    next_handle: AtomicU64,
    diff_limit: usize,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.lock().len())
            .field("diff_limit", &self.diff_limit)
            .finish_non_exhaustive()
    }
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(diff_limit: usize) -> Self {
        Self {
            observers: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            diff_limit,
        }
    }

    /// Registers `plan` with its current result. The callback fires on the
    /// next change, not for `initial`.
    pub fn add_observer(
        &self,
        plan: Arc<PhysicalPlan>,
        initial: Relation,
        callback: ObserverCallback,
    ) -> ObserverHandle {
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().insert(
            handle,
            Observer {
                plan,
                callback,
                last: initial,
            },
        );
        handle
    }

    /// Unregisters an observer. Returns false if the handle was unknown.
    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.lock().remove(&handle).is_some()
    }

    /// Returns the number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Returns true if no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    /// Returns the observers whose scope intersects `written`.
    #[must_use]
    pub fn affected(&self, written: &BTreeSet<String>) -> Vec<(ObserverHandle, Arc<PhysicalPlan>)> {
        self.observers
            .lock()
            .iter()
            .filter(|(_, observer)| !observer.plan.scope().is_disjoint(written))
            .map(|(handle, observer)| (*handle, Arc::clone(&observer.plan)))
            .collect()
    }

    /// Stores `result` as the latest result of `handle`.
    ///
    /// Returns the callback and the changes to deliver, or `None` if the
    /// result did not change or the observer was removed meanwhile.
    pub fn update(
        &self,
        handle: ObserverHandle,
        result: Relation,
    ) -> Option<(ObserverCallback, ChangeSet)> {
        let mut observers = self.observers.lock();
        let observer = observers.get_mut(&handle)?;
        let changes = ChangeSet::between(&observer.last, &result, self.diff_limit);
        observer.last = result;
        if changes.is_empty() {
            None
        } else {
            Some((Arc::clone(&observer.callback), changes))
        }
    }

    /// Drops every observer.
    pub fn clear(&self) {
        self.observers.lock().clear();
    }
}
