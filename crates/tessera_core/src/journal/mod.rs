//! Transaction journal.
//!
//! A [`Journal`] is the only path that mutates the cache and the index
//! store. Writes are staged as per-table [`TableDiff`]s and checked against
//! a view of committed rows with the staged changes applied; nothing shared
//! is touched until [`Journal::commit`] has persisted the batch.

mod diff;

pub use diff::TableDiff;

use crate::context::EngineContext;
use crate::error::{
    CoreError, CoreResult, DUPLICATE_KEY, FK_PARENT_MISSING, FK_RESTRICT, NOT_NULL, ROW_ID_RANGE,
    ROW_NOT_FOUND,
};
use crate::index::{page, serialize_index, Index, Key, KeyRange};
use crate::row::Row;
use crate::schema::{ForeignKeyAction, IndexSpec, Schema, TableSchema};
use crate::store::CommitBatch;
use crate::types::{RowId, TransactionKind};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// State of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// Accepting reads and writes.
    Active,
    /// Committed; no further use allowed.
    Committed,
    /// Aborted; no further use allowed.
    Aborted,
}

impl fmt::Display for JournalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Committed => f.write_str("COMMITTED"),
            Self::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// Index entries to drop and add for one index.
#[derive(Debug, Default)]
struct IndexMutation {
    removals: Vec<(Key, RowId)>,
    additions: Vec<(Key, RowId)>,
}

/// A transaction-scoped overlay over the cache and the index store.
#[derive(Debug)]
pub struct Journal {
    ctx: Arc<EngineContext>,
    scope: BTreeSet<String>,
    kind: TransactionKind,
    state: JournalState,
    diffs: BTreeMap<String, TableDiff>,
    auto_keys: HashMap<String, i64>,
    persist: bool,
}

impl Journal {
    /// Creates a journal over `scope`.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, scope: BTreeSet<String>, kind: TransactionKind) -> Self {
        Self {
            ctx,
            scope,
            kind,
            state: JournalState::Active,
            diffs: BTreeMap::new(),
            auto_keys: HashMap::new(),
            persist: true,
        }
    }

    /// Creates a journal whose commit skips the backing store.
    ///
    /// Used to mirror changes that already live in the store.
    pub(crate) fn external(ctx: Arc<EngineContext>, scope: BTreeSet<String>) -> Self {
        Self {
            persist: false,
            ..Self::new(ctx, scope, TransactionKind::ReadWrite)
        }
    }

    /// Returns the declared scope.
    #[must_use]
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Returns the transaction kind.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JournalState {
        self.state
    }

    /// Returns the staged diff of every touched table.
    #[must_use]
    pub fn diffs(&self) -> &BTreeMap<String, TableDiff> {
        &self.diffs
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn ensure_active(&self, operation: &str) -> CoreResult<()> {
        if self.state == JournalState::Active {
            Ok(())
        } else {
            Err(CoreError::invalid_state(self.state, operation))
        }
    }

    fn ensure_in_scope(&self, table: &str) -> CoreResult<()> {
        if self.scope.contains(table) {
            Ok(())
        } else {
            Err(CoreError::out_of_scope(table))
        }
    }

    fn ensure_readable(&self, table: &str) -> CoreResult<()> {
        self.ensure_active("read")?;
        self.ensure_in_scope(table)
    }

    fn ensure_writable(&self, table: &str) -> CoreResult<()> {
        self.ensure_active("write")?;
        if self.kind == TransactionKind::ReadOnly {
            return Err(CoreError::read_only(table));
        }
        self.ensure_in_scope(table)
    }

    /// Stages new rows.
    ///
    /// # Errors
    ///
    /// Returns a scope, transaction or constraint error. On error nothing
    /// from this call stays staged.
    pub fn insert(&mut self, table: &str, rows: Vec<Row>) -> CoreResult<()> {
        self.ensure_writable(table)?;
        self.atomically(|journal, schema| {
            rows.into_iter()
                .try_for_each(|row| journal.stage_insert(schema, table, row, false))
        })
    }

    /// Stages rows, turning those whose primary key matches a live row into
    /// an update of that row.
    ///
    /// # Errors
    ///
    /// As [`Journal::insert`].
    pub fn insert_or_replace(&mut self, table: &str, rows: Vec<Row>) -> CoreResult<()> {
        self.ensure_writable(table)?;
        self.atomically(|journal, schema| {
            rows.into_iter()
                .try_for_each(|row| journal.stage_insert(schema, table, row, true))
        })
    }

    /// Stages replacements of existing rows, matched by row id.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (104) for rows that are not live, plus the
    /// errors of [`Journal::insert`].
    pub fn update(&mut self, table: &str, rows: Vec<Row>) -> CoreResult<()> {
        self.ensure_writable(table)?;
        self.atomically(|journal, schema| {
            rows.into_iter()
                .try_for_each(|row| journal.stage_update(schema, table, row))
        })
    }

    /// Stages removal of rows by id. Ids that are not live are ignored.
    ///
    /// # Errors
    ///
    /// Returns a scope or transaction error, or a restrict violation (204)
    /// if a referencing child row exists.
    pub fn remove(&mut self, table: &str, ids: Vec<RowId>) -> CoreResult<()> {
        self.ensure_writable(table)?;
        self.atomically(|journal, schema| {
            ids.into_iter()
                .try_for_each(|id| journal.stage_remove(schema, table, id))
        })
    }

    /// Stages the changes of `diff` as they are, without constraint checks.
    pub(crate) fn apply_external(&mut self, diff: &TableDiff) -> CoreResult<()> {
        let table = diff.name();
        self.ensure_writable(table)?;
        for id in diff.deleted().keys() {
            if let Some(row) = self.view_row(table, *id) {
                self.diff_mut(table).delete(row);
            }
        }
        let live = diff
            .added()
            .values()
            .chain(diff.modified().values().map(|(_, after)| after));
        for row in live {
            self.ctx.observe_row_id(row.id());
            match self.view_row(table, row.id()) {
                Some(before) => self.diff_mut(table).modify(before, row.clone()),
                None => self.diff_mut(table).add(row.clone()),
            }
        }
        Ok(())
    }

    fn atomically<F>(&mut self, stage: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Self, &Schema) -> CoreResult<()>,
    {
        let saved = (self.diffs.clone(), self.auto_keys.clone());
        let schema = self.ctx.schema().clone();
        let result = stage(self, &schema);
        if let Err(err) = &result {
            trace!(error = %err, "staging rejected, restoring journal");
            (self.diffs, self.auto_keys) = saved;
        }
        result
    }

    fn diff_mut(&mut self, table: &str) -> &mut TableDiff {
        self.diffs
            .entry(table.to_string())
            .or_insert_with(|| TableDiff::new(table))
    }

    fn stage_insert(
        &mut self,
        schema: &Schema,
        table: &str,
        mut row: Row,
        or_replace: bool,
    ) -> CoreResult<()> {
        let table_schema = schema.table(table)?;
        fill_missing_columns(table_schema, &mut row);
        self.assign_auto_key(table_schema, &mut row);

        if or_replace {
            if let Some(pk) = table_schema.primary_key_spec() {
                let key = Key::from_row(pk.columns(), &row);
                let existing = if key.has_null() {
                    None
                } else {
                    self.view_lookup(table, pk, &key).into_iter().next()
                };
                if let Some(id) = existing {
                    let replacement = Row::new(id, row.payload().clone());
                    return self.stage_update(schema, table, replacement);
                }
            }
        }

        self.check_fresh_id(table, row.id())?;
        check_not_null(table_schema, &row)?;
        self.check_parents(schema, table_schema, &row)?;
        self.check_unique(table_schema, &row)?;
        self.ctx.observe_row_id(row.id());
        self.diff_mut(table).add(row);
        Ok(())
    }

    /// Rejects an insert whose row id is out of range or live in any table,
    /// committed or staged. An id removed from `table` by this journal may be
    /// reused there.
    fn check_fresh_id(&self, table: &str, id: RowId) -> CoreResult<()> {
        if i64::try_from(id.0).is_err() {
            return Err(CoreError::validation(
                ROW_ID_RANGE,
                [table.to_string(), id.to_string()],
            ));
        }
        let mut removed_here = false;
        for (name, diff) in &self.diffs {
            match diff.staged(id) {
                Some(Some(_)) => return Err(duplicate_row_id(name, id)),
                Some(None) if name == table => removed_here = true,
                Some(None) => return Err(duplicate_row_id(name, id)),
                None => {}
            }
        }
        if removed_here {
            return Ok(());
        }
        match self.ctx.cache().read().get(id) {
            Some(_) => Err(duplicate_row_id(table, id)),
            None => Ok(()),
        }
    }

    fn stage_update(&mut self, schema: &Schema, table: &str, mut row: Row) -> CoreResult<()> {
        let table_schema = schema.table(table)?;
        let Some(before) = self.view_row(table, row.id()) else {
            return Err(CoreError::not_found(
                ROW_NOT_FOUND,
                [table.to_string(), row.id().to_string()],
            ));
        };
        fill_missing_columns(table_schema, &mut row);
        check_not_null(table_schema, &row)?;
        self.check_parents(schema, table_schema, &row)?;
        self.check_unique(table_schema, &row)?;

        let after = row.clone();
        self.diff_mut(table).modify(before.clone(), row);

        for fk in schema.referencing(table) {
            let old = before.get(&fk.parent_column);
            let new = after.get(&fk.parent_column);
            if old.is_null() || old == new {
                continue;
            }
            let children = self.view_referencing(&fk.table, &fk.column, old)?;
            if children.is_empty() {
                continue;
            }
            match fk.action {
                ForeignKeyAction::Restrict => {
                    return Err(CoreError::constraint(
                        FK_RESTRICT,
                        [fk.name.clone(), old.to_string()],
                    ));
                }
                ForeignKeyAction::Cascade => {
                    self.ensure_writable(&fk.table)?;
                    for mut child in children {
                        child.set(fk.column.clone(), new.clone());
                        self.stage_update(schema, &fk.table, child)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn stage_remove(&mut self, schema: &Schema, table: &str, id: RowId) -> CoreResult<()> {
        let Some(row) = self.view_row(table, id) else {
            return Ok(());
        };
        self.diff_mut(table).delete(row.clone());

        for fk in schema.referencing(table) {
            let value = row.get(&fk.parent_column);
            if value.is_null() {
                continue;
            }
            let children = self.view_referencing(&fk.table, &fk.column, value)?;
            if children.is_empty() {
                continue;
            }
            match fk.action {
                ForeignKeyAction::Restrict => {
                    return Err(CoreError::constraint(
                        FK_RESTRICT,
                        [fk.name.clone(), value.to_string()],
                    ));
                }
                ForeignKeyAction::Cascade => {
                    self.ensure_writable(&fk.table)?;
                    for child in children {
                        self.stage_remove(schema, &fk.table, child.id())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn assign_auto_key(&mut self, table: &TableSchema, row: &mut Row) {
        let Some(pk) = table.primary_key_spec().filter(|pk| pk.is_auto_increment()) else {
            return;
        };
        let column = &pk.columns()[0].name;
        let current = match row.get(column) {
            Value::Null | Value::Integer(0) => None,
            value => value.as_i64(),
        };

        let counter = match self.auto_keys.get(table.name()) {
            Some(counter) => *counter,
            None => self.committed_max_key(pk),
        };
        let next = match current {
            Some(explicit) => counter.max(explicit),
            None => {
                let assigned = counter + 1;
                row.set(column.clone(), assigned);
                assigned
            }
        };
        self.auto_keys.insert(table.name().to_string(), next);
    }

    fn committed_max_key(&self, pk: &IndexSpec) -> i64 {
        let indices = self.ctx.indices().read();
        indices
            .get(pk.name())
            .and_then(|index| index.stats().max_key_encountered.clone())
            .and_then(|key| key.leading().and_then(Value::as_i64))
            .unwrap_or(0)
    }

    fn check_parents(&self, schema: &Schema, table: &TableSchema, row: &Row) -> CoreResult<()> {
        for fk in table.foreign_keys() {
            let value = row.get(&fk.column);
            if value.is_null() {
                continue;
            }
            self.ensure_in_scope(&fk.parent_table)?;
            let parent = schema.table(&fk.parent_table)?;
            let Some(spec) = parent.unique_index_on(&fk.parent_column) else {
                continue;
            };
            let key = Key::single(value.clone());
            if self.view_lookup(&fk.parent_table, spec, &key).is_empty() {
                return Err(CoreError::constraint(
                    FK_PARENT_MISSING,
                    [fk.name.clone(), value.to_string()],
                ));
            }
        }
        Ok(())
    }

    fn check_unique(&self, table: &TableSchema, row: &Row) -> CoreResult<()> {
        for spec in table.all_indices().filter(|spec| spec.is_unique()) {
            let key = Key::from_row(spec.columns(), row);
            if key.has_null() {
                continue;
            }
            let taken = self
                .view_lookup(table.name(), spec, &key)
                .into_iter()
                .any(|id| id != row.id());
            if taken {
                return Err(CoreError::constraint(
                    DUPLICATE_KEY,
                    [spec.name().to_string(), key.to_string()],
                ));
            }
        }
        Ok(())
    }

    fn staged(&self, table: &str, id: RowId) -> Option<Option<&Row>> {
        self.diffs.get(table).and_then(|diff| diff.staged(id))
    }

    fn view_row(&self, table: &str, id: RowId) -> Option<Row> {
        match self.staged(table, id) {
            Some(staged) => staged.cloned(),
            None => self
                .ctx
                .cache()
                .read()
                .get_in(table, id)
                .map(|row| row.as_ref().clone()),
        }
    }

    /// Ids of live rows whose `spec` key equals `key`.
    fn view_lookup(&self, table: &str, spec: &IndexSpec, key: &Key) -> Vec<RowId> {
        let committed = self
            .ctx
            .indices()
            .read()
            .get(spec.name())
            .map(|index| index.get(key))
            .unwrap_or_default();
        let mut ids: Vec<RowId> = committed
            .into_iter()
            .filter(|id| self.staged(table, *id).is_none())
            .collect();
        if let Some(diff) = self.diffs.get(table) {
            ids.extend(
                diff.live_rows()
                    .filter(|row| Key::from_row(spec.columns(), row) == *key)
                    .map(Row::id),
            );
        }
        ids
    }

    fn view_referencing(&self, table: &str, column: &str, value: &Value) -> CoreResult<Vec<Row>> {
        self.ensure_in_scope(table)?;
        Ok(self
            .table_rows(table)
            .into_iter()
            .filter(|row| row.get(column) == value)
            .map(|row| row.as_ref().clone())
            .collect())
    }

    fn table_rows(&self, table: &str) -> Vec<Arc<Row>> {
        let committed = self.ctx.cache().read().get_range(table, None, None);
        let Some(diff) = self.diffs.get(table).filter(|diff| !diff.is_empty()) else {
            return committed;
        };

        let mut rows: BTreeMap<RowId, Arc<Row>> = committed
            .into_iter()
            .filter(|row| !diff.deleted().contains_key(&row.id()))
            .map(|row| (row.id(), row))
            .collect();
        for row in diff.live_rows() {
            rows.insert(row.id(), Arc::new(row.clone()));
        }
        rows.into_values().collect()
    }

    /// Returns every live row of `table` in row id order, staged changes
    /// included.
    ///
    /// # Errors
    ///
    /// Returns a scope or transaction error.
    pub fn get_table_rows(&self, table: &str) -> CoreResult<Vec<Arc<Row>>> {
        self.ensure_readable(table)?;
        Ok(self.table_rows(table))
    }

    /// Returns the live rows of `table` among `ids`, in the order given.
    /// Missing ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns a scope or transaction error.
    pub fn get_rows(&self, table: &str, ids: &[RowId]) -> CoreResult<Vec<Arc<Row>>> {
        self.ensure_readable(table)?;
        let cache = self.ctx.cache().read();
        Ok(ids
            .iter()
            .filter_map(|id| match self.staged(table, *id) {
                Some(staged) => staged.map(|row| Arc::new(row.clone())),
                None => cache.get_in(table, *id),
            })
            .collect())
    }

    /// Returns the live row with `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns a scope or transaction error.
    pub fn get_row(&self, table: &str, id: RowId) -> CoreResult<Option<Row>> {
        self.ensure_readable(table)?;
        Ok(self.view_row(table, id))
    }

    /// Returns ids from the index called `index` whose keys fall in any of
    /// `ranges`, in index order, staged changes included.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (102) for unknown indices, plus scope and
    /// transaction errors for the owning table.
    pub fn get_index_range(
        &self,
        index: &str,
        ranges: &[KeyRange],
        reverse: bool,
        limit: Option<usize>,
        skip: usize,
    ) -> CoreResult<Vec<RowId>> {
        let cache = self.ctx.cache().read();
        let indices = self.ctx.indices().read();
        let Some(shared) = indices.get(index) else {
            return Err(CoreError::index_not_found(index));
        };
        let table = indices
            .table_of(index)
            .ok_or_else(|| CoreError::index_not_found(index))?
            .to_string();
        self.ensure_readable(&table)?;

        let diff = match self.diffs.get(&table) {
            Some(diff) if !diff.is_empty() => diff,
            _ => return Ok(shared.get_range(ranges, reverse, limit, skip)),
        };

        let schema = self.ctx.schema().clone();
        let spec = schema
            .table(&table)?
            .all_indices()
            .find(|spec| spec.name() == index);
        let key_of = |row: &Row| match spec {
            Some(spec) => Key::from_row(spec.columns(), row),
            None => Key::row_id(row.id()),
        };

        let mut entries: Vec<(Key, RowId)> = shared
            .get_range(ranges, false, None, 0)
            .into_iter()
            .filter(|id| diff.staged(*id).is_none())
            .filter_map(|id| cache.get_in(&table, id).map(|row| (key_of(&row), id)))
            .collect();
        entries.extend(
            diff.live_rows()
                .map(|row| (key_of(row), row.id()))
                .filter(|(key, _)| ranges.iter().any(|range| range.contains(key))),
        );

        let comparator = shared.comparator();
        entries.sort_by(|a, b| comparator.compare(&a.0, &b.0).then(a.1.cmp(&b.1)));
        let ids = entries.into_iter().map(|(_, id)| id).collect();
        Ok(page(ids, reverse, limit, skip))
    }

    /// Persists the staged changes and applies them to the cache and the
    /// index store.
    ///
    /// Returns the committed diffs. Read-only and empty journals commit
    /// without touching the backing store.
    ///
    /// # Errors
    ///
    /// Returns a constraint error if the changes collide with committed
    /// index entries, or the backing store's error. On error the journal is
    /// aborted and nothing shared has changed.
    pub async fn commit(&mut self) -> CoreResult<Vec<TableDiff>> {
        self.ensure_active("commit")?;
        let diffs: Vec<TableDiff> = std::mem::take(&mut self.diffs)
            .into_values()
            .filter(|diff| !diff.is_empty())
            .collect();
        if self.kind == TransactionKind::ReadOnly || diffs.is_empty() {
            self.state = JournalState::Committed;
            return Ok(Vec::new());
        }

        let prepared = self.prepare(&diffs);
        let (mutations, rewritten) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.state = JournalState::Aborted;
                return Err(err);
            }
        };

        if self.persist {
            let indices = rewritten
                .iter()
                .flatten()
                .map(|index| (index.name().to_string(), serialize_index(&**index)))
                .collect();
            let batch = CommitBatch {
                diffs: diffs.clone(),
                indices,
            };
            let tx = self.ctx.store().begin(self.kind, &self.scope);
            if let Err(err) = tx.commit(batch).await {
                self.state = JournalState::Aborted;
                debug!(error = %err, "backing store rejected commit");
                return Err(err);
            }
        }

        if let Err(err) = self.apply(&diffs, mutations, rewritten) {
            self.state = JournalState::Aborted;
            return Err(err);
        }
        self.state = JournalState::Committed;
        Ok(diffs)
    }

    /// Discards the staged changes.
    ///
    /// # Errors
    ///
    /// Returns a transaction error (107) unless the journal is active.
    pub fn abort(&mut self) -> CoreResult<()> {
        self.ensure_active("abort")?;
        self.diffs.clear();
        self.auto_keys.clear();
        self.state = JournalState::Aborted;
        Ok(())
    }

    /// Computes index mutations and checks them against committed entries.
    ///
    /// When index partitions are persisted, also returns the affected
    /// indices with the mutations applied.
    fn prepare(
        &self,
        diffs: &[TableDiff],
    ) -> CoreResult<(BTreeMap<String, IndexMutation>, Option<Vec<Box<dyn Index>>>)> {
        let schema = self.ctx.schema().clone();
        let mut mutations: BTreeMap<String, IndexMutation> = BTreeMap::new();
        for diff in diffs {
            let table = schema.table(diff.name())?;
            let keyed = |row: &Row| -> Vec<(String, Key)> {
                let mut keys = vec![(table.row_id_index_name(), Key::row_id(row.id()))];
                keys.extend(
                    table
                        .all_indices()
                        .map(|spec| (spec.name().to_string(), Key::from_row(spec.columns(), row))),
                );
                keys
            };

            for row in diff.deleted().values() {
                for (name, key) in keyed(row) {
                    mutations.entry(name).or_default().removals.push((key, row.id()));
                }
            }
            for (before, after) in diff.modified().values() {
                for ((name, old), (_, new)) in keyed(before).into_iter().zip(keyed(after)) {
                    if old != new {
                        let mutation = mutations.entry(name).or_default();
                        mutation.removals.push((old, before.id()));
                        mutation.additions.push((new, after.id()));
                    }
                }
            }
            for row in diff.added().values() {
                for (name, key) in keyed(row) {
                    mutations.entry(name).or_default().additions.push((key, row.id()));
                }
            }
        }

        let indices = self.ctx.indices().read();
        for (name, mutation) in &mutations {
            let index = indices
                .get(name)
                .ok_or_else(|| CoreError::index_not_found(name))?;
            if index.is_unique() {
                check_unique_mutation(index, mutation)?;
            }
        }

        if !(self.persist && self.ctx.persists_indices()) {
            return Ok((mutations, None));
        }
        let mut rewritten = Vec::with_capacity(mutations.len());
        for (name, mutation) in &mutations {
            let mut index = indices
                .get(name)
                .ok_or_else(|| CoreError::index_not_found(name))?
                .clone_box();
            apply_mutation(&mut *index, mutation)?;
            rewritten.push(index);
        }
        Ok((mutations, Some(rewritten)))
    }

    fn apply(
        &self,
        diffs: &[TableDiff],
        mutations: BTreeMap<String, IndexMutation>,
        rewritten: Option<Vec<Box<dyn Index>>>,
    ) -> CoreResult<()> {
        let mut cache = self.ctx.cache().write();
        let mut indices = self.ctx.indices().write();

        let (mut inserted, mut updated, mut deleted) = (0, 0, 0);
        for diff in diffs {
            let removed: Vec<RowId> = diff.deleted().keys().copied().collect();
            cache.remove(diff.name(), &removed);
            cache.set_many(
                diff.name(),
                diff.live_rows().map(|row| Arc::new(row.clone())),
            );
            inserted += diff.added().len();
            updated += diff.modified().len();
            deleted += diff.deleted().len();
        }

        match rewritten {
            Some(rewritten) => {
                for index in rewritten {
                    let table = indices
                        .table_of(index.name())
                        .map(str::to_string)
                        .ok_or_else(|| CoreError::index_not_found(index.name()))?;
                    indices.set(&table, index);
                }
            }
            None => {
                for (name, mutation) in &mutations {
                    let index = indices
                        .get_mut(name)
                        .ok_or_else(|| CoreError::index_not_found(name))?;
                    apply_mutation(&mut **index, mutation)?;
                }
            }
        }

        self.ctx.stats().record_rows(inserted, updated, deleted);
        debug!(
            tables = diffs.len(),
            inserted, updated, deleted, "journal committed"
        );
        Ok(())
    }
}

fn duplicate_row_id(table: &str, id: RowId) -> CoreError {
    CoreError::constraint(DUPLICATE_KEY, [format!("{table}.#"), id.to_string()])
}

fn apply_mutation(index: &mut dyn Index, mutation: &IndexMutation) -> CoreResult<()> {
    for (key, id) in &mutation.removals {
        index.remove(key, *id);
    }
    for (key, id) in &mutation.additions {
        index.add(key.clone(), *id)?;
    }
    Ok(())
}

fn check_unique_mutation(index: &dyn Index, mutation: &IndexMutation) -> CoreResult<()> {
    let removed: BTreeSet<(&Key, RowId)> = mutation
        .removals
        .iter()
        .map(|(k, id)| (k, *id))
        .collect();
    let mut claimed: BTreeMap<&Key, RowId> = BTreeMap::new();
    for (key, id) in &mutation.additions {
        if key.has_null() {
            continue;
        }
        let taken = index
            .get(key)
            .into_iter()
            .any(|existing| existing != *id && !removed.contains(&(key, existing)));
        let repeated = claimed.insert(key, *id).is_some_and(|other| other != *id);
        if taken || repeated {
            return Err(CoreError::constraint(
                DUPLICATE_KEY,
                [index.name().to_string(), key.to_string()],
            ));
        }
    }
    Ok(())
}

fn fill_missing_columns(table: &TableSchema, row: &mut Row) {
    for column in table.columns() {
        if !row.payload().contains_key(&column.name) {
            row.set(column.name.clone(), Value::Null);
        }
    }
}

fn check_not_null(table: &TableSchema, row: &Row) -> CoreResult<()> {
    match table
        .columns()
        .iter()
        .find(|column| !column.nullable && row.get(&column.name).is_null())
    {
        Some(column) => Err(CoreError::constraint(
            NOT_NULL,
            [format!("{}.{}", table.name(), column.name)],
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{INVALID_STATE, OUT_OF_SCOPE, READ_ONLY};
    use crate::payload;
    use crate::schema::ColumnType;
    use crate::store::{MemoryStore, PersistedState};
    use crate::types::Order;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                TableSchema::new("Project")
                    .column("id", ColumnType::Integer)
                    .column("name", ColumnType::Text)
                    .auto_increment_key("id"),
                TableSchema::new("Task")
                    .column("id", ColumnType::Text)
                    .column("project", ColumnType::Integer)
                    .nullable_column("rank", ColumnType::Integer)
                    .primary_key(&["id"])
                    .index("idxRank", &[("rank", Order::Desc)])
                    .foreign_key(
                        "fkProject",
                        "project",
                        "Project",
                        "id",
                        ForeignKeyAction::Cascade,
                    ),
                TableSchema::new("Note")
                    .column("task", ColumnType::Text)
                    .foreign_key("fkTask", "task", "Task", "id", ForeignKeyAction::Restrict),
            ])
            .unwrap(),
        )
    }

    fn context(store: MemoryStore, config: Config) -> Arc<EngineContext> {
        let ctx = Arc::new(EngineContext::new(schema(), config, Arc::new(store)));
        ctx.seed(PersistedState::default()).unwrap();
        ctx
    }

    fn all() -> BTreeSet<String> {
        ["Project", "Task", "Note"].iter().map(|t| t.to_string()).collect()
    }

    fn project(ctx: &EngineContext, name: &str) -> Row {
        Row::new(ctx.allocate_row_id(), payload! { "name" => name })
    }

    fn task(ctx: &EngineContext, id: &str, project: i64, rank: Option<i64>) -> Row {
        Row::new(
            ctx.allocate_row_id(),
            payload! { "id" => id, "project" => project, "rank" => rank },
        )
    }

    async fn seeded() -> Arc<EngineContext> {
        let ctx = context(MemoryStore::new(), Config::default());
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal
            .insert("Project", vec![project(&ctx, "alpha"), project(&ctx, "beta")])
            .unwrap();
        journal
            .insert(
                "Task",
                vec![
                    task(&ctx, "t1", 1, Some(3)),
                    task(&ctx, "t2", 1, None),
                    task(&ctx, "t3", 2, Some(7)),
                ],
            )
            .unwrap();
        journal.commit().await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn auto_increment_assigns_distinct_keys() {
        let ctx = seeded().await;
        let journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadOnly);
        let keys: Vec<_> = journal
            .get_table_rows("Project")
            .unwrap()
            .iter()
            .map(|row| row.get("id").as_i64())
            .collect();
        assert_eq!(keys, vec![Some(1), Some(2)]);

        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal.insert("Project", vec![project(&ctx, "gamma")]).unwrap();
        let rows = journal.get_table_rows("Project").unwrap();
        assert_eq!(rows[2].get("id").as_i64(), Some(3));
    }

    #[tokio::test]
    async fn reads_see_own_writes_only() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        let t1 = journal.get_table_rows("Task").unwrap()[0].id();
        journal
            .insert("Task", vec![task(&ctx, "t4", 2, Some(5))])
            .unwrap();
        let mut changed = journal.get_row("Task", t1).unwrap().unwrap();
        changed.set("rank", 9);
        journal.update("Task", vec![changed]).unwrap();

        assert_eq!(journal.get_table_rows("Task").unwrap().len(), 4);
        assert_eq!(ctx.cache().read().get_count(Some("Task")), 3);

        let ranked = journal
            .get_index_range("Task.idxRank", &[KeyRange::all()], false, None, 0)
            .unwrap();
        let ranks: Vec<_> = journal
            .get_rows("Task", &ranked)
            .unwrap()
            .iter()
            .map(|row| row.get("rank").as_i64())
            .collect();
        assert_eq!(ranks, vec![None, Some(9), Some(7), Some(5)]);
    }

    #[tokio::test]
    async fn rejected_call_restores_staged_state() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal
            .insert("Task", vec![task(&ctx, "t9", 1, None)])
            .unwrap();

        let err = journal
            .insert(
                "Task",
                vec![task(&ctx, "t10", 1, None), task(&ctx, "t1", 1, None)],
            )
            .unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));
        assert_eq!(journal.diffs()["Task"].added().len(), 1);
    }

    #[tokio::test]
    async fn live_row_ids_cannot_be_inserted_again() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        let t1 = journal.get_table_rows("Task").unwrap()[0].id();

        let reused = Row::new(t1, payload! { "id" => "t8", "project" => 1 });
        let err = journal.insert("Task", vec![reused]).unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));

        // Ids are global, so another table cannot take it either.
        let foreign = Row::new(t1, payload! { "name" => "delta" });
        let err = journal.insert("Project", vec![foreign]).unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));

        let staged = task(&ctx, "t8", 1, None);
        let twin = Row::new(staged.id(), payload! { "id" => "t9", "project" => 2 });
        let err = journal.insert("Task", vec![staged, twin]).unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY));
        assert!(journal.diffs().values().all(TableDiff::is_empty));

        let huge = Row::new(RowId(u64::MAX), payload! { "id" => "t8", "project" => 1 });
        let err = journal.insert("Task", vec![huge]).unwrap_err();
        assert_eq!(err.code(), Some(ROW_ID_RANGE));

        // A row removed by the same journal frees its id in that table.
        let t1_row = journal.get_row("Task", t1).unwrap().unwrap();
        journal.remove("Task", vec![t1]).unwrap();
        journal.insert("Task", vec![t1_row]).unwrap();
        journal.commit().await.unwrap();

        let indices = ctx.indices().read();
        let count = ctx.cache().read().get_count(Some("Task"));
        assert_eq!(count, 3);
        assert_eq!(indices.get("Task.pkTask").unwrap().stats().total_rows, count);
        assert_eq!(indices.get("Task.idxRank").unwrap().stats().total_rows, count);
    }

    #[tokio::test]
    async fn constraint_codes() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);

        let orphan = task(&ctx, "t5", 99, None);
        assert_eq!(
            journal.insert("Task", vec![orphan]).unwrap_err().code(),
            Some(FK_PARENT_MISSING)
        );

        let missing = Row::new(ctx.allocate_row_id(), payload! { "id" => "t6" });
        assert_eq!(
            journal.insert("Task", vec![missing]).unwrap_err().code(),
            Some(NOT_NULL)
        );

        let ghost = Row::new(RowId(999), payload! { "id" => "t7", "project" => 1 });
        assert_eq!(
            journal.update("Task", vec![ghost]).unwrap_err().code(),
            Some(ROW_NOT_FOUND)
        );
        assert!(journal.diffs().values().all(TableDiff::is_empty));
    }

    #[tokio::test]
    async fn restrict_blocks_parent_removal() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        let note = Row::new(ctx.allocate_row_id(), payload! { "task" => "t1" });
        journal.insert("Note", vec![note]).unwrap();

        let t1 = journal.get_table_rows("Task").unwrap()[0].id();
        let err = journal.remove("Task", vec![t1]).unwrap_err();
        assert_eq!(err.code(), Some(FK_RESTRICT));
        assert!(journal.get_row("Task", t1).unwrap().is_some());
    }

    #[tokio::test]
    async fn cascade_removes_and_rewrites_children() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        let alpha = journal.get_table_rows("Project").unwrap()[0].id();
        journal.remove("Project", vec![alpha]).unwrap();
        assert_eq!(journal.get_table_rows("Task").unwrap().len(), 1);
        journal.commit().await.unwrap();
        assert_eq!(ctx.cache().read().get_count(Some("Task")), 1);

        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        let mut beta = journal.get_table_rows("Project").unwrap()[0].as_ref().clone();
        beta.set("id", 20);
        journal.update("Project", vec![beta]).unwrap();
        let remaining = journal.get_table_rows("Task").unwrap();
        assert_eq!(remaining[0].get("project").as_i64(), Some(20));
    }

    #[tokio::test]
    async fn insert_or_replace_keeps_row_count() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal
            .insert_or_replace("Task", vec![task(&ctx, "t2", 2, Some(1))])
            .unwrap();
        let diffs = journal.commit().await.unwrap();

        assert_eq!(diffs[0].modified().len(), 1);
        assert_eq!(ctx.cache().read().get_count(Some("Task")), 3);
        let indices = ctx.indices().read();
        assert_eq!(indices.get("Task.#").unwrap().stats().total_rows, 3);
        assert_eq!(indices.get("Task.idxRank").unwrap().stats().total_rows, 3);
    }

    #[tokio::test]
    async fn state_and_kind_checks() {
        let ctx = seeded().await;
        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadOnly);
        let err = journal
            .insert("Project", vec![project(&ctx, "x")])
            .unwrap_err();
        assert_eq!(err.code(), Some(READ_ONLY));

        let scope = ["Project".to_string()].into_iter().collect();
        let mut journal = Journal::new(ctx.clone(), scope, TransactionKind::ReadWrite);
        assert_eq!(
            journal.get_table_rows("Task").unwrap_err().code(),
            Some(OUT_OF_SCOPE)
        );

        journal.abort().unwrap();
        assert_eq!(journal.abort().unwrap_err().code(), Some(INVALID_STATE));
        assert_eq!(
            journal.get_table_rows("Project").unwrap_err().code(),
            Some(INVALID_STATE)
        );
    }

    #[tokio::test]
    async fn failed_store_commit_leaves_cache_untouched() {
        let store = MemoryStore::new();
        let ctx = context(store.clone(), Config::default());
        store.fail_next_commit();

        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal.insert("Project", vec![project(&ctx, "x")]).unwrap();
        assert!(journal.commit().await.is_err());
        assert_eq!(journal.state(), JournalState::Aborted);
        assert_eq!(ctx.cache().read().get_count(None), 0);
        assert_eq!(
            ctx.indices().read().get("Project.#").unwrap().stats().total_rows,
            0
        );
    }

    #[tokio::test]
    async fn persisted_partitions_follow_commits() {
        let store = MemoryStore::new().with_index_persistence();
        let ctx = context(store.clone(), Config::new().persist_indices(true));

        let mut journal = Journal::new(ctx.clone(), all(), TransactionKind::ReadWrite);
        journal.insert("Project", vec![project(&ctx, "x")]).unwrap();
        journal.commit().await.unwrap();

        let state = crate::store::BackingStore::init(&store, &schema()).await.unwrap();
        let partition = &state.indices["Project.pkProject"];
        assert_eq!(partition.len(), 2);
        assert_eq!(
            ctx.indices().read().get("Project.pkProject").unwrap().stats().total_rows,
            1
        );
    }
}
