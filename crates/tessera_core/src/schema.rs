//! Table schemas.
//!
//! A [`Schema`] is built once from a list of [`TableSchema`] definitions and
//! validated up front. Index and foreign key names are qualified with their
//! table (`Task.idxDone`), the primary key index is named `Table.pkTable` and
//! every table carries an implicit row-id index named `Table.#`.

use crate::error::{CoreError, CoreResult, DUPLICATE_NAME, INVALID_REFERENCE};
use crate::types::Order;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Signed integer.
    Integer,
    /// Floating point number.
    Number,
    /// UTF-8 text.
    Text,
    /// Boolean.
    Bool,
    /// Raw bytes.
    Bytes,
    /// Milliseconds since the Unix epoch.
    DateTime,
    /// Any value.
    Any,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub ty: ColumnType,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

/// One column of an index with its sort direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    /// Column name.
    pub name: String,
    /// Sort direction.
    pub order: Order,
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    name: String,
    table: String,
    columns: Vec<IndexColumn>,
    unique: bool,
    auto_increment: bool,
    nullable: bool,
}

impl IndexSpec {
    /// Returns the qualified index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the indexed columns.
    #[must_use]
    pub fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    /// Returns the per-column sort directions.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.columns.iter().map(|c| c.order).collect()
    }

    /// Returns whether the index rejects duplicate keys.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Returns whether this is an auto-increment primary key.
    #[must_use]
    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Returns whether any indexed column is nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Returns the leading column name.
    #[must_use]
    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(|c| c.name.as_str())
    }
}

/// Action taken on child rows when a referenced parent row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    /// Reject the parent change while children reference it.
    Restrict,
    /// Propagate the change to the children.
    Cascade,
}

/// A foreign key definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeySpec {
    /// Qualified name.
    pub name: String,
    /// Child table.
    pub table: String,
    /// Child column.
    pub column: String,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced column. Must carry a single-column unique index.
    pub parent_column: String,
    /// Action on parent update or removal.
    pub action: ForeignKeyAction,
}

/// A table definition.
///
/// # Example
///
/// ```rust
/// use tessera_core::{ColumnType, Order, TableSchema};
///
/// let table = TableSchema::new("Task")
///     .column("id", ColumnType::Text)
///     .column("done", ColumnType::Bool)
///     .nullable_column("due", ColumnType::DateTime)
///     .primary_key(&["id"])
///     .index("idxDue", &[("due", Order::Desc)]);
///
/// assert_eq!(table.primary_key_spec().unwrap().name(), "Task.pkTask");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
    primary_key: Option<IndexSpec>,
    indices: Vec<IndexSpec>,
    foreign_keys: Vec<ForeignKeySpec>,
}

impl TableSchema {
    /// Starts a table definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            indices: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a non-nullable column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Adds a nullable column.
    #[must_use]
    pub fn nullable_column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
            nullable: true,
        });
        self
    }

    /// Declares the primary key over `columns`, ascending.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(self.spec(
            format!("pk{}", self.name),
            columns.iter().map(|c| (*c, Order::Asc)),
            true,
        ));
        self
    }

    /// Declares an auto-increment primary key over a single integer column.
    ///
    /// Inserting `Null` or `0` into the column assigns the next key.
    #[must_use]
    pub fn auto_increment_key(mut self, column: &str) -> Self {
        let mut spec = self.spec(
            format!("pk{}", self.name),
            [(column, Order::Asc)].into_iter(),
            true,
        );
        spec.auto_increment = true;
        self.primary_key = Some(spec);
        self
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, name: &str, columns: &[(&str, Order)]) -> Self {
        let spec = self.spec(name.to_string(), columns.iter().copied(), false);
        self.indices.push(spec);
        self
    }

    /// Adds a unique secondary index.
    #[must_use]
    pub fn unique_index(mut self, name: &str, columns: &[(&str, Order)]) -> Self {
        let spec = self.spec(name.to_string(), columns.iter().copied(), true);
        self.indices.push(spec);
        self
    }

    /// Adds a foreign key from `column` to `parent_table.parent_column`.
    #[must_use]
    pub fn foreign_key(
        mut self,
        name: &str,
        column: &str,
        parent_table: &str,
        parent_column: &str,
        action: ForeignKeyAction,
    ) -> Self {
        self.foreign_keys.push(ForeignKeySpec {
            name: format!("{}.{}", self.name, name),
            table: self.name.clone(),
            column: column.to_string(),
            parent_table: parent_table.to_string(),
            parent_column: parent_column.to_string(),
            action,
        });
        self
    }

    fn spec<'a>(
        &self,
        name: String,
        columns: impl Iterator<Item = (&'a str, Order)>,
        unique: bool,
    ) -> IndexSpec {
        IndexSpec {
            name: format!("{}.{}", self.name, name),
            table: self.name.clone(),
            columns: columns
                .map(|(name, order)| IndexColumn {
                    name: name.to_string(),
                    order,
                })
                .collect(),
            unique,
            auto_increment: false,
            nullable: false,
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column_def(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns whether the table has `column`.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_def(name).is_some()
    }

    /// Returns the primary key index, if declared.
    #[must_use]
    pub fn primary_key_spec(&self) -> Option<&IndexSpec> {
        self.primary_key.as_ref()
    }

    /// Returns the secondary indices.
    #[must_use]
    pub fn indices(&self) -> &[IndexSpec] {
        &self.indices
    }

    /// Returns the primary key followed by the secondary indices.
    pub fn all_indices(&self) -> impl Iterator<Item = &IndexSpec> {
        self.primary_key.iter().chain(self.indices.iter())
    }

    /// Returns the foreign keys declared on this table.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKeySpec] {
        &self.foreign_keys
    }

    /// Returns the name of the implicit row-id index.
    #[must_use]
    pub fn row_id_index_name(&self) -> String {
        format!("{}.#", self.name)
    }

    /// Returns a single-column unique index over `column`, if any.
    #[must_use]
    pub fn unique_index_on(&self, column: &str) -> Option<&IndexSpec> {
        self.all_indices()
            .find(|spec| spec.unique && spec.columns.len() == 1 && spec.columns[0].name == column)
    }

    fn validate(&mut self) -> CoreResult<()> {
        let mut names = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name.as_str()) {
                return Err(CoreError::validation(
                    DUPLICATE_NAME,
                    [format!("{}.{}", self.name, column.name)],
                ));
            }
        }

        let nullable: HashSet<String> = self
            .columns
            .iter()
            .filter(|c| c.nullable)
            .map(|c| c.name.clone())
            .collect();
        let columns: HashMap<String, ColumnType> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.ty))
            .collect();

        let mut index_names = HashSet::new();
        let table = self.name.clone();
        for spec in self.primary_key.iter_mut().chain(self.indices.iter_mut()) {
            if !index_names.insert(spec.name.clone()) {
                return Err(CoreError::validation(DUPLICATE_NAME, [&spec.name]));
            }
            if spec.columns.is_empty() {
                return Err(CoreError::validation(INVALID_REFERENCE, [&spec.name]));
            }
            for column in &spec.columns {
                if !columns.contains_key(&column.name) {
                    return Err(CoreError::validation(
                        INVALID_REFERENCE,
                        [&spec.name, &column.name],
                    ));
                }
            }
            if spec.auto_increment {
                let integer = spec.columns.len() == 1
                    && columns.get(&spec.columns[0].name) == Some(&ColumnType::Integer);
                if !integer {
                    return Err(CoreError::validation(
                        INVALID_REFERENCE,
                        [spec.name.as_str(), "auto increment"],
                    ));
                }
            }
            spec.nullable = spec.columns.iter().any(|c| nullable.contains(&c.name));
        }

        let mut fk_names = HashSet::new();
        for fk in &self.foreign_keys {
            if !fk_names.insert(fk.name.as_str()) {
                return Err(CoreError::validation(DUPLICATE_NAME, [&fk.name]));
            }
            if !columns.contains_key(&fk.column) {
                return Err(CoreError::validation(
                    INVALID_REFERENCE,
                    [&fk.name, &fk.column],
                ));
            }
        }

        tracing::trace!(table = %table, "table schema validated");
        Ok(())
    }
}

/// A validated database schema.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: Vec<TableSchema>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    /// Validates and builds a schema.
    ///
    /// # Errors
    ///
    /// Returns a validation error for duplicate table, column, index or
    /// foreign key names, for indices over unknown columns, and for foreign
    /// keys whose parent column has no single-column unique index.
    pub fn new(tables: Vec<TableSchema>) -> CoreResult<Self> {
        let mut by_name = HashMap::new();
        let mut tables = tables;
        for (position, table) in tables.iter_mut().enumerate() {
            if by_name.insert(table.name.clone(), position).is_some() {
                return Err(CoreError::validation(DUPLICATE_NAME, [&table.name]));
            }
            table.validate()?;
        }

        let schema = Self { tables, by_name };
        for table in &schema.tables {
            for fk in &table.foreign_keys {
                let parent = schema.by_name.get(&fk.parent_table).map(|&i| &schema.tables[i]);
                let Some(parent) = parent else {
                    return Err(CoreError::validation(
                        INVALID_REFERENCE,
                        [&fk.name, &fk.parent_table],
                    ));
                };
                if parent.unique_index_on(&fk.parent_column).is_none() {
                    return Err(CoreError::validation(
                        INVALID_REFERENCE,
                        [&fk.name, &fk.parent_column],
                    ));
                }
            }
        }
        Ok(schema)
    }

    /// Looks up a table.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (101) for unknown tables.
    pub fn table(&self, name: &str) -> CoreResult<&TableSchema> {
        self.by_name
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| CoreError::table_not_found(name))
    }

    /// Returns all tables in declaration order.
    #[must_use]
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Returns every table name.
    #[must_use]
    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Returns the foreign keys that reference `parent`.
    #[must_use]
    pub fn referencing(&self, parent: &str) -> Vec<&ForeignKeySpec> {
        self.tables
            .iter()
            .flat_map(|t| t.foreign_keys.iter())
            .filter(|fk| fk.parent_table == parent)
            .collect()
    }

    /// Returns the tables with a foreign key referencing `table`.
    #[must_use]
    pub fn child_tables(&self, table: &str) -> BTreeSet<String> {
        self.referencing(table)
            .into_iter()
            .map(|fk| fk.table.clone())
            .collect()
    }

    /// Returns the tables referenced by foreign keys of `table`.
    #[must_use]
    pub fn parent_tables(&self, table: &str) -> BTreeSet<String> {
        self.by_name
            .get(table)
            .map(|&i| {
                self.tables[i]
                    .foreign_keys
                    .iter()
                    .map(|fk| fk.parent_table.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns `table` and every table that transitively references it.
    #[must_use]
    pub fn descendant_tables(&self, table: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![table.to_string()];
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.child_tables(&next));
            }
        }
        seen
    }
}
