//! # Tessera Core
//!
//! Query processing and transaction engine for Tessera, an embedded
//! relational store.
//!
//! This crate provides:
//! - Row cache and ordered indices kept entirely in memory
//! - Journals that stage writes and check constraints before commit
//! - Logical and physical query planning with rewrite passes
//! - A runner that serializes tasks by the tables they touch
//! - Observers notified with the changes of their query results
//! - A backing store contract with in-memory and log-structured adapters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod context;
mod database;
mod error;
mod journal;
mod observer;
mod row;
mod runner;
mod schema;
mod stats;
mod transaction;
mod types;
mod value;

pub mod index;
pub mod query;
pub mod store;

pub use cache::Cache;
pub use config::Config;
pub use context::EngineContext;
pub use database::Database;
pub use error::{
    CoreError, CoreResult, ErrorParams, AGGREGATE_MISMATCH, COLUMN_NOT_FOUND, DUPLICATE_KEY,
    DUPLICATE_NAME, EMPTY_INSERT, FK_PARENT_MISSING, FK_RESTRICT, FOREIGN_COLUMN, INDEX_NOT_FOUND,
    INVALID_REFERENCE, INVALID_STATE, NOT_NULL, NO_SOURCE, OUT_OF_SCOPE, READ_ONLY, ROW_ID_RANGE,
    ROW_NOT_FOUND, TABLE_NOT_FOUND,
};
pub use journal::{Journal, JournalState, TableDiff};
pub use observer::{ChangeSet, ObserverCallback, ObserverHandle, ObserverRegistry};
pub use row::Row;
pub use runner::{Admission, Runner, Task};
pub use schema::{
    Column, ColumnType, ForeignKeyAction, ForeignKeySpec, IndexColumn, IndexSpec, Schema,
    TableSchema,
};
pub use stats::{EngineStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionState};
pub use types::{Order, RowId, TaskId, TaskPriority, TransactionKind};
pub use value::{Payload, Value};
