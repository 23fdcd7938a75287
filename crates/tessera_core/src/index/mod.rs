//! Index management.
//!
//! This module provides:
//! - [`Key`], [`Comparator`] and [`KeyRange`] for ordered lookups
//! - [`RowIdIndex`] over the live row ids of a table
//! - [`BTreeIndex`] over keys derived from row columns
//! - [`IndexStore`], the per-database registry
//! - Partition (de)serialization for index-aware backing stores

mod btree;
mod key;
mod persistence;
mod row_id;
mod stats;
mod store;
mod traits;

pub use btree::BTreeIndex;
pub use key::{Comparator, Key, KeyRange};
pub use persistence::{deserialize_index, serialize_index};
pub use row_id::RowIdIndex;
pub use stats::IndexStats;
pub use store::IndexStore;
pub use traits::{Index, IndexKind};

pub(crate) use traits::page;
