//! Property-based test generators using proptest.
//!
//! Provides strategies for values, payloads and write sequences against the
//! [`item_schema`](crate::fixtures::item_schema) table.

use proptest::prelude::*;
use tessera_core::{Payload, Value};

/// Strategy for any value, nulls included.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::Number),
        "[a-z]{0,8}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        any::<i64>().prop_map(Value::DateTime),
    ]
}

/// Strategy for payloads with up to `max_columns` short column names.
pub fn payload_strategy(max_columns: usize) -> impl Strategy<Value = Payload> {
    prop::collection::btree_map("[a-z]{1,6}", value_strategy(), 0..=max_columns)
}

/// Strategy for item ids drawn from a small pool, so writes collide.
pub fn item_id_strategy() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("item-{n}"))
}

/// Strategy for nullable item prices.
pub fn price_strategy() -> impl Strategy<Value = Option<f64>> {
    prop::option::of((0u32..1000).prop_map(|cents| f64::from(cents) / 100.0))
}

/// A write against the `Item` table.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOp {
    /// Inserts a new item; fails if the id exists.
    Insert {
        /// Item id.
        id: String,
        /// Item price.
        price: Option<f64>,
    },
    /// Inserts or replaces an item.
    Upsert {
        /// Item id.
        id: String,
        /// Item price.
        price: Option<f64>,
    },
    /// Sets the price of an item, if it exists.
    Update {
        /// Item id.
        id: String,
        /// New price.
        price: Option<f64>,
    },
    /// Removes an item, if it exists.
    Remove {
        /// Item id.
        id: String,
    },
}

/// Strategy for a single item write.
pub fn item_op_strategy() -> impl Strategy<Value = ItemOp> {
    prop_oneof![
        (item_id_strategy(), price_strategy()).prop_map(|(id, price)| ItemOp::Insert { id, price }),
        (item_id_strategy(), price_strategy()).prop_map(|(id, price)| ItemOp::Upsert { id, price }),
        (item_id_strategy(), price_strategy()).prop_map(|(id, price)| ItemOp::Update { id, price }),
        item_id_strategy().prop_map(|id| ItemOp::Remove { id }),
    ]
}

/// Strategy for a sequence of item writes.
pub fn item_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<ItemOp>> {
    prop::collection::vec(item_op_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn payload_respects_column_bound(payload in payload_strategy(4)) {
            prop_assert!(payload.len() <= 4);
        }

        #[test]
        fn item_ids_come_from_the_pool(id in item_id_strategy()) {
            prop_assert!(id.starts_with("item-"));
        }
    }
}
