//! Index partitions for index-aware backing stores.
//!
//! A partition is a list of rows. The first row is a metadata record whose
//! `kind` column tags the structural kind (`ROW_ID` or `BTREE`); each
//! following row holds one entry as `key.0 .. key.n` columns plus `rowId`.

use crate::error::{CoreError, CoreResult};
use crate::index::key::Key;
use crate::index::traits::{Index, IndexKind};
use crate::payload;
use crate::row::Row;
use crate::types::RowId;
use crate::value::{Payload, Value};

const KIND_COLUMN: &str = "kind";
const NAME_COLUMN: &str = "name";
const ROW_ID_COLUMN: &str = "rowId";

fn key_column(position: usize) -> String {
    format!("key.{position}")
}

/// Writes `index` as a partition.
#[must_use]
pub fn serialize_index(index: &dyn Index) -> Vec<Row> {
    let mut rows = Vec::with_capacity(index.stats().total_rows + 1);
    rows.push(Row::new(
        RowId(0),
        payload! {
            KIND_COLUMN => index.kind().as_str(),
            NAME_COLUMN => index.name(),
        },
    ));

    for (position, (key, row_id)) in index.entries().into_iter().enumerate() {
        let mut entry = Payload::new();
        for (i, value) in key.values().iter().enumerate() {
            entry.insert(key_column(i), value.clone());
        }
        entry.insert(ROW_ID_COLUMN.to_string(), Value::Integer(row_id.0 as i64));
        rows.push(Row::new(RowId(position as u64 + 1), entry));
    }
    rows
}

/// Rebuilds an index from a partition.
///
/// `template` supplies the name, comparator and uniqueness; its contents
/// are discarded.
///
/// # Errors
///
/// Returns a codec error if the metadata row is missing, tags an unknown
/// kind, or disagrees with the template's kind, or if an entry row has no
/// row id. Returns a constraint error if the entries violate uniqueness.
pub fn deserialize_index(template: &dyn Index, rows: &[Row]) -> CoreResult<Box<dyn Index>> {
    let Some((meta, entries)) = rows.split_first() else {
        return Err(CoreError::codec(format!(
            "index partition {} has no metadata row",
            template.name()
        )));
    };
    let tag = meta.get(KIND_COLUMN).as_str().unwrap_or_default();
    let kind = IndexKind::parse(tag).ok_or_else(|| {
        CoreError::codec(format!(
            "index partition {} has unknown kind '{tag}'",
            template.name()
        ))
    })?;
    if kind != template.kind() {
        return Err(CoreError::codec(format!(
            "index partition {} is {kind}, expected {}",
            template.name(),
            template.kind()
        )));
    }

    let mut index = template.clone_box();
    index.clear();
    for entry in entries {
        let mut values = Vec::new();
        while let Some(value) = entry.payload().get(&key_column(values.len())) {
            values.push(value.clone());
        }
        let row_id = entry
            .get(ROW_ID_COLUMN)
            .as_i64()
            .filter(|id| *id >= 0)
            .ok_or_else(|| {
                CoreError::codec(format!(
                    "index partition {} has an entry without row id",
                    template.name()
                ))
            })?;
        index.add(Key::new(values), RowId(row_id as u64))?;
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::btree::BTreeIndex;
    use crate::index::key::{Comparator, KeyRange};
    use crate::index::row_id::RowIdIndex;
    use crate::types::Order;

    fn composite() -> BTreeIndex {
        let mut index = BTreeIndex::new(
            "T.idxPair",
            Comparator::NullAware(vec![Order::Asc, Order::Desc]),
            false,
        );
        index
            .add(Key::new(vec![Value::from("a"), Value::Integer(2)]), RowId(1))
            .unwrap();
        index
            .add(Key::new(vec![Value::from("a"), Value::Null]), RowId(2))
            .unwrap();
        index
            .add(Key::new(vec![Value::from("b"), Value::Integer(1)]), RowId(3))
            .unwrap();
        index
    }

    #[test]
    fn first_row_tags_the_kind() {
        let rows = serialize_index(&composite());
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].get("kind").as_str(), Some("BTREE"));
        assert_eq!(rows[1].get("key.0").as_str(), Some("a"));

        let rows = serialize_index(&RowIdIndex::new("T.#"));
        assert_eq!(rows[0].get("kind").as_str(), Some("ROW_ID"));
    }

    #[test]
    fn partition_rebuilds_equivalent_index() {
        let original = composite();
        let empty = BTreeIndex::new(
            "T.idxPair",
            Comparator::NullAware(vec![Order::Asc, Order::Desc]),
            false,
        );

        let restored = deserialize_index(&empty, &serialize_index(&original)).unwrap();
        assert_eq!(restored.entries(), original.entries());
        assert_eq!(restored.stats().total_rows, 3);
        assert_eq!(
            restored.get_range(&[KeyRange::all()], false, None, 0),
            original.get_range(&[KeyRange::all()], false, None, 0)
        );
    }

    #[test]
    fn bad_partitions_are_rejected() {
        let template = RowIdIndex::new("T.#");
        assert!(matches!(
            deserialize_index(&template, &[]),
            Err(CoreError::Codec { .. })
        ));

        let unknown = vec![Row::new(RowId(0), payload! { "kind" => "HASH" })];
        assert!(deserialize_index(&template, &unknown).is_err());

        let mismatched = serialize_index(&composite());
        assert!(deserialize_index(&template, &mismatched).is_err());
    }
}
