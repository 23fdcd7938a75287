//! Rows.

use crate::error::CoreResult;
use crate::types::RowId;
use crate::value::{Payload, Value};
use serde::{Deserialize, Serialize};

static NULL: Value = Value::Null;

/// A stored row: a stable id and an ordered payload.
///
/// Once committed, rows are shared as `Arc<Row>` and never mutated in place.
/// An update stages a fresh clone and swaps it in at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    id: RowId,
    payload: Payload,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub fn new(id: RowId, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// Returns the row id.
    #[must_use]
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the payload for modification.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Returns the value of `column`, or `Null` if the column is absent.
    #[must_use]
    pub fn get(&self, column: &str) -> &Value {
        self.payload.get(column).unwrap_or(&NULL)
    }

    /// Sets the value of `column`.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.payload.insert(column.into(), value.into());
    }

    /// Returns a copy of this row with a different payload.
    #[must_use]
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            id: self.id,
            payload,
        }
    }

    /// Encodes the row as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a row from CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a valid encoded row.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }
}
