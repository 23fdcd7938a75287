//! Error types for Tessera core.
//!
//! Engine errors are a numeric code plus at most [`MAX_PARAMS`] short
//! parameters. The code identifies the failure; the parameters name the
//! table, column, index or key involved.

use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Maximum number of parameters carried by an engine error.
pub const MAX_PARAMS: usize = 4;

/// Maximum length, in characters, of a single error parameter.
pub const MAX_PARAM_LEN: usize = 64;

/// Table not found.
pub const TABLE_NOT_FOUND: u32 = 101;
/// Index not found.
pub const INDEX_NOT_FOUND: u32 = 102;
/// Column not found.
pub const COLUMN_NOT_FOUND: u32 = 103;
/// Row targeted by an update does not exist.
pub const ROW_NOT_FOUND: u32 = 104;
/// Table outside the declared scope.
pub const OUT_OF_SCOPE: u32 = 106;
/// Invalid transaction state transition.
pub const INVALID_STATE: u32 = 107;
/// Write attempted in a read-only transaction.
pub const READ_ONLY: u32 = 108;
/// Duplicate key on a unique index.
pub const DUPLICATE_KEY: u32 = 201;
/// Null in a non-nullable column.
pub const NOT_NULL: u32 = 202;
/// Foreign key parent row missing.
pub const FK_PARENT_MISSING: u32 = 203;
/// Foreign key restrict violation.
pub const FK_RESTRICT: u32 = 204;
/// Select without a source table.
pub const NO_SOURCE: u32 = 501;
/// Column references a table that is not part of the query.
pub const FOREIGN_COLUMN: u32 = 502;
/// Duplicate name in a schema.
pub const DUPLICATE_NAME: u32 = 503;
/// Schema references something that does not exist or cannot be used.
pub const INVALID_REFERENCE: u32 = 504;
/// Aggregates mixed with plain columns that are not grouped.
pub const AGGREGATE_MISMATCH: u32 = 505;
/// Insert without rows.
pub const EMPTY_INSERT: u32 = 506;
/// Row id above `i64::MAX`.
pub const ROW_ID_RANGE: u32 = 507;

/// Bounded parameter list attached to an engine error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorParams(Vec<String>);

impl ErrorParams {
    /// Builds a parameter list, keeping the first [`MAX_PARAMS`] items and
    /// truncating each to [`MAX_PARAM_LEN`] characters.
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self(
            items
                .into_iter()
                .take(MAX_PARAMS)
                .map(|item| item.to_string().chars().take(MAX_PARAM_LEN).collect())
                .collect(),
        )
    }

    /// Returns the parameters.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Returns the parameter at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

impl fmt::Display for ErrorParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation touched a table outside the declared scope.
    #[error("scope error {code}: {params}")]
    Scope {
        /// Error code.
        code: u32,
        /// Error parameters.
        params: ErrorParams,
    },

    /// A constraint was violated while staging a write.
    #[error("constraint error {code}: {params}")]
    Constraint {
        /// Error code.
        code: u32,
        /// Error parameters.
        params: ErrorParams,
    },

    /// A query descriptor or schema is malformed.
    #[error("validation error {code}: {params}")]
    Validation {
        /// Error code.
        code: u32,
        /// Error parameters.
        params: ErrorParams,
    },

    /// A transaction was used in a state that does not allow the operation.
    #[error("transaction error {code}: {params}")]
    Transaction {
        /// Error code.
        code: u32,
        /// Error parameters.
        params: ErrorParams,
    },

    /// A table, index, column or row does not exist.
    #[error("not found {code}: {params}")]
    NotFound {
        /// Error code.
        code: u32,
        /// Error parameters.
        params: ErrorParams,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Returns the numeric code of an engine error.
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Scope { code, .. }
            | Self::Constraint { code, .. }
            | Self::Validation { code, .. }
            | Self::Transaction { code, .. }
            | Self::NotFound { code, .. } => Some(*code),
            Self::Storage(_) | Self::Codec { .. } => None,
        }
    }

    /// Returns the parameters of an engine error.
    #[must_use]
    pub fn params(&self) -> Option<&ErrorParams> {
        match self {
            Self::Scope { params, .. }
            | Self::Constraint { params, .. }
            | Self::Validation { params, .. }
            | Self::Transaction { params, .. }
            | Self::NotFound { params, .. } => Some(params),
            Self::Storage(_) | Self::Codec { .. } => None,
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a scope error for `table`.
    pub fn out_of_scope(table: &str) -> Self {
        Self::Scope {
            code: OUT_OF_SCOPE,
            params: ErrorParams::new([table]),
        }
    }

    /// Creates a constraint error.
    pub fn constraint<I, S>(code: u32, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self::Constraint {
            code,
            params: ErrorParams::new(params),
        }
    }

    /// Creates a validation error.
    pub fn validation<I, S>(code: u32, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self::Validation {
            code,
            params: ErrorParams::new(params),
        }
    }

    /// Creates a not-found error.
    pub fn not_found<I, S>(code: u32, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self::NotFound {
            code,
            params: ErrorParams::new(params),
        }
    }

    /// Creates a transaction state error.
    pub fn invalid_state(from: impl fmt::Display, operation: &str) -> Self {
        Self::Transaction {
            code: INVALID_STATE,
            params: ErrorParams::new([from.to_string(), operation.to_string()]),
        }
    }

    /// Creates a read-only violation for `table`.
    pub fn read_only(table: &str) -> Self {
        Self::Transaction {
            code: READ_ONLY,
            params: ErrorParams::new([table]),
        }
    }

    /// Creates a table-not-found error.
    pub fn table_not_found(table: &str) -> Self {
        Self::not_found(TABLE_NOT_FOUND, [table])
    }

    /// Creates an index-not-found error.
    pub fn index_not_found(index: &str) -> Self {
        Self::not_found(INDEX_NOT_FOUND, [index])
    }

    /// Creates a column-not-found error.
    pub fn column_not_found(table: &str, column: &str) -> Self {
        Self::not_found(COLUMN_NOT_FOUND, [table, column])
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CoreError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::codec(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CoreError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_bounded() {
        let long = "x".repeat(200);
        let params = ErrorParams::new(["a", "b", long.as_str(), "d", "e", "f"]);

        assert_eq!(params.as_slice().len(), MAX_PARAMS);
        assert_eq!(params.get(2).map(str::len), Some(MAX_PARAM_LEN));
        assert_eq!(params.get(3), Some("d"));
        assert_eq!(params.get(4), None);
    }

    #[test]
    fn truncation_counts_characters() {
        let wide = "é".repeat(100);
        let params = ErrorParams::new([wide]);
        assert_eq!(params.get(0).map(|p| p.chars().count()), Some(MAX_PARAM_LEN));
    }

    #[test]
    fn codes_are_exposed() {
        let err = CoreError::constraint(DUPLICATE_KEY, ["Item.pkItem", "42"]);
        assert_eq!(err.code(), Some(201));
        assert_eq!(err.params().and_then(|p| p.get(0)), Some("Item.pkItem"));
        assert!(matches!(err, CoreError::Constraint { .. }));

        assert_eq!(CoreError::out_of_scope("Foo").code(), Some(OUT_OF_SCOPE));
        assert_eq!(CoreError::codec("bad").code(), None);
    }

    #[test]
    fn display_includes_code_and_params() {
        let err = CoreError::column_not_found("Task", "title");
        assert_eq!(err.to_string(), "not found 103: [Task, title]");
    }
}
