//! Error types for the store.

use crate::store::RowId;
use crate::types::ValueKind;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transaction state: {0}")]
    TransactionState(String),

    #[error("unique key {key} on {entity} already has an entry for this value")]
    NotUnique { entity: String, key: String },

    #[error("no row matched key {key} on {entity}")]
    NoMatch { entity: String, key: String },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("unknown field {field} on {entity}")]
    UnknownField { entity: String, field: String },

    #[error("unknown key {key} on {entity}")]
    UnknownKey { entity: String, key: String },

    #[error("kind mismatch for {field}: expected {expected:?}, got {got:?}")]
    KindMismatch {
        field: String,
        expected: ValueKind,
        got: Option<ValueKind>,
    },

    #[error("field {field} is not nullable")]
    NotNullable { field: String },

    #[error("field {field} is immutable once its row is committed")]
    Immutable { field: String },

    #[error("required field {field} not supplied on create")]
    RequiredField { field: String },

    #[error("entity {0} is not instantiable")]
    NotInstantiable(String),

    #[error("row does not exist: {0:?}")]
    RowMissing(RowId),

    #[error("row was removed: {0:?}")]
    RowRemoved(RowId),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("replication failed: {0}")]
    Replication(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
