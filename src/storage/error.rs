//! Storage layer error types.

use thiserror::Error;

use crate::catalog::SchemaError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the in-memory table stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested table was not found
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// the table already exists
    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    /// the requested index was not found on the table
    #[error("index not found: table={table}, index={index}")]
    IndexNotFound { table: String, index: String },

    /// a unique index already holds the key
    #[error("duplicate key in {table}.{index}: {key}")]
    DuplicateKey {
        table: String,
        index: String,
        key: String,
    },

    /// the row does not fit the table schema
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}
