//! Query execution errors.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for query execution.
pub type ExecuteResult<T> = Result<T, ExecuteError>;

/// Query execution errors.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("scalar subquery #{0} returned more than one row")]
    ScalarSubqueryRows(usize),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecuteError {
    /// Errors caused by the data or the statement rather than by the plan.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ExecuteError::ScalarSubqueryRows(_)
                | ExecuteError::TypeMismatch { .. }
                | ExecuteError::DivisionByZero
        )
    }
}
