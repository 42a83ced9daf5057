//! Planning errors.

use thiserror::Error;

use super::scope::ScopeId;
use crate::catalog::SchemaError;
use crate::sql::ParseError;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// A `JOIN_ORDER` hint that cannot be honored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HintError {
    #[error("JOIN_ORDER in scope {scope} names unknown relation '{name}'")]
    UnknownRelation { scope: ScopeId, name: String },

    #[error("JOIN_ORDER in scope {scope} omits relation '{name}'")]
    MissingRelation { scope: ScopeId, name: String },

    #[error("JOIN_ORDER in scope {scope} names relation '{name}' more than once")]
    DuplicateRelation { scope: ScopeId, name: String },

    #[error("JOIN_ORDER in scope {scope} places '{name}' before {reason}")]
    Unsatisfiable {
        scope: ScopeId,
        name: String,
        reason: String,
    },
}

impl HintError {
    /// The relation the error is about.
    pub fn relation(&self) -> &str {
        match self {
            HintError::UnknownRelation { name, .. }
            | HintError::MissingRelation { name, .. }
            | HintError::DuplicateRelation { name, .. }
            | HintError::Unsatisfiable { name, .. } => name,
        }
    }
}

/// Query planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("invalid hint: {0}")]
    Hint(#[from] HintError),

    /// An index picked for a keyed join does not match its keys.
    #[error("index {index} on {table} is inconsistent with the join: {reason}")]
    IndexConsistency {
        table: String,
        index: String,
        reason: String,
    },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("ambiguous column: {0}")]
    AmbiguousColumn(String),

    #[error("duplicate relation name: {0}")]
    DuplicateRelation(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PlanError {
    /// Errors caused by the statement text rather than a planner bug.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            PlanError::IndexConsistency { .. } | PlanError::InvalidPlan(_) | PlanError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_error_names_relation() {
        let err: PlanError = HintError::UnknownRelation {
            scope: 1,
            name: "zz".into(),
        }
        .into();
        assert!(err.is_user_facing());
        assert!(err.to_string().contains("'zz'"));
    }

    #[test]
    fn test_index_consistency_is_internal() {
        let err = PlanError::IndexConsistency {
            table: "xy".into(),
            index: "y_idx".into(),
            reason: "key column x is not an index prefix".into(),
        };
        assert!(!err.is_user_facing());
    }
}
