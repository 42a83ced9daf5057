//! Query execution engine.
//!
//! Uses the Volcano/Iterator model where each operator produces
//! rows one at a time. Operators are rewound with the row context of the
//! enclosing scope, which is how correlated subqueries and lookup joins see
//! their outer rows.

mod cache;
mod error;
mod eval;
mod executor;
mod joins;
mod operators;
mod result;

pub use cache::{CacheEntry, CacheRegistry, CachedRows};
pub use error::{ExecuteError, ExecuteResult};
pub use eval::{sql_eq, truth, ExprEvaluator};
pub use executor::{ExecutionContext, QueryExecutor};
pub use operators::{build_operator, Operator, Row, RowContext};
pub use result::{ExecutionStats, ResultSet};
