//! Query planning and optimization.
//!
//! This module turns a parsed SELECT into a validated physical plan:
//! binding, subquery decorrelation, join order search (honoring
//! `JOIN_ORDER` hints) and physical operator selection.

pub mod binder;
pub mod decorrelate;
mod error;
pub mod expr;
pub mod join_order;
pub mod logical;
mod optimizer;
pub mod physical;
mod planner;
pub mod scope;
pub mod select;
mod validate;

pub use error::{HintError, PlanError, PlanResult};
pub use expr::{ColumnRef, ScalarExpr};
pub use logical::{JoinKind, LogicalPlan};
pub use optimizer::{OptimizationRule, Optimizer};
pub use physical::{BuildSide, IndexAccess, JoinType, PhysicalOperator, PhysicalPlan, PhysicalPlanNode};
pub use planner::{PlannerOptions, QueryPlan, QueryPlanner};
pub use scope::{ScopeId, ScopeTree};
