//! Query planner - converts SQL text to logical and physical plans.
//!
//! The planner is the entry point for query optimization. Passes run in a
//! fixed order: bind, rewrite, decorrelate, order joins, select physical
//! operators, validate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use super::binder::Binder;
use super::decorrelate::Decorrelator;
use super::error::PlanResult;
use super::join_order::JoinOrderer;
use super::logical::LogicalPlan;
use super::optimizer::Optimizer;
use super::physical::PhysicalPlan;
use super::scope::ScopeTree;
use super::select::PhysicalSelector;
use super::validate::validate;
use crate::catalog::{CatalogReader, BASELINE_ROW_ESTIMATE};
use crate::sql::{Parser, Query};

/// Planner switches. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    /// Row estimate used for tables without statistics.
    pub baseline_row_estimate: u64,
    pub enable_decorrelation: bool,
    pub enable_merge_join: bool,
    pub enable_lookup_join: bool,
    pub enable_hash_join: bool,
    pub max_optimizer_iterations: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            baseline_row_estimate: BASELINE_ROW_ESTIMATE,
            enable_decorrelation: true,
            enable_merge_join: true,
            enable_lookup_join: true,
            enable_hash_join: true,
            max_optimizer_iterations: 10,
        }
    }
}

/// The query planner.
pub struct QueryPlanner {
    options: PlannerOptions,
    optimizer: Optimizer,
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new(PlannerOptions::default())
    }
}

impl QueryPlanner {
    /// Create a new query planner.
    pub fn new(options: PlannerOptions) -> Self {
        let optimizer = Optimizer::new().with_max_iterations(options.max_optimizer_iterations);
        Self { options, optimizer }
    }

    /// Create a planner with a custom optimizer.
    pub fn with_optimizer(options: PlannerOptions, optimizer: Optimizer) -> Self {
        Self { options, optimizer }
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// Parse and plan a single SELECT statement.
    pub fn plan_sql(&self, catalog: &dyn CatalogReader, sql: &str) -> PlanResult<QueryPlan> {
        let query = Parser::parse_query(sql)?;
        self.plan(catalog, &query)
    }

    /// Plan a parsed query against one catalog snapshot.
    pub fn plan(&self, catalog: &dyn CatalogReader, query: &Query) -> PlanResult<QueryPlan> {
        let bound = {
            let _span = info_span!("bind").entered();
            Binder::new(catalog, self.options.baseline_row_estimate).bind(query)?
        };

        let logical = {
            let _span = info_span!("optimize").entered();
            self.optimizer.optimize(&bound.plan)?
        };

        let logical = if self.options.enable_decorrelation {
            let _span = info_span!("decorrelate").entered();
            Decorrelator::new().rewrite(&logical)?
        } else {
            debug!("decorrelation disabled, subqueries run per row");
            logical
        };

        let logical = {
            let _span = info_span!("join_order").entered();
            let orderer = JoinOrderer::new(&bound.scopes);
            let ordered = orderer.reorder(&logical)?;
            orderer.validate_hints(&bound.plan, &ordered)?;
            ordered
        };

        let root = {
            let _span = info_span!("select").entered();
            let pinned = (0..bound.scopes.len()).filter(|&s| bound.scopes.hint(s).is_some());
            PhysicalSelector::new(catalog, &self.options)
                .with_pinned_scopes(pinned)
                .select(&logical)?
        };

        {
            let _span = info_span!("validate").entered();
            validate(&root, &logical)?;
        }

        let physical = PhysicalPlan::new(root, bound.column_names);
        debug!(
            cost = physical.total_cost(),
            rows = physical.estimated_rows(),
            joins = ?physical.join_types(),
            "planned statement"
        );
        Ok(QueryPlan {
            logical,
            physical,
            scopes: bound.scopes,
        })
    }

    /// Explain a query plan.
    pub fn explain(&self, catalog: &dyn CatalogReader, sql: &str) -> PlanResult<String> {
        let plan = self.plan_sql(catalog, sql)?;
        Ok(format!(
            "=== Logical Plan ===\n{}\n=== Physical Plan ===\n{}",
            plan.logical, plan.physical
        ))
    }
}

/// A complete query plan with both logical and physical representations.
#[derive(Debug)]
pub struct QueryPlan {
    pub logical: Arc<LogicalPlan>,
    pub physical: PhysicalPlan,
    pub scopes: ScopeTree,
}

impl QueryPlan {
    /// Get the estimated cost.
    pub fn estimated_cost(&self) -> f64 {
        self.physical.total_cost()
    }

    /// Get the estimated row count.
    pub fn estimated_rows(&self) -> usize {
        self.physical.estimated_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogSnapshot, DataType, SchemaBuilder};
    use crate::planner::error::{HintError, PlanError};
    use crate::planner::physical::JoinType;

    fn setup() -> CatalogSnapshot {
        let catalog = Catalog::new();
        for (table, a, b) in [("xy", "x", "y"), ("uv", "u", "v")] {
            catalog
                .create_table(
                    SchemaBuilder::new(table)
                        .add_column(a, DataType::Integer)
                        .add_column(b, DataType::Integer)
                        .primary_key(a)
                        .build()
                        .unwrap(),
                )
                .unwrap();
            catalog.record_row_count(table, 4);
        }
        catalog.snapshot()
    }

    #[test]
    fn test_plan_simple_select() {
        let plan = QueryPlanner::default()
            .plan_sql(&setup(), "select x from xy where y > 1")
            .unwrap();
        assert_eq!(plan.physical.column_names, vec!["x"]);
        assert!(plan.estimated_cost() > 0.0);
        assert!(plan.physical.join_types().is_empty());
    }

    #[test]
    fn test_explain() {
        let text = QueryPlanner::default()
            .explain(&setup(), "select * from xy where y - 1 in (select u from uv)")
            .unwrap();
        assert!(text.contains("=== Logical Plan ==="));
        assert!(text.contains("Join: SEMI"), "{}", text);
        assert!(text.contains("SemiLookupJoin"), "{}", text);
    }

    #[test]
    fn test_decorrelation_can_be_disabled() {
        let options = PlannerOptions {
            enable_decorrelation: false,
            ..PlannerOptions::default()
        };
        let plan = QueryPlanner::new(options)
            .plan_sql(&setup(), "select * from xy where y - 1 in (select u from uv)")
            .unwrap();
        assert!(plan.physical.join_types().is_empty());
        assert!(plan.physical.to_string().contains("Subquery#0"), "{}", plan.physical);
    }

    #[test]
    fn test_hint_errors_are_user_facing() {
        let err = QueryPlanner::default()
            .plan_sql(&setup(), "select /*+ JOIN_ORDER(xy, zz) */ * from xy, uv")
            .unwrap_err();
        assert!(matches!(
            &err,
            PlanError::Hint(HintError::UnknownRelation { name, .. }) if name == "zz"
        ));
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_table_not_found() {
        let err = QueryPlanner::default()
            .plan_sql(&setup(), "select * from missing")
            .unwrap_err();
        assert!(matches!(err, PlanError::TableNotFound(_)));
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: PlannerOptions = serde_json::from_str(r#"{"enable_hash_join": false}"#).unwrap();
        assert!(!options.enable_hash_join);
        assert!(options.enable_merge_join);
        assert_eq!(options.baseline_row_estimate, 1000);

        let plan = QueryPlanner::new(options)
            .plan_sql(&setup(), "select * from xy inner join uv on y = v")
            .unwrap();
        assert_eq!(plan.physical.join_types(), vec![JoinType::Inner]);
    }
}
