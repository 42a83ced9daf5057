//! Rule-based rewrites applied to the bound logical plan.
//!
//! Rules run to a fixpoint before decorrelation, over the outer query and
//! every subquery plan.

use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use super::error::PlanResult;
use super::expr::{ScalarExpr, SubqueryExpr, SubqueryKind};
use super::logical::LogicalPlan;

/// Optimization rule trait.
pub trait OptimizationRule: Send + Sync {
    /// Name of the rule.
    fn name(&self) -> &str;

    /// Apply the rule to a logical plan, returning a potentially optimized plan.
    fn apply(&self, plan: &LogicalPlan) -> Option<LogicalPlan>;
}

fn is_true(expr: &ScalarExpr) -> bool {
    matches!(expr, ScalarExpr::Literal(Value::Bool(true)))
}

/// Drops conjuncts that are literally TRUE.
pub struct ConstantFolding;

impl OptimizationRule for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn apply(&self, plan: &LogicalPlan) -> Option<LogicalPlan> {
        match plan {
            LogicalPlan::Filter { input, predicate } => {
                let conjuncts = predicate.clone().split_conjuncts();
                if !conjuncts.iter().any(is_true) {
                    return None;
                }
                match ScalarExpr::conjoin(conjuncts.into_iter().filter(|c| !is_true(c))) {
                    Some(predicate) => Some(LogicalPlan::Filter {
                        input: Arc::clone(input),
                        predicate,
                    }),
                    None => Some(input.as_ref().clone()),
                }
            }
            LogicalPlan::Join {
                kind,
                left,
                right,
                predicate: Some(predicate),
                scalar_guard,
                scope,
            } => {
                let conjuncts = predicate.clone().split_conjuncts();
                if !conjuncts.iter().any(is_true) {
                    return None;
                }
                Some(LogicalPlan::Join {
                    kind: *kind,
                    left: Arc::clone(left),
                    right: Arc::clone(right),
                    predicate: ScalarExpr::conjoin(conjuncts.into_iter().filter(|c| !is_true(c))),
                    scalar_guard: *scalar_guard,
                    scope: *scope,
                })
            }
            _ => None,
        }
    }
}

/// Collapses a filter directly over another filter.
pub struct MergeFilters;

impl OptimizationRule for MergeFilters {
    fn name(&self) -> &str {
        "MergeFilters"
    }

    fn apply(&self, plan: &LogicalPlan) -> Option<LogicalPlan> {
        let LogicalPlan::Filter { input, predicate } = plan else {
            return None;
        };
        let LogicalPlan::Filter {
            input: inner_input,
            predicate: inner_predicate,
        } = input.as_ref()
        else {
            return None;
        };
        Some(LogicalPlan::Filter {
            input: Arc::clone(inner_input),
            predicate: ScalarExpr::and(inner_predicate.clone(), predicate.clone()),
        })
    }
}

/// The query optimizer.
pub struct Optimizer {
    rules: Vec<Box<dyn OptimizationRule>>,
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Create a new optimizer with default rules.
    pub fn new() -> Self {
        Self {
            rules: vec![Box::new(ConstantFolding), Box::new(MergeFilters)],
            max_iterations: 10,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Add a custom optimization rule.
    pub fn add_rule(&mut self, rule: Box<dyn OptimizationRule>) {
        self.rules.push(rule);
    }

    /// Optimize a logical plan.
    pub fn optimize(&self, plan: &Arc<LogicalPlan>) -> PlanResult<Arc<LogicalPlan>> {
        let mut current = Arc::clone(plan);

        for iteration in 0..self.max_iterations {
            let mut changed = false;
            let optimized = self.apply_rules_recursive(&current, &mut changed)?;
            if !changed {
                break;
            }
            trace!(iteration, "optimizer pass changed the plan");
            current = optimized;
        }

        Ok(current)
    }

    fn apply_rules_recursive(
        &self,
        plan: &Arc<LogicalPlan>,
        changed: &mut bool,
    ) -> PlanResult<Arc<LogicalPlan>> {
        let mut current = Arc::clone(plan);
        for rule in &self.rules {
            if let Some(optimized) = rule.apply(&current) {
                trace!(rule = rule.name(), "rule applied");
                *changed = true;
                current = Arc::new(optimized);
            }
        }

        let children = current
            .children()
            .into_iter()
            .map(|c| self.apply_rules_recursive(c, changed))
            .collect::<PlanResult<Vec<_>>>()?;
        let node = current.with_children(children);
        let node = node.map_expressions(&mut |e| self.optimize_subqueries(e, changed))?;
        Ok(Arc::new(node))
    }

    fn optimize_subqueries(&self, expr: &ScalarExpr, changed: &mut bool) -> PlanResult<ScalarExpr> {
        expr.try_transform(&mut |e| match e {
            ScalarExpr::Subquery(sub) => {
                let plan = self.apply_rules_recursive(&sub.plan, changed)?;
                let kind = match &sub.kind {
                    SubqueryKind::In { operand } => SubqueryKind::In {
                        operand: Box::new(self.optimize_subqueries(operand, changed)?),
                    },
                    other => other.clone(),
                };
                Ok(Some(ScalarExpr::Subquery(Box::new(SubqueryExpr {
                    plan,
                    kind,
                    ..SubqueryExpr::clone(sub)
                }))))
            }
            _ => Ok(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sql::BinaryOperator;

    fn scan() -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Scan {
            table: "xy".to_string(),
            relation: "xy".to_string(),
            name: "xy".to_string(),
            columns: vec!["x".to_string(), "y".to_string()],
            estimate: 4,
            scope: 0,
        })
    }

    fn filter(input: Arc<LogicalPlan>, predicate: ScalarExpr) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Filter { input, predicate })
    }

    fn x_gt(n: i64) -> ScalarExpr {
        ScalarExpr::binary(
            ScalarExpr::column("xy", "x"),
            BinaryOperator::Gt,
            ScalarExpr::literal(json!(n)),
        )
    }

    #[test]
    fn test_constant_folding_true() {
        let plan = filter(scan(), ScalarExpr::literal(json!(true)));
        let result = ConstantFolding.apply(&plan).unwrap();
        assert!(matches!(result, LogicalPlan::Scan { .. }));

        let plan = filter(scan(), ScalarExpr::and(ScalarExpr::literal(json!(true)), x_gt(1)));
        let result = ConstantFolding.apply(&plan).unwrap();
        assert_eq!(result.to_string().lines().next(), Some("Filter: xy.x > 1"));
    }

    #[test]
    fn test_constant_folding_leaves_false() {
        let plan = filter(scan(), ScalarExpr::literal(json!(false)));
        assert!(ConstantFolding.apply(&plan).is_none());
    }

    #[test]
    fn test_optimizer_merges_filters_to_fixpoint() {
        let plan = filter(
            filter(filter(scan(), x_gt(1)), ScalarExpr::literal(json!(true))),
            x_gt(2),
        );
        let result = Optimizer::new().optimize(&plan).unwrap();
        match result.as_ref() {
            LogicalPlan::Filter { input, predicate } => {
                assert!(matches!(input.as_ref(), LogicalPlan::Scan { .. }));
                assert_eq!(predicate.to_string(), "(xy.x > 1) AND (xy.x > 2)");
            }
            other => panic!("expected a single filter, got {}", other),
        }
    }
}
