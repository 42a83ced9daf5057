//! Structural checks on a selected physical plan.
//!
//! Runs after selection and before anything executes. A failure here is a
//! planner bug, never a property of the statement.

use std::collections::BTreeSet;

use super::error::{PlanError, PlanResult};
use super::expr::{ColumnRef, ScalarExpr};
use super::logical::LogicalPlan;
use super::physical::{IndexAccess, JoinType, PhysicalOperator, PhysicalPlanNode};
use crate::catalog::IndexDef;

fn output_relations(node: &PhysicalPlanNode) -> BTreeSet<String> {
    node.output.iter().map(|c| c.relation.clone()).collect()
}

fn union(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    a.union(b).cloned().collect()
}

/// Check `root` against the logical plan it was selected from.
pub fn validate(root: &PhysicalPlanNode, logical: &LogicalPlan) -> PlanResult<()> {
    let expected: BTreeSet<ColumnRef> = logical.output_columns().into_iter().collect();
    let actual: BTreeSet<ColumnRef> = root.output.iter().cloned().collect();
    if expected != actual {
        let show = |cols: &BTreeSet<ColumnRef>| cols.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ");
        return Err(PlanError::InvalidPlan(format!(
            "root produces [{}], expected [{}]",
            show(&actual),
            show(&expected)
        )));
    }
    check_node(root, &BTreeSet::new())
}

/// `visible` holds the relations supplied by enclosing operators.
fn check_node(node: &PhysicalPlanNode, visible: &BTreeSet<String>) -> PlanResult<()> {
    let child_relations: BTreeSet<String> = node.children.iter().flat_map(|c| output_relations(c)).collect();
    let in_scope = union(visible, &child_relations);
    for expr in node.operator.expressions() {
        check_refs(expr, &in_scope)?;
    }
    for (_, sub) in node.subquery_plans() {
        check_node(sub, &in_scope)?;
    }

    match &node.operator {
        PhysicalOperator::CachedResults => {
            if let Some(child) = node.children.first() {
                let free = child.free_relations();
                if !free.is_empty() {
                    return Err(PlanError::InvalidPlan(format!(
                        "cached results depend on outer relations {:?}",
                        free
                    )));
                }
            }
        }
        PhysicalOperator::IndexedTableAccess {
            table,
            index,
            access,
            ..
        } => check_index_access(table, index, access)?,
        PhysicalOperator::Join { join_type, keys, .. } => {
            let [left, right] = node.children.as_slice() else {
                return Err(PlanError::InvalidPlan(format!(
                    "{} join with {} children",
                    join_type,
                    node.children.len()
                )));
            };
            let left_visible = if *join_type == JoinType::RightSemiLookup {
                union(visible, &output_relations(right))
            } else {
                visible.clone()
            };
            let right_visible = if join_type.right_sees_left() {
                union(visible, &output_relations(left))
            } else {
                visible.clone()
            };
            check_node(left, &left_visible)?;
            check_node(right, &right_visible)?;
            return check_join_access(*join_type, keys, left, right);
        }
        _ => {}
    }

    for child in &node.children {
        check_node(child, visible)?;
    }
    Ok(())
}

fn check_refs(expr: &ScalarExpr, in_scope: &BTreeSet<String>) -> PlanResult<()> {
    let orphans: Vec<String> = expr
        .relations()
        .into_iter()
        .filter(|r| !in_scope.contains(r))
        .collect();
    if orphans.is_empty() {
        Ok(())
    } else {
        Err(PlanError::InvalidPlan(format!(
            "expression {} reads relations {:?} that no input provides",
            expr, orphans
        )))
    }
}

fn inconsistent(index: &IndexDef, reason: impl Into<String>) -> PlanError {
    PlanError::IndexConsistency {
        table: index.table.clone(),
        index: index.name.clone(),
        reason: reason.into(),
    }
}

fn check_index_access(
    table: &str,
    index: &IndexDef,
    access: &IndexAccess,
) -> PlanResult<()> {
    if index.table != table {
        return Err(inconsistent(index, format!("used to read table {}", table)));
    }
    match access {
        IndexAccess::Scan => Ok(()),
        IndexAccess::Point(keys) | IndexAccess::Probe(keys) => {
            if keys.is_empty() || keys.len() > index.columns.len() {
                return Err(inconsistent(
                    index,
                    format!("{} keys for {} columns", keys.len(), index.columns.len()),
                ));
            }
            if matches!(access, IndexAccess::Point(_)) && !keys.iter().all(ScalarExpr::is_constant) {
                return Err(inconsistent(index, "point access with a non-constant key"));
            }
            Ok(())
        }
        IndexAccess::Concat(keys) => {
            if keys.is_empty() || index.columns.is_empty() {
                Err(inconsistent(index, "concat access without keys"))
            } else {
                Ok(())
            }
        }
    }
}

/// The indexed access a lookup reads through renaming layers.
fn probed_access(node: &PhysicalPlanNode) -> Option<&PhysicalOperator> {
    match &node.operator {
        PhysicalOperator::IndexedTableAccess {
            access: IndexAccess::Probe(_) | IndexAccess::Concat(_),
            ..
        } => Some(&node.operator),
        PhysicalOperator::Project { .. } | PhysicalOperator::SubqueryAlias { .. } => {
            node.children.first().and_then(|c| probed_access(c))
        }
        _ => None,
    }
}

fn check_merge_side(side: &PhysicalPlanNode, keys: &[&ScalarExpr]) -> PlanResult<()> {
    let PhysicalOperator::IndexedTableAccess {
        relation,
        index,
        access: IndexAccess::Scan,
        ..
    } = &side.operator
    else {
        return Err(PlanError::InvalidPlan(
            "merge join input is not an ordered index scan".into(),
        ));
    };
    for (position, key) in keys.iter().enumerate() {
        let matches = key.as_column().is_some_and(|c| {
            &c.relation == relation && index.columns.get(position) == Some(&c.column)
        });
        if !matches {
            return Err(inconsistent(
                index,
                format!("merge key {} is not index column {}", key, position + 1),
            ));
        }
    }
    Ok(())
}

fn check_join_access(
    join_type: JoinType,
    keys: &[(ScalarExpr, ScalarExpr)],
    left: &PhysicalPlanNode,
    right: &PhysicalPlanNode,
) -> PlanResult<()> {
    match join_type {
        JoinType::Merge | JoinType::LeftOuterMerge => {
            if keys.is_empty() {
                return Err(PlanError::InvalidPlan("merge join without keys".into()));
            }
            let left_keys: Vec<&ScalarExpr> = keys.iter().map(|(l, _)| l).collect();
            let right_keys: Vec<&ScalarExpr> = keys.iter().map(|(_, r)| r).collect();
            check_merge_side(left, &left_keys)?;
            check_merge_side(right, &right_keys)
        }
        JoinType::Lookup | JoinType::LeftOuterLookup | JoinType::SemiLookup | JoinType::AntiLookup => {
            match probed_access(right) {
                Some(_) => Ok(()),
                None => Err(PlanError::InvalidPlan(format!(
                    "{} join without an index probe on its right side",
                    join_type
                ))),
            }
        }
        JoinType::RightSemiLookup => match &left.operator {
            PhysicalOperator::IndexedTableAccess {
                index,
                access: IndexAccess::Probe(probe),
                ..
            } => {
                if index.unique && probe.len() == index.columns.len() {
                    Ok(())
                } else {
                    Err(inconsistent(index, "right semi lookup needs a fully bound unique index"))
                }
            }
            _ => Err(PlanError::InvalidPlan(
                "right semi lookup without an index probe on its left side".into(),
            )),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::planner::physical::BuildSide;

    fn scan(table: &str, cols: &[&str]) -> Arc<PhysicalPlanNode> {
        Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::TableScan {
                    table: table.into(),
                    relation: table.into(),
                    name: table.into(),
                    columns: cols.iter().map(|c| c.to_string()).collect(),
                },
                0,
            )
            .with_output(cols.iter().map(|c| ColumnRef::new(table, *c)).collect()),
        )
    }

    fn index_scan(table: &str, cols: &[&str], index: &[&str]) -> Arc<PhysicalPlanNode> {
        Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::IndexedTableAccess {
                    table: table.into(),
                    relation: table.into(),
                    name: table.into(),
                    columns: cols.iter().map(|c| c.to_string()).collect(),
                    index: IndexDef::primary(table, index.iter().map(|c| c.to_string()).collect()),
                    access: IndexAccess::Scan,
                },
                0,
            )
            .with_output(cols.iter().map(|c| ColumnRef::new(table, *c)).collect()),
        )
    }

    fn join(
        join_type: JoinType,
        keys: Vec<(ScalarExpr, ScalarExpr)>,
        left: Arc<PhysicalPlanNode>,
        right: Arc<PhysicalPlanNode>,
    ) -> PhysicalPlanNode {
        let output = left.output.iter().chain(&right.output).cloned().collect();
        PhysicalPlanNode::new(
            PhysicalOperator::Join {
                join_type,
                keys,
                residual: None,
                build: BuildSide::Right,
                scalar_guard: false,
            },
            0,
        )
        .with_output(output)
        .with_children(vec![left, right])
    }

    fn filter(predicate: ScalarExpr, child: Arc<PhysicalPlanNode>) -> Arc<PhysicalPlanNode> {
        let output = child.output.clone();
        Arc::new(
            PhysicalPlanNode::new(PhysicalOperator::Filter { predicate }, 0)
                .with_output(output)
                .with_child(child),
        )
    }

    fn key(l: (&str, &str), r: (&str, &str)) -> (ScalarExpr, ScalarExpr) {
        (ScalarExpr::column(l.0, l.1), ScalarExpr::column(r.0, r.1))
    }

    fn is_invalid(result: PlanResult<()>, needle: &str) -> bool {
        matches!(result, Err(PlanError::InvalidPlan(msg)) if msg.contains(needle))
    }

    #[test]
    fn test_hash_join_is_valid() {
        let node = join(
            JoinType::Hash,
            vec![key(("xy", "x"), ("uv", "u"))],
            scan("xy", &["x", "y"]),
            scan("uv", &["u", "v"]),
        );
        assert!(check_node(&node, &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_hash_right_side_cannot_read_left() {
        let right = filter(
            ScalarExpr::eq(ScalarExpr::column("uv", "u"), ScalarExpr::column("xy", "x")),
            scan("uv", &["u", "v"]),
        );
        let node = join(JoinType::Hash, vec![key(("xy", "y"), ("uv", "v"))], scan("xy", &["x", "y"]), right.clone());
        assert!(is_invalid(check_node(&node, &BTreeSet::new()), "no input provides"));

        let node = join(JoinType::Inner, Vec::new(), scan("xy", &["x", "y"]), right);
        assert!(check_node(&node, &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_cached_results_must_be_uncorrelated() {
        let correlated = filter(
            ScalarExpr::eq(ScalarExpr::column("uv", "u"), ScalarExpr::column("xy", "x")),
            scan("uv", &["u", "v"]),
        );
        let cached = Arc::new(
            PhysicalPlanNode::new(PhysicalOperator::CachedResults, 0)
                .with_output(correlated.output.clone())
                .with_child(correlated),
        );
        let node = join(JoinType::Inner, Vec::new(), scan("xy", &["x", "y"]), cached);
        assert!(is_invalid(check_node(&node, &BTreeSet::new()), "cached results"));
    }

    #[test]
    fn test_merge_keys_follow_index_order() {
        let left = index_scan("xy", &["x", "y"], &["x"]);
        let right = index_scan("uv", &["u", "v"], &["u"]);
        let node = join(JoinType::Merge, vec![key(("xy", "x"), ("uv", "u"))], left.clone(), right.clone());
        assert!(check_node(&node, &BTreeSet::new()).is_ok());

        let node = join(JoinType::Merge, vec![key(("xy", "y"), ("uv", "u"))], left, right);
        assert!(matches!(
            check_node(&node, &BTreeSet::new()),
            Err(PlanError::IndexConsistency { .. })
        ));
    }

    #[test]
    fn test_lookup_requires_probe() {
        let node = join(
            JoinType::Lookup,
            vec![key(("xy", "x"), ("uv", "u"))],
            scan("xy", &["x", "y"]),
            scan("uv", &["u", "v"]),
        );
        assert!(is_invalid(check_node(&node, &BTreeSet::new()), "index probe"));
    }

    #[test]
    fn test_root_outputs_match_logical() {
        let logical = LogicalPlan::Scan {
            table: "xy".into(),
            relation: "xy".into(),
            name: "xy".into(),
            columns: vec!["x".into(), "y".into()],
            estimate: 4,
            scope: 0,
        };
        assert!(validate(&scan("xy", &["x", "y"]), &logical).is_ok());
        assert!(is_invalid(validate(&scan("xy", &["x"]), &logical), "expected"));
    }
}
