//! Physical operator selection.
//!
//! Each logical join is mapped to the first applicable strategy: merge over
//! two index-ordered scans, index lookup into the right side, a multi-key
//! concat lookup, the same lookups into the left side when the scope's order
//! is not pinned by a hint, hash, then nested loop. Semi and anti joins prefer index
//! lookups as well, and a semi join whose right side is unique on its keys
//! is planned as an inner join.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use super::error::{PlanError, PlanResult};
use super::expr::{AggregateCall, ColumnRef, ScalarExpr, SortKey, SubqueryExpr, SubqueryKind, WindowCall};
use super::logical::{JoinKind, LogicalPlan, ProjectItem};
use super::physical::{BuildSide, IndexAccess, JoinType, PhysicalOperator, PhysicalPlanNode};
use super::planner::PlannerOptions;
use super::scope::ScopeId;
use crate::catalog::{CatalogReader, IndexDef};
use crate::sql::BinaryOperator;

/// Cost model constants.
pub(crate) mod cost {
    /// Cost per row for sequential scan.
    pub const SEQ_SCAN_PER_ROW: f64 = 1.0;
    /// Cost per row for reading a table in index order.
    pub const INDEX_SCAN_PER_ROW: f64 = 1.2;
    /// Fixed cost of one index probe.
    pub const INDEX_PROBE: f64 = 2.0;
    /// Cost per row for filter evaluation.
    pub const FILTER_PER_ROW: f64 = 0.1;
    /// Cost per row for projection.
    pub const PROJECT_PER_ROW: f64 = 0.05;
    /// Cost per row for sorting (n log n).
    pub const SORT_PER_ROW: f64 = 2.0;
    /// Cost per row for hash join probe.
    pub const HASH_JOIN_PER_ROW: f64 = 0.5;
    /// Cost to build hash table per row.
    pub const HASH_BUILD_PER_ROW: f64 = 1.5;
    /// Cost per row for merging two ordered inputs.
    pub const MERGE_PER_ROW: f64 = 0.3;
    /// Cost per row for nested loop join.
    pub const NESTED_LOOP_PER_ROW: f64 = 10.0;
    /// Cost per row for hash aggregation.
    pub const HASH_AGG_PER_ROW: f64 = 0.8;
    /// Cost per row for materializing a cached result.
    pub const CACHE_PER_ROW: f64 = 0.2;
}

fn node_scope(plan: &LogicalPlan) -> ScopeId {
    match plan {
        LogicalPlan::Scan { scope, .. }
        | LogicalPlan::OneRow { scope }
        | LogicalPlan::Join { scope, .. }
        | LogicalPlan::SubqueryAlias { scope, .. } => *scope,
        other => other.children().first().map(|c| node_scope(c)).unwrap_or(0),
    }
}

fn relations_of(plan: &LogicalPlan) -> BTreeSet<String> {
    plan.output_columns().into_iter().map(|c| c.relation).collect()
}

fn cached(node: Arc<PhysicalPlanNode>) -> Arc<PhysicalPlanNode> {
    let rows = node.estimated_rows;
    Arc::new(
        PhysicalPlanNode::new(PhysicalOperator::CachedResults, node.scope)
            .with_cost(rows as f64 * cost::CACHE_PER_ROW)
            .with_rows(rows)
            .with_output(node.output.clone())
            .with_child(node),
    )
}

/// Materialize a side that does not depend on any outer row.
fn cache_if_uncorrelated(node: Arc<PhysicalPlanNode>) -> Arc<PhysicalPlanNode> {
    if node.is_correlated() {
        node
    } else {
        cached(node)
    }
}

/// `col = constant` on a column of `relation`.
fn constant_equality(conjunct: &ScalarExpr, relation: &str) -> Option<(String, ScalarExpr)> {
    let ScalarExpr::Binary {
        left,
        op: BinaryOperator::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    match (left.as_ref(), right.as_ref()) {
        (ScalarExpr::Column(c), value) | (value, ScalarExpr::Column(c))
            if c.relation == relation && value.is_constant() =>
        {
            Some((c.column.clone(), value.clone()))
        }
        _ => None,
    }
}

/// The index columns used for a keyed access must be its leading columns.
fn check_prefix(index: &IndexDef, columns: &[&str]) -> PlanResult<()> {
    let matches = columns.len() <= index.columns.len()
        && index.columns.iter().zip(columns).all(|(a, b)| a == b);
    if matches {
        Ok(())
    } else {
        Err(PlanError::IndexConsistency {
            table: index.table.clone(),
            index: index.name.clone(),
            reason: format!(
                "key columns ({}) are not a prefix of ({})",
                columns.join(", "),
                index.columns.join(", ")
            ),
        })
    }
}

/// Add the columns equated to `cols`, directly or through a constant.
fn equality_closure(cols: &BTreeSet<ColumnRef>, conjuncts: &[ScalarExpr]) -> BTreeSet<ColumnRef> {
    let mut closure = cols.clone();
    loop {
        let before = closure.len();
        for conjunct in conjuncts {
            let ScalarExpr::Binary {
                left,
                op: BinaryOperator::Eq,
                right,
            } = conjunct
            else {
                continue;
            };
            match (left.as_ref(), right.as_ref()) {
                (ScalarExpr::Column(a), ScalarExpr::Column(b)) => {
                    if closure.contains(a) {
                        closure.insert(b.clone());
                    }
                    if closure.contains(b) {
                        closure.insert(a.clone());
                    }
                }
                (ScalarExpr::Column(c), value) | (value, ScalarExpr::Column(c)) if value.is_constant() => {
                    closure.insert(c.clone());
                }
                _ => {}
            }
        }
        if closure.len() == before {
            return closure;
        }
    }
}

fn predicate_conjuncts(predicate: Option<&ScalarExpr>) -> Vec<ScalarExpr> {
    predicate
        .map(|p| p.clone().split_conjuncts())
        .unwrap_or_default()
}

/// Whether `plan` never yields two rows that agree on `cols`.
pub(crate) fn unique_on(plan: &LogicalPlan, cols: &BTreeSet<ColumnRef>, catalog: &dyn CatalogReader) -> bool {
    match plan {
        LogicalPlan::Scan {
            table, relation, ..
        } => {
            let names: Vec<&str> = cols
                .iter()
                .filter(|c| &c.relation == relation)
                .map(|c| c.column.as_str())
                .collect();
            catalog
                .indexes_for(table)
                .iter()
                .any(|i| i.is_covered_by(&names))
        }
        LogicalPlan::OneRow { .. } => true,
        LogicalPlan::Filter { input, predicate } => {
            let closure = equality_closure(cols, &predicate.clone().split_conjuncts());
            unique_on(input, &closure, catalog)
        }
        LogicalPlan::Sort { input, .. }
        | LogicalPlan::Limit { input, .. }
        | LogicalPlan::Window { input, .. } => unique_on(input, cols, catalog),
        LogicalPlan::Distinct { input } => {
            plan.output_columns().iter().all(|c| cols.contains(c)) || unique_on(input, cols, catalog)
        }
        LogicalPlan::Project { input, items } => {
            let mapped = items
                .iter()
                .filter(|i| cols.contains(&i.output))
                .filter_map(|i| i.expr.as_column().cloned())
                .collect();
            unique_on(input, &mapped, catalog)
        }
        LogicalPlan::SubqueryAlias { input, columns, .. } => {
            let mapped = columns
                .iter()
                .filter(|(_, outer)| cols.contains(outer))
                .map(|(inner, _)| inner.clone())
                .collect();
            unique_on(input, &mapped, catalog)
        }
        LogicalPlan::Aggregate {
            relation, group_by, ..
        } => (0..group_by.len()).all(|i| cols.contains(&ColumnRef::new(relation.clone(), format!("g{}", i)))),
        LogicalPlan::Join {
            kind,
            left,
            right,
            predicate,
            ..
        } => {
            let closure = equality_closure(cols, &predicate_conjuncts(predicate.as_ref()));
            match kind {
                JoinKind::Semi | JoinKind::Anti => unique_on(left, &closure, catalog),
                _ => unique_on(left, &closure, catalog) && unique_on(right, &closure, catalog),
            }
        }
    }
}

/// A right side that reduces to a table scan under renaming layers.
struct ProbeTarget<'p> {
    scan: &'p LogicalPlan,
    /// Alias and pass-through project layers above the scan, outermost first.
    layers: Vec<&'p LogicalPlan>,
    /// Right-side output column to scanned column name.
    columns: BTreeMap<ColumnRef, String>,
}

impl ProbeTarget<'_> {
    fn table(&self) -> &str {
        match self.scan {
            LogicalPlan::Scan { table, .. } => table,
            _ => "",
        }
    }
}

fn probe_target(plan: &LogicalPlan) -> Option<ProbeTarget<'_>> {
    let mut current: Vec<(ColumnRef, ColumnRef)> = plan
        .output_columns()
        .into_iter()
        .map(|c| (c.clone(), c))
        .collect();
    let mut layers = Vec::new();
    let mut node = plan;
    loop {
        match node {
            LogicalPlan::SubqueryAlias { input, columns, .. } => {
                for (_, column) in current.iter_mut() {
                    let (inner, _) = columns.iter().find(|(_, outer)| outer == column)?;
                    *column = inner.clone();
                }
                layers.push(node);
                node = &**input;
            }
            LogicalPlan::Project { input, items } => {
                for (_, column) in current.iter_mut() {
                    let item = items.iter().find(|i| &i.output == column)?;
                    *column = item.expr.as_column()?.clone();
                }
                layers.push(node);
                node = &**input;
            }
            LogicalPlan::Scan { relation, .. } => {
                let columns = current
                    .into_iter()
                    .filter(|(_, c)| &c.relation == relation)
                    .map(|(outer, c)| (outer, c.column))
                    .collect();
                return Some(ProbeTarget {
                    scan: node,
                    layers,
                    columns,
                });
            }
            _ => return None,
        }
    }
}

/// Split equality conjuncts into (left, right) key pairs.
fn split_keys(
    conjuncts: Vec<ScalarExpr>,
    left: &BTreeSet<String>,
    right: &BTreeSet<String>,
) -> (Vec<(ScalarExpr, ScalarExpr)>, Vec<ScalarExpr>) {
    let side = |expr: &ScalarExpr, relations: &BTreeSet<String>| {
        let refs = expr.relations();
        !refs.is_empty() && refs.is_subset(relations) && !expr.contains_subquery()
    };
    let mut keys = Vec::new();
    let mut others = Vec::new();
    for conjunct in conjuncts {
        if let ScalarExpr::Binary {
            left: a,
            op: BinaryOperator::Eq,
            right: b,
        } = &conjunct
        {
            if side(a, left) && side(b, right) {
                keys.push((a.as_ref().clone(), b.as_ref().clone()));
                continue;
            }
            if side(a, right) && side(b, left) {
                keys.push((b.as_ref().clone(), a.as_ref().clone()));
                continue;
            }
        }
        others.push(conjunct);
    }
    (keys, others)
}

fn key_equalities<'k>(keys: impl IntoIterator<Item = &'k (ScalarExpr, ScalarExpr)>) -> Vec<ScalarExpr> {
    keys.into_iter()
        .map(|(l, r)| ScalarExpr::eq(l.clone(), r.clone()))
        .collect()
}

/// One logical join being planned.
#[derive(Clone)]
struct JoinSpec<'p> {
    kind: JoinKind,
    left: &'p Arc<LogicalPlan>,
    right: &'p Arc<LogicalPlan>,
    keys: Vec<(ScalarExpr, ScalarExpr)>,
    others: Vec<ScalarExpr>,
    scalar_guard: bool,
    scope: ScopeId,
    rows: usize,
    output: Vec<ColumnRef>,
}

impl JoinSpec<'_> {
    /// Non-key conjuncts plus the key pairs not in `used`.
    fn residual(&self, used: &[usize]) -> Option<ScalarExpr> {
        let unused = self
            .keys
            .iter()
            .enumerate()
            .filter(|(i, _)| !used.contains(i))
            .map(|(_, k)| k);
        ScalarExpr::conjoin(self.others.iter().cloned().chain(key_equalities(unused)))
    }

    fn keys_at(&self, used: &[usize]) -> Vec<(ScalarExpr, ScalarExpr)> {
        used.iter().map(|&i| self.keys[i].clone()).collect()
    }

    /// The same join with its inputs exchanged.
    fn swapped(&self) -> Self {
        JoinSpec {
            left: self.right,
            right: self.left,
            keys: self.keys.iter().map(|(l, r)| (r.clone(), l.clone())).collect(),
            ..self.clone()
        }
    }
}

/// Maps logical plans to physical operators.
pub struct PhysicalSelector<'a> {
    catalog: &'a dyn CatalogReader,
    options: &'a PlannerOptions,
    /// Scopes whose join order is fixed by a hint.
    pinned: BTreeSet<ScopeId>,
}

impl<'a> PhysicalSelector<'a> {
    pub fn new(catalog: &'a dyn CatalogReader, options: &'a PlannerOptions) -> Self {
        Self {
            catalog,
            options,
            pinned: BTreeSet::new(),
        }
    }

    /// Keep the input order of every join in `scopes`.
    pub fn with_pinned_scopes(mut self, scopes: impl IntoIterator<Item = ScopeId>) -> Self {
        self.pinned.extend(scopes);
        self
    }

    pub fn select(&self, plan: &Arc<LogicalPlan>) -> PlanResult<Arc<PhysicalPlanNode>> {
        let scope = node_scope(plan);
        let rows = plan.estimated_rows();
        let node = match plan.as_ref() {
            LogicalPlan::Scan {
                table,
                relation,
                name,
                columns,
                ..
            } => PhysicalPlanNode::new(
                PhysicalOperator::TableScan {
                    table: table.clone(),
                    relation: relation.clone(),
                    name: name.clone(),
                    columns: columns.clone(),
                },
                scope,
            )
            .with_cost(rows as f64 * cost::SEQ_SCAN_PER_ROW),

            LogicalPlan::OneRow { .. } => PhysicalPlanNode::new(PhysicalOperator::OneRow, scope),

            LogicalPlan::Filter { input, predicate } => {
                if let Some(node) = self.try_point_access(input, predicate)? {
                    return Ok(node);
                }
                let child = self.select(input)?;
                PhysicalPlanNode::new(
                    PhysicalOperator::Filter {
                        predicate: self.plan_expr(predicate)?,
                    },
                    scope,
                )
                .with_cost(child.estimated_rows as f64 * cost::FILTER_PER_ROW)
                .with_child(child)
            }

            LogicalPlan::Project { input, items } => {
                let child = self.select(input)?;
                PhysicalPlanNode::new(
                    PhysicalOperator::Project {
                        items: self.plan_items(items)?,
                    },
                    scope,
                )
                .with_cost(child.estimated_rows as f64 * cost::PROJECT_PER_ROW)
                .with_child(child)
            }

            LogicalPlan::Join { .. } => return self.select_join(plan),

            LogicalPlan::SubqueryAlias {
                input,
                relation,
                name,
                columns,
                ..
            } => PhysicalPlanNode::new(
                PhysicalOperator::SubqueryAlias {
                    relation: relation.clone(),
                    name: name.clone(),
                    columns: columns.clone(),
                },
                scope,
            )
            .with_child(self.select(input)?),

            LogicalPlan::Distinct { input } => {
                let child = self.select(input)?;
                PhysicalPlanNode::new(PhysicalOperator::Distinct, scope)
                    .with_cost(child.estimated_rows as f64 * cost::HASH_AGG_PER_ROW)
                    .with_child(child)
            }

            LogicalPlan::Sort { input, order } => {
                let child = self.select(input)?;
                let n = child.estimated_rows.max(2) as f64;
                PhysicalPlanNode::new(
                    PhysicalOperator::Sort {
                        order: self.plan_sort_keys(order)?,
                    },
                    scope,
                )
                .with_cost(n * cost::SORT_PER_ROW * n.log2())
                .with_child(child)
            }

            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => PhysicalPlanNode::new(
                PhysicalOperator::Limit {
                    limit: *limit,
                    offset: *offset,
                },
                scope,
            )
            .with_cost(rows as f64 * 0.01)
            .with_child(self.select(input)?),

            LogicalPlan::Aggregate {
                input,
                relation,
                group_by,
                aggregates,
            } => {
                let child = self.select(input)?;
                PhysicalPlanNode::new(
                    PhysicalOperator::Aggregate {
                        relation: relation.clone(),
                        group_by: self.plan_exprs(group_by)?,
                        aggregates: aggregates
                            .iter()
                            .map(|a| {
                                Ok(AggregateCall {
                                    func: a.func,
                                    arg: a.arg.as_ref().map(|e| self.plan_expr(e)).transpose()?,
                                })
                            })
                            .collect::<PlanResult<_>>()?,
                    },
                    scope,
                )
                .with_cost(child.estimated_rows as f64 * cost::HASH_AGG_PER_ROW)
                .with_child(child)
            }

            LogicalPlan::Window {
                input,
                relation,
                functions,
            } => {
                let child = self.select(input)?;
                let n = child.estimated_rows.max(2) as f64;
                PhysicalPlanNode::new(
                    PhysicalOperator::Window {
                        relation: relation.clone(),
                        functions: functions
                            .iter()
                            .map(|w| {
                                Ok(WindowCall {
                                    func: w.func,
                                    partition_by: self.plan_exprs(&w.partition_by)?,
                                    order_by: self.plan_sort_keys(&w.order_by)?,
                                })
                            })
                            .collect::<PlanResult<_>>()?,
                    },
                    scope,
                )
                .with_cost(n * cost::SORT_PER_ROW * n.log2())
                .with_child(child)
            }
        };
        Ok(Arc::new(node.with_rows(rows).with_output(plan.output_columns())))
    }

    /// Fill in the physical plans of subquery expressions. Uncorrelated
    /// subqueries are computed once per execution.
    fn plan_expr(&self, expr: &ScalarExpr) -> PlanResult<ScalarExpr> {
        expr.try_transform::<PlanError, _>(&mut |e| match e {
            ScalarExpr::Subquery(sub) => {
                let mut physical = self.select(&sub.plan)?;
                if !sub.is_correlated() {
                    physical = cached(physical);
                }
                let kind = match &sub.kind {
                    SubqueryKind::In { operand } => SubqueryKind::In {
                        operand: Box::new(self.plan_expr(operand)?),
                    },
                    other => other.clone(),
                };
                Ok(Some(ScalarExpr::Subquery(Box::new(SubqueryExpr {
                    kind,
                    physical: Some(physical),
                    ..SubqueryExpr::clone(sub)
                }))))
            }
            _ => Ok(None),
        })
    }

    fn plan_exprs(&self, exprs: &[ScalarExpr]) -> PlanResult<Vec<ScalarExpr>> {
        exprs.iter().map(|e| self.plan_expr(e)).collect()
    }

    fn plan_items(&self, items: &[ProjectItem]) -> PlanResult<Vec<ProjectItem>> {
        items
            .iter()
            .map(|i| {
                Ok(ProjectItem {
                    expr: self.plan_expr(&i.expr)?,
                    output: i.output.clone(),
                    name: i.name.clone(),
                })
            })
            .collect()
    }

    fn plan_sort_keys(&self, keys: &[SortKey]) -> PlanResult<Vec<SortKey>> {
        keys.iter()
            .map(|k| {
                Ok(SortKey {
                    expr: self.plan_expr(&k.expr)?,
                    ascending: k.ascending,
                })
            })
            .collect()
    }

    /// Constant equalities on an index prefix of a scanned table become an
    /// index point lookup.
    fn try_point_access(
        &self,
        input: &Arc<LogicalPlan>,
        predicate: &ScalarExpr,
    ) -> PlanResult<Option<Arc<PhysicalPlanNode>>> {
        let LogicalPlan::Scan {
            table,
            relation,
            estimate,
            scope,
            ..
        } = input.as_ref()
        else {
            return Ok(None);
        };
        let conjuncts = self.plan_expr(predicate)?.split_conjuncts();
        let bound: Vec<(usize, String, ScalarExpr)> = conjuncts
            .iter()
            .enumerate()
            .filter_map(|(i, c)| constant_equality(c, relation).map(|(col, value)| (i, col, value)))
            .collect();
        if bound.is_empty() {
            return Ok(None);
        }
        let names: Vec<&str> = bound.iter().map(|(_, c, _)| c.as_str()).collect();
        let indexes = self.catalog.indexes_for(table);
        let Some((index, prefix)) = best_prefix(&indexes, &names) else {
            return Ok(None);
        };

        let mut used = Vec::new();
        let mut keys = Vec::new();
        for column in &index.columns[..prefix] {
            if let Some((i, _, value)) = bound.iter().find(|(_, c, _)| c == column) {
                used.push(*i);
                keys.push(value.clone());
            }
        }
        let key_columns: Vec<&str> = index.columns[..prefix].iter().map(String::as_str).collect();
        check_prefix(index, &key_columns)?;

        let rows = if index.unique && prefix == index.columns.len() {
            1
        } else {
            (estimate / 10).max(1)
        };
        debug!(table = %table, index = %index.name, "constant equality served by index point lookup");
        let access = self.index_access(input, index, IndexAccess::Point(keys), rows, *scope)?;

        let residual: Vec<ScalarExpr> = conjuncts
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !used.contains(i))
            .map(|(_, c)| c)
            .collect();
        Ok(Some(match ScalarExpr::conjoin(residual) {
            Some(predicate) => Arc::new(
                PhysicalPlanNode::new(PhysicalOperator::Filter { predicate }, *scope)
                    .with_cost(rows as f64 * cost::FILTER_PER_ROW)
                    .with_rows((rows / 3).max(1))
                    .with_output(input.output_columns())
                    .with_child(access),
            ),
            None => access,
        }))
    }

    /// Indexed access node over a logical scan.
    fn index_access(
        &self,
        scan: &LogicalPlan,
        index: &IndexDef,
        access: IndexAccess,
        rows: usize,
        scope: ScopeId,
    ) -> PlanResult<Arc<PhysicalPlanNode>> {
        let LogicalPlan::Scan {
            table,
            relation,
            name,
            columns,
            ..
        } = scan
        else {
            return Err(PlanError::Internal("indexed access over a non-scan".into()));
        };
        let cost = match &access {
            IndexAccess::Scan => rows as f64 * cost::INDEX_SCAN_PER_ROW,
            IndexAccess::Concat(keys) => keys.len() as f64 * cost::INDEX_PROBE + rows as f64,
            _ => cost::INDEX_PROBE + rows as f64,
        };
        Ok(Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::IndexedTableAccess {
                    table: table.clone(),
                    relation: relation.clone(),
                    name: name.clone(),
                    columns: columns.clone(),
                    index: index.clone(),
                    access,
                },
                scope,
            )
            .with_cost(cost)
            .with_rows(rows)
            .with_output(scan.output_columns()),
        ))
    }

    /// Rebuild a probe target's layers over an indexed access of its scan.
    fn probe_node(
        &self,
        target: &ProbeTarget<'_>,
        index: &IndexDef,
        access: IndexAccess,
    ) -> PlanResult<Arc<PhysicalPlanNode>> {
        let (estimate, scope) = match target.scan {
            LogicalPlan::Scan {
                estimate, scope, ..
            } => (*estimate, *scope),
            _ => return Err(PlanError::Internal("probe target without a scan".into())),
        };
        let rows = if index.unique { 1 } else { (estimate / 10).max(1) };
        let mut node = self.index_access(target.scan, index, access, rows, scope)?;
        for layer in target.layers.iter().rev() {
            let operator = match layer {
                LogicalPlan::Project { items, .. } => PhysicalOperator::Project {
                    items: self.plan_items(items)?,
                },
                LogicalPlan::SubqueryAlias {
                    relation,
                    name,
                    columns,
                    ..
                } => PhysicalOperator::SubqueryAlias {
                    relation: relation.clone(),
                    name: name.clone(),
                    columns: columns.clone(),
                },
                _ => return Err(PlanError::Internal("unexpected probe layer".into())),
            };
            node = Arc::new(
                PhysicalPlanNode::new(operator, node_scope(layer))
                    .with_cost(rows as f64 * cost::PROJECT_PER_ROW)
                    .with_rows(rows)
                    .with_output(layer.output_columns())
                    .with_child(node),
            );
        }
        Ok(node)
    }

    fn join_node(
        &self,
        spec: &JoinSpec<'_>,
        join_type: JoinType,
        keys: Vec<(ScalarExpr, ScalarExpr)>,
        residual: Option<ScalarExpr>,
        build: BuildSide,
        children: [Arc<PhysicalPlanNode>; 2],
        cost: f64,
    ) -> Arc<PhysicalPlanNode> {
        debug!(scope = spec.scope, join = %join_type, keys = keys.len(), "selected join strategy");
        Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::Join {
                    join_type,
                    keys,
                    residual,
                    build,
                    scalar_guard: spec.scalar_guard,
                },
                spec.scope,
            )
            .with_cost(cost)
            .with_rows(spec.rows)
            .with_output(spec.output.clone())
            .with_children(children.into()),
        )
    }

    fn select_join(&self, plan: &Arc<LogicalPlan>) -> PlanResult<Arc<PhysicalPlanNode>> {
        let LogicalPlan::Join {
            kind,
            left,
            right,
            predicate,
            scalar_guard,
            scope,
        } = plan.as_ref()
        else {
            return Err(PlanError::Internal("join selection over a non-join".into()));
        };
        let conjuncts = match predicate {
            Some(p) => self.plan_expr(p)?.split_conjuncts(),
            None => Vec::new(),
        };
        let (keys, others) = split_keys(conjuncts, &relations_of(left), &relations_of(right));
        let spec = JoinSpec {
            kind: *kind,
            left,
            right,
            keys,
            others,
            scalar_guard: *scalar_guard,
            scope: *scope,
            rows: plan.estimated_rows(),
            output: plan.output_columns(),
        };
        match kind {
            JoinKind::Cross | JoinKind::Inner | JoinKind::LeftOuter => self.select_row_join(spec),
            JoinKind::Semi | JoinKind::Anti => self.select_existence_join(spec),
        }
    }

    fn select_row_join(&self, spec: JoinSpec<'_>) -> PlanResult<Arc<PhysicalPlanNode>> {
        if !spec.keys.is_empty() {
            if self.options.enable_merge_join {
                if let Some(node) = self.try_merge(&spec)? {
                    return Ok(node);
                }
            }
            if self.options.enable_lookup_join {
                if let Some(node) = self.try_lookup(&spec)? {
                    return Ok(node);
                }
            }
        }
        if spec.kind == JoinKind::Inner && self.options.enable_lookup_join {
            if let Some(node) = self.try_concat(&spec)? {
                return Ok(node);
            }
            if !self.pinned.contains(&spec.scope) {
                let swapped = spec.swapped();
                if !swapped.keys.is_empty() {
                    if let Some(node) = self.try_lookup(&swapped)? {
                        debug!(scope = spec.scope, "only the left input is indexed, lookup into it");
                        return Ok(node);
                    }
                }
                if let Some(node) = self.try_concat(&swapped)? {
                    return Ok(node);
                }
            }
        }
        if !spec.keys.is_empty() && self.options.enable_hash_join {
            return self.hash_join(&spec);
        }
        self.nested_loop(&spec)
    }

    fn select_existence_join(&self, spec: JoinSpec<'_>) -> PlanResult<Arc<PhysicalPlanNode>> {
        if !spec.keys.is_empty() && self.options.enable_lookup_join {
            if let Some(node) = self.try_lookup(&spec)? {
                return Ok(node);
            }
            if spec.kind == JoinKind::Semi {
                if let Some(node) = self.try_right_semi_lookup(&spec)? {
                    return Ok(node);
                }
            }
        }
        if spec.kind == JoinKind::Semi && !spec.keys.is_empty() {
            let right_columns: BTreeSet<ColumnRef> = spec
                .keys
                .iter()
                .filter_map(|(_, r)| r.as_column().cloned())
                .collect();
            if !right_columns.is_empty() && unique_on(spec.right, &right_columns, self.catalog) {
                debug!(scope = spec.scope, "right side unique on join keys, semi join planned as inner join");
                let mut output = spec.left.output_columns();
                output.extend(spec.right.output_columns());
                return self.select_row_join(JoinSpec {
                    kind: JoinKind::Inner,
                    output,
                    ..spec
                });
            }
        }
        self.nested_loop(&spec)
    }

    /// Both sides are plain scans with indexes ordered on the key columns.
    /// Keys must be bare columns; `y + 2 = s` style keys fall through to
    /// lookup or hash.
    fn try_merge(&self, spec: &JoinSpec<'_>) -> PlanResult<Option<Arc<PhysicalPlanNode>>> {
        let join_type = match spec.kind {
            JoinKind::Inner => JoinType::Merge,
            JoinKind::LeftOuter => JoinType::LeftOuterMerge,
            _ => return Ok(None),
        };
        let (
            LogicalPlan::Scan {
                table: left_table,
                relation: left_relation,
                scope: left_scope,
                ..
            },
            LogicalPlan::Scan {
                table: right_table,
                relation: right_relation,
                scope: right_scope,
                ..
            },
        ) = (spec.left.as_ref(), spec.right.as_ref())
        else {
            return Ok(None);
        };

        let pairs: Vec<(usize, &str, &str)> = spec
            .keys
            .iter()
            .enumerate()
            .filter_map(|(i, (l, r))| {
                let (l, r) = (l.as_column()?, r.as_column()?);
                (&l.relation == left_relation && &r.relation == right_relation)
                    .then_some((i, l.column.as_str(), r.column.as_str()))
            })
            .collect();
        if pairs.is_empty() {
            return Ok(None);
        }

        let left_indexes = self.catalog.indexes_for(left_table);
        let right_indexes = self.catalog.indexes_for(right_table);
        let mut best: Option<(&IndexDef, &IndexDef, Vec<usize>)> = None;
        for li in &left_indexes {
            for ri in &right_indexes {
                let mut used: Vec<usize> = Vec::new();
                for (lc, rc) in li.columns.iter().zip(&ri.columns) {
                    match pairs
                        .iter()
                        .find(|p| p.1 == lc.as_str() && p.2 == rc.as_str() && !used.contains(&p.0))
                    {
                        Some(p) => used.push(p.0),
                        None => break,
                    }
                }
                if !used.is_empty() && best.as_ref().map_or(true, |b| used.len() > b.2.len()) {
                    best = Some((li, ri, used));
                }
            }
        }
        let Some((li, ri, used)) = best else {
            return Ok(None);
        };

        let left_cols: Vec<&str> = used.iter().filter_map(|&i| pairs.iter().find(|p| p.0 == i).map(|p| p.1)).collect();
        let right_cols: Vec<&str> = used.iter().filter_map(|&i| pairs.iter().find(|p| p.0 == i).map(|p| p.2)).collect();
        check_prefix(li, &left_cols)?;
        check_prefix(ri, &right_cols)?;

        let left_rows = spec.left.estimated_rows();
        let right_rows = spec.right.estimated_rows();
        let left = self.index_access(spec.left, li, IndexAccess::Scan, left_rows, *left_scope)?;
        let right = self.index_access(spec.right, ri, IndexAccess::Scan, right_rows, *right_scope)?;
        Ok(Some(self.join_node(
            spec,
            join_type,
            spec.keys_at(&used),
            spec.residual(&used),
            BuildSide::Right,
            [left, right],
            left_rows.saturating_add(right_rows) as f64 * cost::MERGE_PER_ROW,
        )))
    }

    /// Pick the index of `target` with the longest prefix bound by keys.
    fn choose_probe<'i>(
        &self,
        target: &ProbeTarget<'_>,
        indexes: &'i [IndexDef],
        keys: &[(ScalarExpr, ScalarExpr)],
    ) -> Option<(&'i IndexDef, Vec<ScalarExpr>, Vec<usize>)> {
        let bound: Vec<(usize, &str)> = keys
            .iter()
            .enumerate()
            .filter(|(_, (l, _))| !l.contains_subquery())
            .filter_map(|(i, (_, r))| {
                let column = target.columns.get(r.as_column()?)?;
                Some((i, column.as_str()))
            })
            .collect();
        let names: Vec<&str> = bound.iter().map(|(_, c)| *c).collect();
        let (index, prefix) = best_prefix(indexes, &names)?;

        let mut probe = Vec::new();
        let mut used = Vec::new();
        for column in &index.columns[..prefix] {
            let (i, _) = bound.iter().find(|(_, c)| *c == column.as_str())?;
            probe.push(keys[*i].0.clone());
            used.push(*i);
        }
        Some((index, probe, used))
    }

    /// The right side reduces to a table with an index on the key columns.
    fn try_lookup(&self, spec: &JoinSpec<'_>) -> PlanResult<Option<Arc<PhysicalPlanNode>>> {
        let join_type = match spec.kind {
            JoinKind::Inner => JoinType::Lookup,
            JoinKind::LeftOuter => JoinType::LeftOuterLookup,
            JoinKind::Semi => JoinType::SemiLookup,
            JoinKind::Anti => JoinType::AntiLookup,
            JoinKind::Cross => return Ok(None),
        };
        let Some(target) = probe_target(spec.right) else {
            return Ok(None);
        };
        let indexes = self.catalog.indexes_for(target.table());
        let Some((index, probe, used)) = self.choose_probe(&target, &indexes, &spec.keys) else {
            return Ok(None);
        };
        let key_columns: Vec<&str> = index.columns[..used.len()].iter().map(String::as_str).collect();
        check_prefix(index, &key_columns)?;

        let left = self.select(spec.left)?;
        let right = self.probe_node(&target, index, IndexAccess::Probe(probe))?;
        let cost = left.estimated_rows as f64 * cost::INDEX_PROBE;
        Ok(Some(self.join_node(
            spec,
            join_type,
            spec.keys_at(&used),
            spec.residual(&used),
            BuildSide::Right,
            [left, right],
            cost,
        )))
    }

    /// An OR of equalities on one indexed right column probes once per key.
    fn try_concat(&self, spec: &JoinSpec<'_>) -> PlanResult<Option<Arc<PhysicalPlanNode>>> {
        let Some(target) = probe_target(spec.right) else {
            return Ok(None);
        };
        let left_relations = relations_of(spec.left);
        let indexes = self.catalog.indexes_for(target.table());

        for (pos, conjunct) in spec.others.iter().enumerate() {
            let Some((column, keys)) = concat_keys(conjunct, &target, &left_relations) else {
                continue;
            };
            let Some(index) = indexes
                .iter()
                .find(|i| i.columns.first().is_some_and(|c| *c == column))
            else {
                continue;
            };
            check_prefix(index, &[column.as_str()])?;

            let left = self.select(spec.left)?;
            let probes = keys.len();
            let right = self.probe_node(&target, index, IndexAccess::Concat(keys))?;
            let residual = ScalarExpr::conjoin(
                spec.others
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != pos)
                    .map(|(_, c)| c.clone())
                    .chain(key_equalities(&spec.keys)),
            );
            let cost = left.estimated_rows as f64 * probes as f64 * cost::INDEX_PROBE;
            return Ok(Some(self.join_node(
                spec,
                JoinType::Lookup,
                Vec::new(),
                residual,
                BuildSide::Right,
                [left, right],
                cost,
            )));
        }
        Ok(None)
    }

    /// Drive from the right side and probe a unique index of the left table.
    fn try_right_semi_lookup(&self, spec: &JoinSpec<'_>) -> PlanResult<Option<Arc<PhysicalPlanNode>>> {
        let LogicalPlan::Scan {
            table,
            relation,
            scope,
            ..
        } = spec.left.as_ref()
        else {
            return Ok(None);
        };
        let left_columns: Vec<(usize, &str)> = spec
            .keys
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| !r.contains_subquery())
            .filter_map(|(i, (l, _))| {
                let c = l.as_column()?;
                (&c.relation == relation).then_some((i, c.column.as_str()))
            })
            .collect();
        let names: Vec<&str> = left_columns.iter().map(|(_, c)| *c).collect();
        let indexes = self.catalog.indexes_for(table);
        let Some(index) = indexes.iter().find(|i| i.is_covered_by(&names)) else {
            return Ok(None);
        };

        let mut probe = Vec::new();
        let mut used = Vec::new();
        for column in &index.columns {
            let Some((i, _)) = left_columns.iter().find(|(_, c)| *c == column.as_str()) else {
                return Ok(None);
            };
            probe.push(spec.keys[*i].1.clone());
            used.push(*i);
        }
        let key_columns: Vec<&str> = index.columns.iter().map(String::as_str).collect();
        check_prefix(index, &key_columns)?;

        let left = self.index_access(spec.left, index, IndexAccess::Probe(probe), 1, *scope)?;
        let right = cache_if_uncorrelated(self.select(spec.right)?);
        let cost = right.estimated_rows as f64 * cost::INDEX_PROBE;
        Ok(Some(self.join_node(
            spec,
            JoinType::RightSemiLookup,
            spec.keys_at(&used),
            spec.residual(&used),
            BuildSide::Right,
            [left, right],
            cost,
        )))
    }

    fn hash_join(&self, spec: &JoinSpec<'_>) -> PlanResult<Arc<PhysicalPlanNode>> {
        let left = self.select(spec.left)?;
        let right = self.select(spec.right)?;
        let (join_type, build) = match spec.kind {
            JoinKind::LeftOuter => (JoinType::LeftOuterHash, BuildSide::Right),
            _ if left.estimated_rows < right.estimated_rows => (JoinType::Hash, BuildSide::Left),
            _ => (JoinType::Hash, BuildSide::Right),
        };
        let (build_rows, probe_rows) = match build {
            BuildSide::Left => (left.estimated_rows, right.estimated_rows),
            BuildSide::Right => (right.estimated_rows, left.estimated_rows),
        };
        let (left, right) = match build {
            BuildSide::Left => (cache_if_uncorrelated(left), right),
            BuildSide::Right => (left, cache_if_uncorrelated(right)),
        };
        let cost = build_rows as f64 * cost::HASH_BUILD_PER_ROW + probe_rows as f64 * cost::HASH_JOIN_PER_ROW;
        let all: Vec<usize> = (0..spec.keys.len()).collect();
        Ok(self.join_node(
            spec,
            join_type,
            spec.keys.clone(),
            spec.residual(&all),
            build,
            [left, right],
            cost,
        ))
    }

    fn nested_loop(&self, spec: &JoinSpec<'_>) -> PlanResult<Arc<PhysicalPlanNode>> {
        let left = self.select(spec.left)?;
        let right = cache_if_uncorrelated(self.select(spec.right)?);
        let cost = left.estimated_rows.saturating_mul(right.estimated_rows) as f64 * cost::NESTED_LOOP_PER_ROW;
        let (join_type, keys, residual) = match spec.kind {
            // Existence joins keep their keys for a hashed probe.
            JoinKind::Semi => {
                let all: Vec<usize> = (0..spec.keys.len()).collect();
                (JoinType::Semi, spec.keys.clone(), spec.residual(&all))
            }
            JoinKind::Anti => {
                let all: Vec<usize> = (0..spec.keys.len()).collect();
                (JoinType::Anti, spec.keys.clone(), spec.residual(&all))
            }
            kind => {
                let residual = spec.residual(&[]);
                let join_type = match kind {
                    JoinKind::LeftOuter => JoinType::LeftOuter,
                    _ if residual.is_none() => JoinType::Cross,
                    _ => JoinType::Inner,
                };
                (join_type, Vec::new(), residual)
            }
        };
        Ok(self.join_node(spec, join_type, keys, residual, BuildSide::Right, [left, right], cost))
    }
}

/// Index with the longest leading prefix bound by `names`, first on ties.
fn best_prefix<'i>(indexes: &'i [IndexDef], names: &[&str]) -> Option<(&'i IndexDef, usize)> {
    let mut best: Option<(&IndexDef, usize)> = None;
    for index in indexes {
        let n = index.bound_prefix_len(names);
        if n > 0 && best.map_or(true, |(_, m)| n > m) {
            best = Some((index, n));
        }
    }
    best
}

/// `r = a OR r = b OR ...` on one right column, with left-side keys.
fn concat_keys(
    conjunct: &ScalarExpr,
    target: &ProbeTarget<'_>,
    left_relations: &BTreeSet<String>,
) -> Option<(String, Vec<ScalarExpr>)> {
    let disjuncts = conjunct.split_disjuncts();
    if disjuncts.len() < 2 {
        return None;
    }
    let mut column: Option<&String> = None;
    let mut keys = Vec::new();
    for disjunct in disjuncts {
        let ScalarExpr::Binary {
            left,
            op: BinaryOperator::Eq,
            right,
        } = disjunct
        else {
            return None;
        };
        let on_right = |e: &ScalarExpr| e.as_column().and_then(|c| target.columns.get(c));
        let from_left = |e: &ScalarExpr| e.relations().is_subset(left_relations) && !e.contains_subquery();
        let (c, key) = match (on_right(left.as_ref()), on_right(right.as_ref())) {
            (Some(c), None) if from_left(right.as_ref()) => (c, right.as_ref().clone()),
            (None, Some(c)) if from_left(left.as_ref()) => (c, left.as_ref().clone()),
            _ => return None,
        };
        match column {
            Some(existing) if existing != c => return None,
            _ => column = Some(c),
        }
        keys.push(key);
    }
    Some((column?.clone(), keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogSnapshot, DataType, SchemaBuilder};
    use crate::planner::binder::Binder;
    use crate::planner::decorrelate::Decorrelator;
    use crate::planner::join_order::JoinOrderer;
    use crate::planner::physical::PhysicalPlan;
    use crate::sql::Parser;

    fn catalog(xy_composite: bool) -> CatalogSnapshot {
        let catalog = Catalog::new();
        let xy = SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer);
        let xy = if xy_composite {
            xy.composite_primary_key(["x", "y"])
        } else {
            xy.primary_key("x").index("y_idx", ["y"])
        };
        catalog.create_table(xy.build().unwrap()).unwrap();
        catalog
            .create_table(
                SchemaBuilder::new("rs")
                    .add_column("r", DataType::Integer)
                    .add_column("s", DataType::Integer)
                    .primary_key("r")
                    .index("s_idx", ["s"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        for (table, a, b) in [("uv", "u", "v"), ("ab", "a", "b")] {
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
        }
        for (table, rows) in [("xy", 4), ("rs", 5), ("uv", 4), ("ab", 4)] {
            catalog.record_row_count(table, rows);
        }
        catalog.snapshot()
    }

    fn plan_with(sql: &str, snapshot: &CatalogSnapshot, options: &PlannerOptions) -> PhysicalPlan {
        let query = Parser::parse_query(sql).unwrap();
        let bound = Binder::new(snapshot, 1000).bind(&query).unwrap();
        let plan = Decorrelator::new().rewrite(&bound.plan).unwrap();
        let plan = JoinOrderer::new(&bound.scopes).reorder(&plan).unwrap();
        let root = PhysicalSelector::new(snapshot, options).select(&plan).unwrap();
        PhysicalPlan::new(root, bound.column_names)
    }

    fn plan(sql: &str) -> PhysicalPlan {
        plan_with(sql, &catalog(false), &PlannerOptions::default())
    }

    #[test]
    fn test_left_outer_merge_over_secondary_indexes() {
        let physical = plan("select /*+ JOIN_ORDER(rs, xy) */ * from rs left outer join xy on y = s order by 1, 3");
        assert_eq!(physical.join_types(), vec![JoinType::LeftOuterMerge]);
        let text = physical.to_string();
        assert!(text.contains("IndexedTableAccess: rs using s_idx"), "{}", text);
        assert!(text.contains("IndexedTableAccess: xy using y_idx"), "{}", text);

        let physical = plan("select * from rs left outer join xy on y = s and y + s = 0");
        assert_eq!(physical.join_types(), vec![JoinType::LeftOuterMerge]);
        assert!(physical.to_string().contains("where (xy.y + rs.s) = 0"), "{}", physical);
    }

    #[test]
    fn test_lookup_on_expression_key() {
        let physical = plan("select * from xy a inner join xy b on a.x + 3 = b.x");
        assert_eq!(physical.join_types(), vec![JoinType::Lookup]);
        assert!(physical.to_string().contains("probe [a.x + 3]"), "{}", physical);
    }

    #[test]
    fn test_blocked_subquery_uses_hash() {
        let physical = plan("select * from xy where y - 1 in (select u from uv order by 1 limit 1)");
        assert_eq!(physical.join_types(), vec![JoinType::Hash]);
        assert!(physical.to_string().contains("CachedResults"), "{}", physical);
    }

    #[test]
    fn test_existence_lookups() {
        let physical = plan("select * from xy where y - 1 in (select u from uv)");
        assert_eq!(physical.join_types(), vec![JoinType::SemiLookup]);

        let physical = plan("select * from xy where y + 1 not in (select u from uv)");
        assert_eq!(physical.join_types(), vec![JoinType::AntiLookup]);

        let physical = plan("select * from xy where x != (select r from rs where r = 1)");
        assert_eq!(physical.join_types(), vec![JoinType::Anti]);
    }

    #[test]
    fn test_right_semi_lookup_and_unique_semi() {
        let sql = "select * from xy where x in (select u from uv inner join ab on u = a and a = 2)";
        let physical = plan(sql);
        assert_eq!(physical.join_types()[0], JoinType::RightSemiLookup);

        // Without a unique index on x the semi join runs as an inner join
        // probing the outer table.
        let physical = plan_with(sql, &catalog(true), &PlannerOptions::default());
        assert_eq!(physical.join_types()[0], JoinType::Lookup);
        assert!(physical.to_string().contains("IndexedTableAccess: xy using PRIMARY probe"), "{}", physical);
    }

    #[test]
    fn test_point_access_and_concat() {
        let physical = plan("select * from xy where x = 1 and y > 0");
        let text = physical.to_string();
        assert!(text.contains("IndexedTableAccess: xy using PRIMARY point [1]"), "{}", text);
        assert!(text.contains("Filter: xy.y > 0"), "{}", text);

        let physical = plan("select * from xy inner join uv on u = x or u = y");
        assert_eq!(physical.join_types(), vec![JoinType::Lookup]);
        assert!(physical.to_string().contains("concat [xy.x, xy.y]"), "{}", physical);
    }

    #[test]
    fn test_disabled_strategies_fall_back() {
        let options = PlannerOptions {
            enable_hash_join: false,
            ..PlannerOptions::default()
        };
        let physical = plan_with(
            "select * from xy where y - 1 in (select u from uv order by 1 limit 1)",
            &catalog(false),
            &options,
        );
        assert_eq!(physical.join_types(), vec![JoinType::Inner]);

        let options = PlannerOptions {
            enable_merge_join: false,
            enable_lookup_join: false,
            ..PlannerOptions::default()
        };
        let physical = plan_with("select * from rs left outer join xy on y = s", &catalog(false), &options);
        assert_eq!(physical.join_types(), vec![JoinType::LeftOuterHash]);
    }

    #[test]
    fn test_unique_on_follows_equalities() {
        let snapshot = catalog(false);
        let query = Parser::parse_query("select u from uv inner join ab on u = a").unwrap();
        let bound = Binder::new(&snapshot, 1000).bind(&query).unwrap();
        let cols: BTreeSet<ColumnRef> = bound.plan.output_columns().into_iter().collect();
        assert!(unique_on(&bound.plan, &cols, &snapshot));

        let query = Parser::parse_query("select v from uv").unwrap();
        let bound = Binder::new(&snapshot, 1000).bind(&query).unwrap();
        let cols: BTreeSet<ColumnRef> = bound.plan.output_columns().into_iter().collect();
        assert!(!unique_on(&bound.plan, &cols, &snapshot));
    }
}
