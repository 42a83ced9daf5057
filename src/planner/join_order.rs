//! Join ordering.
//!
//! A FROM region (the tree of joins of one scope, plus its WHERE filter) is
//! flattened into items and a pool of conjuncts, then rebuilt as a left-deep
//! tree. Base relations are ordered by estimated size unless the scope has a
//! `JOIN_ORDER` hint; semi, anti and left outer joins are placed once the
//! relations they depend on are.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use super::error::{HintError, PlanError, PlanResult};
use super::expr::{ColumnRef, ScalarExpr, SubqueryExpr};
use super::logical::{JoinKind, LogicalPlan, ProjectItem};
use super::scope::{ScopeId, ScopeTree};

#[derive(Debug, Clone)]
enum Role {
    Base,
    /// Right side of a semi or anti join.
    Existence {
        kind: JoinKind,
        predicate: Vec<ScalarExpr>,
        deps: BTreeSet<String>,
        scalar_guard: bool,
    },
    /// Right side of a left outer join.
    Outer {
        predicate: Vec<ScalarExpr>,
        deps: BTreeSet<String>,
    },
}

#[derive(Debug, Clone)]
struct Item {
    plan: Arc<LogicalPlan>,
    name: Option<String>,
    relations: BTreeSet<String>,
    role: Role,
}

impl Item {
    fn new(plan: Arc<LogicalPlan>, role: Role) -> Self {
        let relations = plan
            .output_columns()
            .into_iter()
            .map(|c| c.relation)
            .collect();
        Self {
            name: leaf_name(&plan).map(String::from),
            plan,
            relations,
            role,
        }
    }
}

/// Name a join leaf is referred to by in a hint.
fn leaf_name(plan: &LogicalPlan) -> Option<&str> {
    match plan {
        LogicalPlan::Filter { input, .. }
        | LogicalPlan::Distinct { input }
        | LogicalPlan::Project { input, .. } => leaf_name(input),
        other => other.relation_name(),
    }
}

fn filter_over(input: Arc<LogicalPlan>, conjuncts: Vec<ScalarExpr>) -> Arc<LogicalPlan> {
    match ScalarExpr::conjoin(conjuncts) {
        Some(predicate) => Arc::new(LogicalPlan::Filter { input, predicate }),
        None => input,
    }
}

/// Split `predicate` into conjuncts that only read `relations` and the rest.
fn split_local(
    predicate: Option<&ScalarExpr>,
    relations: &BTreeSet<String>,
) -> (Vec<ScalarExpr>, Vec<ScalarExpr>) {
    predicate
        .map(|p| p.clone().split_conjuncts())
        .unwrap_or_default()
        .into_iter()
        .partition(|c| {
            let refs = c.relations();
            !refs.is_empty() && refs.is_subset(relations)
        })
}

/// A conjunct of the region's pool with the region relations it reads.
struct Conjunct {
    expr: ScalarExpr,
    refs: BTreeSet<String>,
}

/// Reorders the joins of every scope.
pub struct JoinOrderer<'a> {
    scopes: &'a ScopeTree,
}

impl<'a> JoinOrderer<'a> {
    pub fn new(scopes: &'a ScopeTree) -> Self {
        Self { scopes }
    }

    pub fn reorder(&self, plan: &Arc<LogicalPlan>) -> PlanResult<Arc<LogicalPlan>> {
        let node = plan.map_expressions(&mut |e| self.reorder_subqueries(e))?;
        match &node {
            LogicalPlan::Filter { input, predicate } if matches!(input.as_ref(), LogicalPlan::Join { .. }) => {
                self.order_region(input, Some(predicate))
            }
            LogicalPlan::Join { .. } => self.order_region(&Arc::new(node), None),
            _ => {
                let children = node
                    .children()
                    .into_iter()
                    .map(|c| self.reorder(c))
                    .collect::<PlanResult<Vec<_>>>()?;
                if children.is_empty() {
                    Ok(Arc::new(node))
                } else {
                    Ok(Arc::new(node.with_children(children)))
                }
            }
        }
    }

    /// Check every hinted scope against the relations it ends up with.
    ///
    /// Regions with joins are checked while they are ordered; this also
    /// covers single-relation scopes and scopes whose relations were merged
    /// into their parent, which are checked against the relations they were
    /// bound with.
    pub fn validate_hints(&self, bound: &LogicalPlan, ordered: &LogicalPlan) -> PlanResult<()> {
        let mut current = BTreeMap::new();
        scope_relations(ordered, &mut current);
        let mut original = BTreeMap::new();
        scope_relations(bound, &mut original);

        for scope in 0..self.scopes.len() {
            let Some(hint) = self.scopes.hint(scope) else {
                continue;
            };
            let names = current
                .get(&scope)
                .or_else(|| original.get(&scope))
                .cloned()
                .unwrap_or_default();
            check_hint(scope, &names, &hint.relations)?;
        }
        Ok(())
    }

    fn reorder_subqueries(&self, expr: &ScalarExpr) -> PlanResult<ScalarExpr> {
        expr.try_transform(&mut |e| match e {
            ScalarExpr::Subquery(sub) => {
                let plan = self.reorder(&sub.plan)?;
                Ok(Some(ScalarExpr::Subquery(Box::new(SubqueryExpr {
                    plan,
                    ..SubqueryExpr::clone(sub)
                }))))
            }
            _ => Ok(None),
        })
    }

    fn flatten(
        &self,
        plan: &Arc<LogicalPlan>,
        scope: ScopeId,
        items: &mut Vec<Item>,
        pool: &mut Vec<ScalarExpr>,
    ) -> PlanResult<()> {
        let LogicalPlan::Join {
            kind,
            left,
            right,
            predicate,
            scalar_guard,
            scope: join_scope,
        } = plan.as_ref()
        else {
            items.push(Item::new(self.reorder(plan)?, Role::Base));
            return Ok(());
        };
        if *join_scope != scope {
            items.push(Item::new(self.reorder(plan)?, Role::Base));
            return Ok(());
        }
        let predicate = predicate
            .as_ref()
            .map(|p| self.reorder_subqueries(p))
            .transpose()?;

        match kind {
            JoinKind::Cross | JoinKind::Inner => {
                self.flatten(left, scope, items, pool)?;
                self.flatten(right, scope, items, pool)?;
                pool.extend(predicate.map(ScalarExpr::split_conjuncts).unwrap_or_default());
            }
            JoinKind::LeftOuter | JoinKind::Semi | JoinKind::Anti => {
                let before = items.len();
                self.flatten(left, scope, items, pool)?;
                let left_relations: BTreeSet<String> = items[before..]
                    .iter()
                    .flat_map(|i| i.relations.iter().cloned())
                    .collect();

                if *kind == JoinKind::LeftOuter
                    && matches!(right.as_ref(), LogicalPlan::Join { scope: s, .. } if *s == scope)
                {
                    return Err(PlanError::Unsupported(
                        "left outer join with a join on its right side".into(),
                    ));
                }
                let right = self.reorder(right)?;
                let right_relations: BTreeSet<String> = right
                    .output_columns()
                    .into_iter()
                    .map(|c| c.relation)
                    .collect();

                // Conditions on the right side alone filter it before matching.
                let (local, rest) = split_local(predicate.as_ref(), &right_relations);
                let right = filter_over(right, local);
                let role = if *kind == JoinKind::LeftOuter {
                    Role::Outer {
                        predicate: rest,
                        deps: left_relations,
                    }
                } else {
                    let deps = rest
                        .iter()
                        .flat_map(|c| c.relations())
                        .filter(|r| left_relations.contains(r))
                        .collect();
                    Role::Existence {
                        kind: *kind,
                        predicate: rest,
                        deps,
                        scalar_guard: *scalar_guard,
                    }
                };
                items.push(Item::new(right, role));
            }
        }
        Ok(())
    }

    fn order_region(
        &self,
        region: &Arc<LogicalPlan>,
        filter: Option<&ScalarExpr>,
    ) -> PlanResult<Arc<LogicalPlan>> {
        let LogicalPlan::Join { scope, .. } = region.as_ref() else {
            return Err(PlanError::Internal("join region without a join".into()));
        };
        let scope = *scope;

        let mut items = Vec::new();
        let mut conjuncts = filter
            .map(|f| f.clone().split_conjuncts())
            .unwrap_or_default();
        self.flatten(region, scope, &mut items, &mut conjuncts)?;

        let region_relations: BTreeSet<String> = items
            .iter()
            .flat_map(|i| i.relations.iter().cloned())
            .collect();
        let outer_side: BTreeSet<String> = items
            .iter()
            .filter(|i| matches!(i.role, Role::Outer { .. }))
            .flat_map(|i| i.relations.iter().cloned())
            .collect();

        // Push single-relation conjuncts onto their relation; keep the rest
        // for the joins.
        let mut pushed: Vec<Vec<ScalarExpr>> = vec![Vec::new(); items.len()];
        let mut pool = Vec::new();
        let mut residual = Vec::new();
        for expr in conjuncts {
            let refs: BTreeSet<String> = expr
                .relations()
                .intersection(&region_relations)
                .cloned()
                .collect();
            if refs.is_empty() || !refs.is_disjoint(&outer_side) {
                residual.push(expr);
                continue;
            }
            let target = items
                .iter()
                .position(|i| matches!(i.role, Role::Base) && refs.is_subset(&i.relations));
            match target {
                Some(index) => pushed[index].push(expr),
                None => pool.push(Conjunct { expr, refs }),
            }
        }
        for (item, conjuncts) in items.iter_mut().zip(pushed) {
            if !conjuncts.is_empty() {
                item.plan = filter_over(Arc::clone(&item.plan), conjuncts);
            }
        }

        let order = match self.scopes.hint(scope) {
            Some(hint) => hinted_order(scope, &items, &hint.relations)?,
            None => estimated_order(&items),
        };
        debug!(
            scope,
            order = ?order.iter().map(|&i| items[i].name.clone().unwrap_or_default()).collect::<Vec<_>>(),
            hinted = self.scopes.hint(scope).is_some(),
            "join order"
        );

        let mut tree: Option<Arc<LogicalPlan>> = None;
        let mut placed: BTreeSet<String> = BTreeSet::new();
        for index in order {
            let item = &items[index];
            let name = item.name.clone().unwrap_or_default();
            match &item.role {
                Role::Base => {
                    tree = Some(attach(tree, &item.plan, &item.relations, &mut placed, &mut pool, scope));
                }
                Role::Existence {
                    kind,
                    predicate,
                    deps,
                    scalar_guard,
                } => {
                    // The tree built so far stays in place if the join is not ready.
                    let ready = tree.clone().filter(|_| deps.is_subset(&placed));
                    if let Some(left) = ready {
                        tree = Some(Arc::new(LogicalPlan::Join {
                            kind: *kind,
                            left,
                            right: Arc::clone(&item.plan),
                            predicate: ScalarExpr::conjoin(predicate.iter().cloned()),
                            scalar_guard: *scalar_guard,
                            scope,
                        }));
                    } else if *kind == JoinKind::Semi {
                        // A semi join placed before its dependencies becomes an
                        // inner join over the distinct matching values.
                        let right = distinct_projection(&item.plan, &item.relations, predicate);
                        for expr in predicate {
                            let refs = expr
                                .relations()
                                .intersection(&region_relations)
                                .cloned()
                                .collect();
                            pool.push(Conjunct {
                                expr: expr.clone(),
                                refs,
                            });
                        }
                        debug!(scope, relation = %name, "semi join placed early, converted to inner join");
                        tree = Some(attach(tree, &right, &item.relations, &mut placed, &mut pool, scope));
                    } else {
                        return Err(HintError::Unsatisfiable {
                            scope,
                            name,
                            reason: dependency_reason("anti join", deps),
                        }
                        .into());
                    }
                }
                Role::Outer { predicate, deps } => {
                    let (true, Some(left)) = (deps.is_subset(&placed), tree.take()) else {
                        return Err(HintError::Unsatisfiable {
                            scope,
                            name,
                            reason: dependency_reason("left outer join", deps),
                        }
                        .into());
                    };
                    tree = Some(Arc::new(LogicalPlan::Join {
                        kind: JoinKind::LeftOuter,
                        left,
                        right: Arc::clone(&item.plan),
                        predicate: ScalarExpr::conjoin(predicate.iter().cloned()),
                        scalar_guard: false,
                        scope,
                    }));
                    placed.extend(item.relations.iter().cloned());
                }
            }
        }

        let tree = tree.ok_or_else(|| PlanError::Internal("empty join region".into()))?;
        residual.extend(pool.into_iter().map(|c| c.expr));
        Ok(filter_over(tree, residual))
    }
}

fn dependency_reason(join: &str, deps: &BTreeSet<String>) -> String {
    if deps.is_empty() {
        format!("the relation its {} filters", join)
    } else {
        format!(
            "the relations its {} depends on ({})",
            join,
            deps.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    }
}

/// Join `right` onto the tree, attaching every pooled conjunct that becomes
/// evaluable.
fn attach(
    tree: Option<Arc<LogicalPlan>>,
    right: &Arc<LogicalPlan>,
    relations: &BTreeSet<String>,
    placed: &mut BTreeSet<String>,
    pool: &mut Vec<Conjunct>,
    scope: ScopeId,
) -> Arc<LogicalPlan> {
    placed.extend(relations.iter().cloned());
    let Some(left) = tree else {
        return Arc::clone(right);
    };
    let (ready, waiting): (Vec<Conjunct>, Vec<Conjunct>) =
        pool.drain(..).partition(|c| c.refs.is_subset(placed));
    *pool = waiting;
    let predicate = ScalarExpr::conjoin(ready.into_iter().map(|c| c.expr));
    Arc::new(LogicalPlan::Join {
        kind: if predicate.is_some() {
            JoinKind::Inner
        } else {
            JoinKind::Cross
        },
        left,
        right: Arc::clone(right),
        predicate,
        scalar_guard: false,
        scope,
    })
}

/// Distinct values of the right-side columns a semi join predicate reads.
fn distinct_projection(
    plan: &Arc<LogicalPlan>,
    relations: &BTreeSet<String>,
    predicate: &[ScalarExpr],
) -> Arc<LogicalPlan> {
    let columns: BTreeSet<ColumnRef> = predicate
        .iter()
        .flat_map(|c| c.column_refs())
        .filter(|c| relations.contains(&c.relation))
        .collect();
    let items = columns
        .into_iter()
        .map(|c| ProjectItem {
            expr: ScalarExpr::Column(c.clone()),
            name: c.column.clone(),
            output: c,
        })
        .collect();
    Arc::new(LogicalPlan::Distinct {
        input: Arc::new(LogicalPlan::Project {
            input: Arc::clone(plan),
            items,
        }),
    })
}

fn hinted_order(scope: ScopeId, items: &[Item], hint: &[String]) -> PlanResult<Vec<usize>> {
    let mut order = Vec::with_capacity(items.len());
    for name in hint {
        let index = items
            .iter()
            .position(|i| i.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .ok_or_else(|| HintError::UnknownRelation {
                scope,
                name: name.clone(),
            })?;
        if order.contains(&index) {
            return Err(HintError::DuplicateRelation {
                scope,
                name: name.clone(),
            }
            .into());
        }
        order.push(index);
    }
    for (index, item) in items.iter().enumerate() {
        if order.contains(&index) {
            continue;
        }
        match &item.name {
            Some(name) => {
                return Err(HintError::MissingRelation {
                    scope,
                    name: name.clone(),
                }
                .into())
            }
            None => order.push(index),
        }
    }
    Ok(order)
}

/// Hint names of the relations of each scope, subquery scopes included.
fn scope_relations(plan: &LogicalPlan, out: &mut BTreeMap<ScopeId, BTreeSet<String>>) {
    match plan {
        LogicalPlan::Scan { name, scope, .. } | LogicalPlan::SubqueryAlias { name, scope, .. } => {
            out.entry(*scope).or_default().insert(name.clone());
        }
        _ => {}
    }
    for expr in plan.expressions() {
        for sub in expr.subqueries() {
            scope_relations(&sub.plan, out);
        }
    }
    for child in plan.children() {
        scope_relations(child, out);
    }
}

fn check_hint(scope: ScopeId, names: &BTreeSet<String>, hint: &[String]) -> PlanResult<()> {
    let mut seen: Vec<&str> = Vec::with_capacity(hint.len());
    for name in hint {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Err(HintError::UnknownRelation {
                scope,
                name: name.clone(),
            }
            .into());
        }
        if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return Err(HintError::DuplicateRelation {
                scope,
                name: name.clone(),
            }
            .into());
        }
        seen.push(name);
    }
    match names
        .iter()
        .find(|n| !hint.iter().any(|h| h.eq_ignore_ascii_case(n)))
    {
        Some(name) => Err(HintError::MissingRelation {
            scope,
            name: name.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Smallest relations first; dependent joins as soon as their inputs are in.
fn estimated_order(items: &[Item]) -> Vec<usize> {
    let mut bases: Vec<usize> = (0..items.len())
        .filter(|&i| matches!(items[i].role, Role::Base))
        .collect();
    bases.sort_by_key(|&i| (items[i].plan.estimated_rows(), i));
    let mut pending: Vec<usize> = (0..items.len())
        .filter(|&i| !matches!(items[i].role, Role::Base))
        .collect();

    let mut order = Vec::with_capacity(items.len());
    let mut placed: BTreeSet<String> = BTreeSet::new();
    for base in bases {
        order.push(base);
        placed.extend(items[base].relations.iter().cloned());
        while let Some(pos) = pending.iter().position(|&i| match &items[i].role {
            Role::Existence { deps, .. } | Role::Outer { deps, .. } => deps.is_subset(&placed),
            Role::Base => true,
        }) {
            let next = pending.remove(pos);
            if matches!(items[next].role, Role::Outer { .. }) {
                placed.extend(items[next].relations.iter().cloned());
            }
            order.push(next);
        }
    }
    order.extend(pending);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DataType, SchemaBuilder};
    use crate::planner::binder::Binder;
    use crate::planner::decorrelate::Decorrelator;
    use crate::sql::Parser;

    fn order(sql: &str) -> PlanResult<String> {
        let catalog = Catalog::new();
        for (table, a, b, rows) in [("xy", "x", "y", 4), ("rs", "r", "s", 5), ("uv", "u", "v", 40)] {
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
            catalog.record_row_count(table, rows);
        }
        let snapshot = catalog.snapshot();
        let query = Parser::parse_query(sql)?;
        let bound = Binder::new(&snapshot, 1000).bind(&query)?;
        let plan = Decorrelator::new().rewrite(&bound.plan)?;
        let orderer = JoinOrderer::new(&bound.scopes);
        let ordered = orderer.reorder(&plan)?;
        orderer.validate_hints(&bound.plan, &ordered)?;
        Ok(ordered.to_string())
    }

    #[test]
    fn test_smaller_relation_first() {
        let plan = order("select * from uv inner join xy on u = x where v > 1").unwrap();
        let joined: Vec<&str> = plan.lines().map(str::trim).collect();
        let xy = joined.iter().position(|l| l.starts_with("Scan: xy")).unwrap();
        let uv = joined.iter().position(|l| l.starts_with("Scan: uv")).unwrap();
        assert!(xy < uv, "{}", plan);
        assert!(plan.contains("Join: INNER ON uv.u = xy.x"), "{}", plan);
        // Single-relation conjunct sits on its relation.
        assert!(plan.contains("Filter: uv.v > 1"), "{}", plan);
    }

    #[test]
    fn test_hint_controls_order() {
        let plan = order("select /*+ JOIN_ORDER(uv, xy) */ * from xy, uv where u = x").unwrap();
        let uv = plan.find("Scan: uv").unwrap();
        let xy = plan.find("Scan: xy").unwrap();
        assert!(uv < xy, "{}", plan);
    }

    #[test]
    fn test_no_predicate_is_cross() {
        let plan = order("select * from xy, rs").unwrap();
        assert!(plan.contains("Join: CROSS"), "{}", plan);
    }

    #[test]
    fn test_semi_placed_early_becomes_inner() {
        let sql = "select /*+ JOIN_ORDER(b, c, a) */ * from xy a inner join xy b on a.x + 3 = b.x \
                   where exists (select 1 from uv c where c.u = a.x + 2)";
        let plan = order(sql).unwrap();
        assert!(!plan.contains("SEMI"), "{}", plan);
        assert!(plan.contains("Distinct"), "{}", plan);
        assert!(plan.contains("Join: CROSS"), "{}", plan);
        // Relations placed before the semi side stay in the tree.
        let b = plan.find("Scan: xy AS b").unwrap();
        let c = plan.find("Scan: uv AS c").unwrap();
        let a = plan.find("Scan: xy AS a").unwrap();
        assert!(b < c && c < a, "{}", plan);

        let sql = "select /*+ JOIN_ORDER(a, c, b) */ * from xy a inner join xy b on a.x + 3 = b.x \
                   where exists (select 1 from uv c where c.u = a.x + 2)";
        let plan = order(sql).unwrap();
        assert!(plan.contains("Join: SEMI ON c.u = (a.x + 2)"), "{}", plan);
    }

    #[test]
    fn test_hint_errors() {
        let err = order("select /*+ JOIN_ORDER(xy, zz) */ * from xy, rs").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::UnknownRelation { .. })), "{}", err);

        let err = order("select /*+ JOIN_ORDER(xy) */ * from xy, rs").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::MissingRelation { .. })), "{}", err);

        let err = order("select /*+ JOIN_ORDER(xy, xy, rs) */ * from xy, rs").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::DuplicateRelation { .. })), "{}", err);

        let err = order("select /*+ JOIN_ORDER(xy, rs) */ * from rs left outer join xy on y = s").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::Unsatisfiable { .. })), "{}", err);
    }

    #[test]
    fn test_hints_checked_without_joins() {
        let err = order("select /*+ JOIN_ORDER(xy, zz) */ * from xy").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::UnknownRelation { ref name, .. }) if name == "zz"), "{}", err);
        assert!(order("select /*+ JOIN_ORDER(xy) */ * from xy").is_ok());

        let err = order("select /*+ JOIN_ORDER(xy, xy) */ * from xy").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::DuplicateRelation { .. })), "{}", err);
    }

    #[test]
    fn test_hints_checked_in_unnested_scopes() {
        // The subquery scope survives under applySubq0.
        let err = order("select * from xy where x in (select /*+ JOIN_ORDER(zz, qq) */ u from uv)").unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::UnknownRelation { scope: 1, .. })), "{}", err);

        // The EXISTS relation moves into scope 0; its own scope keeps its names.
        let sql = "select * from xy where exists (select /*+ JOIN_ORDER(c, zz) */ 1 from uv c where c.u = x)";
        let err = order(sql).unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::UnknownRelation { scope: 1, ref name }) if name == "zz"), "{}", err);
        let sql = "select * from xy where exists (select /*+ JOIN_ORDER(c) */ 1 from uv c where c.u = x)";
        assert!(order(sql).is_ok());

        // A synthetic alias is a relation of the outer scope.
        let sql = "select /*+ JOIN_ORDER(applySubq0, xy) */ * from xy where x in (select u from uv)";
        assert!(order(sql).is_ok());
        let sql = "select /*+ JOIN_ORDER(xy) */ * from xy where x in (select u from uv)";
        let err = order(sql).unwrap_err();
        assert!(matches!(err, PlanError::Hint(HintError::MissingRelation { ref name, .. }) if name == "applySubq0"), "{}", err);
    }

    #[test]
    fn test_where_on_outer_side_stays_above_join() {
        let plan = order("select * from rs left outer join xy on y = s and x > 0 where y is null").unwrap();
        let lines: Vec<&str> = plan.lines().map(str::trim).collect();
        let filter = lines.iter().position(|l| *l == "Filter: xy.y IS NULL").unwrap();
        let join = lines.iter().position(|l| l.starts_with("Join: LEFT OUTER ON xy.y = rs.s")).unwrap();
        assert!(filter < join, "{}", plan);
        assert!(plan.contains("Filter: xy.x > 0"), "{}", plan);
    }
}
