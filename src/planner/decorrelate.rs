//! Subquery decorrelation.
//!
//! Subquery predicates in a WHERE clause are rewritten into joins against
//! the outer FROM region, innermost scope first. Correlated conjuncts of the
//! subquery's WHERE are pulled up into the join predicate; the inner columns
//! they need are exposed through a synthetic `applySubq<N>` alias. Subqueries
//! whose shape cannot be merged (aggregation, windows, LIMIT/OFFSET) are
//! materialized as a join when uncorrelated and left as expressions
//! otherwise.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::error::PlanResult;
use super::expr::{ColumnRef, ScalarExpr, SubqueryExpr, SubqueryKind};
use super::logical::{JoinKind, LogicalPlan, ProjectItem};
use super::scope::ScopeId;
use crate::sql::BinaryOperator;

/// The predicate a subquery participates in.
#[derive(Debug, Clone)]
enum SubqueryTest {
    Exists,
    NotExists,
    In(ScalarExpr),
    NotIn(ScalarExpr),
    /// `lhs op (subquery)`
    Compare(ScalarExpr, BinaryOperator),
}

impl SubqueryTest {
    fn classify(conjunct: &ScalarExpr) -> Option<(&SubqueryExpr, SubqueryTest)> {
        match conjunct {
            ScalarExpr::Subquery(sub) => match &sub.kind {
                SubqueryKind::Exists => Some((&**sub, SubqueryTest::Exists)),
                SubqueryKind::In { operand } if !operand.contains_subquery() => {
                    Some((&**sub, SubqueryTest::In(*operand.clone())))
                }
                _ => None,
            },
            ScalarExpr::Not(inner) => match inner.as_ref() {
                ScalarExpr::Subquery(sub) => match &sub.kind {
                    SubqueryKind::Exists => Some((&**sub, SubqueryTest::NotExists)),
                    SubqueryKind::In { operand } if !operand.contains_subquery() => {
                        Some((&**sub, SubqueryTest::NotIn(*operand.clone())))
                    }
                    _ => None,
                },
                _ => None,
            },
            ScalarExpr::Binary { left, op, right } if op.is_comparison() => {
                match (left.as_ref(), right.as_ref()) {
                    (lhs, ScalarExpr::Subquery(sub))
                        if sub.kind == SubqueryKind::Scalar && !lhs.contains_subquery() =>
                    {
                        Some((&**sub, SubqueryTest::Compare(lhs.clone(), *op)))
                    }
                    (ScalarExpr::Subquery(sub), rhs)
                        if sub.kind == SubqueryKind::Scalar && !rhs.contains_subquery() =>
                    {
                        Some((&**sub, SubqueryTest::Compare(rhs.clone(), op.flipped())))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn is_existence(&self) -> bool {
        matches!(self, SubqueryTest::Exists | SubqueryTest::NotExists)
    }
}

/// A subquery reduced to projection, WHERE conjuncts and FROM region.
struct SubqueryShape {
    items: Vec<ProjectItem>,
    conjuncts: Vec<ScalarExpr>,
    body: Arc<LogicalPlan>,
}

/// Why a subquery cannot be merged into the outer scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    Aggregation,
    Window,
    Limit,
    Offset,
    Cast,
    Shape,
}

impl Blocker {
    fn describe(&self) -> &'static str {
        match self {
            Blocker::Aggregation => "aggregation",
            Blocker::Window => "window function",
            Blocker::Limit => "LIMIT",
            Blocker::Offset => "OFFSET",
            Blocker::Cast => "CAST on the compared column",
            Blocker::Shape => "unsupported subquery shape",
        }
    }
}

fn strip(plan: &Arc<LogicalPlan>, test: &SubqueryTest) -> Result<SubqueryShape, Blocker> {
    let mut node = plan;
    let mut items: Option<Vec<ProjectItem>> = None;
    let mut conjuncts = Vec::new();
    loop {
        match node.as_ref() {
            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => {
                if *offset > 0 {
                    return Err(Blocker::Offset);
                }
                match limit {
                    None => {}
                    // Existence only needs one row.
                    Some(n) if test.is_existence() && *n >= 1 => {}
                    Some(_) => return Err(Blocker::Limit),
                }
                node = input;
            }
            // The unnested join is unordered until the outer ORDER BY.
            LogicalPlan::Sort { input, .. } | LogicalPlan::Distinct { input } => node = input,
            LogicalPlan::Project { input, items: p } if items.is_none() => {
                items = Some(p.clone());
                node = input;
            }
            LogicalPlan::Filter { input, predicate } if items.is_some() => {
                conjuncts.extend(predicate.clone().split_conjuncts());
                node = input;
            }
            LogicalPlan::Aggregate { .. } => return Err(Blocker::Aggregation),
            LogicalPlan::Window { .. } => return Err(Blocker::Window),
            LogicalPlan::Scan { .. }
            | LogicalPlan::Join { .. }
            | LogicalPlan::SubqueryAlias { .. }
            | LogicalPlan::OneRow { .. } => break,
            _ => return Err(Blocker::Shape),
        }
    }
    let items = items.ok_or(Blocker::Shape)?;
    if !test.is_existence()
        && items
            .iter()
            .any(|i| matches!(i.expr, ScalarExpr::Cast { .. }))
    {
        return Err(Blocker::Cast);
    }
    Ok(SubqueryShape {
        items,
        conjuncts,
        body: Arc::clone(node),
    })
}

/// A WHERE filter directly over a FROM region is where subqueries unnest.
pub(crate) fn is_region(plan: &LogicalPlan) -> bool {
    matches!(
        plan,
        LogicalPlan::Scan { .. }
            | LogicalPlan::Join { .. }
            | LogicalPlan::SubqueryAlias { .. }
            | LogicalPlan::OneRow { .. }
    )
}

pub(crate) fn region_scope(plan: &LogicalPlan) -> Option<ScopeId> {
    match plan {
        LogicalPlan::Scan { scope, .. }
        | LogicalPlan::Join { scope, .. }
        | LogicalPlan::SubqueryAlias { scope, .. }
        | LogicalPlan::OneRow { scope } => Some(*scope),
        _ => None,
    }
}

/// Names of the relations joined in a region.
pub(crate) fn region_names(plan: &LogicalPlan, out: &mut BTreeSet<String>) {
    match plan {
        LogicalPlan::Join { left, right, .. } => {
            region_names(left, out);
            region_names(right, out);
        }
        LogicalPlan::Filter { input, .. }
        | LogicalPlan::Distinct { input }
        | LogicalPlan::Project { input, .. } => region_names(input, out),
        other => {
            if let Some(name) = other.relation_name() {
                out.insert(name.to_string());
            }
        }
    }
}

fn filter_over(input: Arc<LogicalPlan>, conjuncts: Vec<ScalarExpr>) -> Arc<LogicalPlan> {
    match ScalarExpr::conjoin(conjuncts) {
        Some(predicate) => Arc::new(LogicalPlan::Filter { input, predicate }),
        None => input,
    }
}

/// Move a relation into another scope.
fn rescope(plan: &LogicalPlan, scope: ScopeId) -> Arc<LogicalPlan> {
    Arc::new(match plan {
        LogicalPlan::Scan {
            table,
            relation,
            name,
            columns,
            estimate,
            ..
        } => LogicalPlan::Scan {
            table: table.clone(),
            relation: relation.clone(),
            name: name.clone(),
            columns: columns.clone(),
            estimate: *estimate,
            scope,
        },
        LogicalPlan::SubqueryAlias {
            relation,
            name,
            input,
            columns,
            ..
        } => LogicalPlan::SubqueryAlias {
            relation: relation.clone(),
            name: name.clone(),
            scope,
            input: Arc::clone(input),
            columns: columns.clone(),
        },
        other => other.clone(),
    })
}

/// `operand = col` per column; a tuple operand compares column-wise.
fn equalities(operand: &ScalarExpr, columns: &[ColumnRef]) -> Option<Vec<ScalarExpr>> {
    match operand {
        ScalarExpr::Tuple(items) if items.len() == columns.len() => Some(
            items
                .iter()
                .zip(columns)
                .map(|(l, c)| ScalarExpr::eq(l.clone(), ScalarExpr::Column(c.clone())))
                .collect(),
        ),
        ScalarExpr::Tuple(_) => None,
        single if columns.len() == 1 => Some(vec![ScalarExpr::eq(
            single.clone(),
            ScalarExpr::Column(columns[0].clone()),
        )]),
        _ => None,
    }
}

/// Join predicate and kind for an IN or comparison test against `columns`.
fn comparison(
    test: &SubqueryTest,
    columns: &[ColumnRef],
    correlated: bool,
) -> Option<(JoinKind, Vec<ScalarExpr>, bool)> {
    match test {
        SubqueryTest::Exists => Some((JoinKind::Semi, Vec::new(), false)),
        SubqueryTest::NotExists => Some((JoinKind::Anti, Vec::new(), false)),
        SubqueryTest::In(operand) => Some((JoinKind::Semi, equalities(operand, columns)?, false)),
        SubqueryTest::NotIn(operand) => Some((JoinKind::Anti, equalities(operand, columns)?, false)),
        SubqueryTest::Compare(lhs, BinaryOperator::Eq) => {
            Some((JoinKind::Semi, equalities(lhs, columns)?, false))
        }
        // An empty scalar result compares as NULL. The guard models that for
        // the whole statement, which is only right when the subquery does not
        // depend on the outer row.
        SubqueryTest::Compare(lhs, BinaryOperator::NotEq) if !correlated => {
            Some((JoinKind::Anti, equalities(lhs, columns)?, true))
        }
        SubqueryTest::Compare(_, BinaryOperator::NotEq) => None,
        SubqueryTest::Compare(ScalarExpr::Tuple(_), _) => None,
        SubqueryTest::Compare(lhs, op) if columns.len() == 1 => Some((
            JoinKind::Semi,
            vec![ScalarExpr::binary(
                lhs.clone(),
                *op,
                ScalarExpr::Column(columns[0].clone()),
            )],
            false,
        )),
        SubqueryTest::Compare(..) => None,
    }
}

/// Rewrites subquery predicates into joins.
#[derive(Debug, Default)]
pub struct Decorrelator {
    next_alias: usize,
}

impl Decorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a plan bottom-up so inner scopes are unnested before the
    /// scopes that contain them.
    pub fn rewrite(&mut self, plan: &Arc<LogicalPlan>) -> PlanResult<Arc<LogicalPlan>> {
        let children = plan
            .children()
            .into_iter()
            .map(|c| self.rewrite(c))
            .collect::<PlanResult<Vec<_>>>()?;
        let node = if children.is_empty() {
            LogicalPlan::clone(plan)
        } else {
            plan.with_children(children)
        };
        let node = node.map_expressions(&mut |e| self.rewrite_subqueries(e))?;

        match &node {
            LogicalPlan::Filter { input, predicate } if is_region(input) => {
                self.decorrelate_filter(input, predicate)
            }
            _ => Ok(Arc::new(node)),
        }
    }

    fn rewrite_subqueries(&mut self, expr: &ScalarExpr) -> PlanResult<ScalarExpr> {
        expr.try_transform(&mut |e| match e {
            ScalarExpr::Subquery(sub) => {
                let plan = self.rewrite(&sub.plan)?;
                let kind = match &sub.kind {
                    SubqueryKind::In { operand } => SubqueryKind::In {
                        operand: Box::new(self.rewrite_subqueries(operand)?),
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

    fn decorrelate_filter(
        &mut self,
        region: &Arc<LogicalPlan>,
        predicate: &ScalarExpr,
    ) -> PlanResult<Arc<LogicalPlan>> {
        let Some(scope) = region_scope(region) else {
            return Ok(Arc::new(LogicalPlan::Filter {
                input: Arc::clone(region),
                predicate: predicate.clone(),
            }));
        };

        let mut region = Arc::clone(region);
        let mut remaining = Vec::new();
        for conjunct in predicate.clone().split_conjuncts() {
            match self.unnest(&region, &conjunct, scope) {
                Some(next) => region = next,
                None => remaining.push(conjunct),
            }
        }
        Ok(filter_over(region, remaining))
    }

    fn unnest(
        &mut self,
        region: &Arc<LogicalPlan>,
        conjunct: &ScalarExpr,
        scope: ScopeId,
    ) -> Option<Arc<LogicalPlan>> {
        let (sub, test) = SubqueryTest::classify(conjunct)?;
        let correlated = sub.is_correlated();

        let blocker = match strip(&sub.plan, &test) {
            Ok(shape) => {
                if let Some(plan) = self.merge(region, sub, &test, shape, scope, correlated) {
                    return Some(plan);
                }
                None
            }
            Err(blocker) => Some(blocker),
        };

        if blocker == Some(Blocker::Cast) {
            debug!(subquery = sub.id, "CAST on compared column, subquery evaluated per row");
            return None;
        }
        if correlated {
            debug!(
                subquery = sub.id,
                reason = blocker.map(|b| b.describe()).unwrap_or("correlation cannot be pulled up"),
                "correlated subquery left in place"
            );
            return None;
        }
        self.materialize(region, sub, &test, scope, blocker)
    }

    fn next_alias(&mut self) -> String {
        let name = format!("applySubq{}", self.next_alias);
        self.next_alias += 1;
        name
    }

    /// Merge an unblocked subquery into the outer scope.
    fn merge(
        &mut self,
        region: &Arc<LogicalPlan>,
        sub: &SubqueryExpr,
        test: &SubqueryTest,
        shape: SubqueryShape,
        scope: ScopeId,
        correlated: bool,
    ) -> Option<Arc<LogicalPlan>> {
        let inner = sub.plan.produced_relations();
        let (pulled, local): (Vec<ScalarExpr>, Vec<ScalarExpr>) = shape
            .conjuncts
            .into_iter()
            .partition(|c| c.relations().iter().any(|r| !inner.contains(r)));
        if pulled.iter().any(ScalarExpr::contains_subquery) {
            return None;
        }

        // EXISTS over a single relation joins it directly under its own name.
        if test.is_existence()
            && matches!(
                shape.body.as_ref(),
                LogicalPlan::Scan { .. } | LogicalPlan::SubqueryAlias { .. }
            )
        {
            let mut names = BTreeSet::new();
            region_names(region, &mut names);
            let collides = shape
                .body
                .relation_name()
                .is_some_and(|n| names.contains(n));
            if !collides && !shape.body.is_correlated() {
                let kind = if matches!(test, SubqueryTest::Exists) {
                    JoinKind::Semi
                } else {
                    JoinKind::Anti
                };
                debug!(
                    subquery = sub.id,
                    relation = shape.body.relation_name().unwrap_or_default(),
                    kind = %kind,
                    "merged EXISTS relation into outer scope"
                );
                return Some(Arc::new(LogicalPlan::Join {
                    kind,
                    left: Arc::clone(region),
                    right: rescope(&shape.body, scope),
                    predicate: ScalarExpr::conjoin(local.into_iter().chain(pulled)),
                    scalar_guard: false,
                    scope,
                }));
            }
        }

        let out_relation = shape.items.first()?.output.relation.clone();
        let mut items: Vec<ProjectItem> = if test.is_existence() {
            Vec::new()
        } else {
            shape.items.clone()
        };
        let compared = items.len();

        // Inner columns read by the pulled-up conjuncts.
        let exposed: BTreeSet<ColumnRef> = pulled
            .iter()
            .flat_map(|c| c.column_refs())
            .filter(|c| inner.contains(&c.relation))
            .collect();
        let mut taken: BTreeSet<String> = items.iter().map(|i| i.output.column.clone()).collect();
        for column in &exposed {
            let mut name = column.column.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}", column.column, n);
                n += 1;
            }
            items.push(ProjectItem {
                expr: ScalarExpr::Column(column.clone()),
                output: ColumnRef::new(out_relation.clone(), name.clone()),
                name,
            });
        }

        let project = Arc::new(LogicalPlan::Project {
            input: filter_over(shape.body, local),
            items: items.clone(),
        });
        if project.is_correlated() {
            return None;
        }

        let alias = self.peek_alias();
        let alias_columns: Vec<ColumnRef> = items
            .iter()
            .map(|i| ColumnRef::new(alias.clone(), i.output.column.clone()))
            .collect();
        let (kind, mut predicate, scalar_guard) =
            comparison(test, &alias_columns[..compared], correlated)?;

        let renamed: Vec<ScalarExpr> = pulled
            .iter()
            .map(|c| {
                c.rename_columns(&|col| {
                    exposed
                        .iter()
                        .position(|e| e == col)
                        .map(|i| alias_columns[compared + i].clone())
                })
            })
            .collect();
        predicate.extend(renamed);

        let alias = self.next_alias();
        debug!(
            subquery = sub.id,
            alias = %alias,
            kind = %kind,
            pulled = pulled.len(),
            "unnested subquery"
        );
        let right = Arc::new(LogicalPlan::SubqueryAlias {
            relation: alias.clone(),
            name: alias,
            scope,
            input: project,
            columns: items
                .iter()
                .zip(&alias_columns)
                .map(|(i, a)| (i.output.clone(), a.clone()))
                .collect(),
        });
        Some(Arc::new(LogicalPlan::Join {
            kind,
            left: Arc::clone(region),
            right,
            predicate: ScalarExpr::conjoin(predicate),
            scalar_guard,
            scope,
        }))
    }

    fn peek_alias(&self) -> String {
        format!("applySubq{}", self.next_alias)
    }

    /// Join against the full result of an uncorrelated subquery that could
    /// not be merged.
    fn materialize(
        &mut self,
        region: &Arc<LogicalPlan>,
        sub: &SubqueryExpr,
        test: &SubqueryTest,
        scope: ScopeId,
        blocker: Option<Blocker>,
    ) -> Option<Arc<LogicalPlan>> {
        let alias = self.peek_alias();
        let columns: Vec<(ColumnRef, ColumnRef)> = sub
            .plan
            .output_columns()
            .into_iter()
            .map(|c| {
                let outer = ColumnRef::new(alias.clone(), c.column.clone());
                (c, outer)
            })
            .collect();
        let alias_columns: Vec<ColumnRef> = columns.iter().map(|(_, o)| o.clone()).collect();

        let (kind, predicate, scalar_guard) = comparison(test, &alias_columns, false)?;
        // IN keeps every outer row once per distinct match, as an inner join
        // over the distinct subquery result.
        let distinct = matches!(
            test,
            SubqueryTest::In(_) | SubqueryTest::Compare(_, BinaryOperator::Eq)
        );
        let kind = if distinct { JoinKind::Inner } else { kind };

        let alias = self.next_alias();
        debug!(
            subquery = sub.id,
            alias = %alias,
            kind = %kind,
            reason = blocker.map(|b| b.describe()).unwrap_or("uncorrelated"),
            "materialized blocked subquery"
        );
        let mut right = Arc::new(LogicalPlan::SubqueryAlias {
            relation: alias.clone(),
            name: alias,
            scope,
            input: Arc::clone(&sub.plan),
            columns,
        });
        if distinct {
            right = Arc::new(LogicalPlan::Distinct { input: right });
        }
        Some(Arc::new(LogicalPlan::Join {
            kind,
            left: Arc::clone(region),
            right,
            predicate: ScalarExpr::conjoin(predicate),
            scalar_guard,
            scope,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogSnapshot, DataType, SchemaBuilder};
    use crate::planner::binder::Binder;
    use crate::sql::Parser;

    fn catalog() -> CatalogSnapshot {
        let catalog = Catalog::new();
        for (table, a, b) in [("xy", "x", "y"), ("rs", "r", "s"), ("uv", "u", "v")] {
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

    fn decorrelate(sql: &str) -> String {
        let snapshot = catalog();
        let query = Parser::parse_query(sql).unwrap();
        let bound = Binder::new(&snapshot, 1000).bind(&query).unwrap();
        Decorrelator::new().rewrite(&bound.plan).unwrap().to_string()
    }

    #[test]
    fn test_in_becomes_semi_join() {
        let plan = decorrelate("select * from xy where y - 1 in (select u from uv)");
        assert!(plan.contains("Join: SEMI ON (xy.y - 1) = applySubq0.u"), "{}", plan);
        assert!(plan.contains("SubqueryAlias: applySubq0"), "{}", plan);
        assert!(!plan.contains("Subquery#"), "{}", plan);
    }

    #[test]
    fn test_correlated_conjunct_is_pulled_up() {
        let plan = decorrelate("select * from xy where x in (select u from uv where v = y and u > 0)");
        assert!(
            plan.contains("Join: SEMI ON (xy.x = applySubq0.u) AND (applySubq0.v = xy.y)"),
            "{}",
            plan
        );
        assert!(plan.contains("Filter: uv.u > 0"), "{}", plan);
    }

    #[test]
    fn test_not_in_and_scalar_not_equal() {
        let plan = decorrelate("select * from xy where y + 1 not in (select u from uv)");
        assert!(plan.contains("Join: ANTI ON (xy.y + 1) = applySubq0.u"), "{}", plan);

        let plan = decorrelate("select * from xy where x != (select r from rs where r = 1)");
        assert!(plan.contains("Join: ANTI ON xy.x = applySubq0.r (scalar)"), "{}", plan);

        // Correlated scalar inequality keeps per-row evaluation.
        let plan = decorrelate("select * from xy where x != (select r from rs where s = y)");
        assert!(plan.contains("Subquery#0"), "{}", plan);
    }

    #[test]
    fn test_exists_merges_single_relation() {
        let plan = decorrelate("select * from xy where exists (select * from uv where u = x and v = 1)");
        assert!(
            plan.contains("Join: SEMI ON (uv.v = 1) AND (uv.u = xy.x)"),
            "{}",
            plan
        );
        assert!(plan.contains("Scan: uv"), "{}", plan);
        assert!(!plan.contains("applySubq"), "{}", plan);

        // A name already used in the outer scope goes through an alias.
        let plan = decorrelate("select * from xy where not exists (select * from xy where x = 1)");
        assert!(plan.contains("Join: ANTI"), "{}", plan);
        assert!(plan.contains("SubqueryAlias: applySubq0"), "{}", plan);
    }

    #[test]
    fn test_limit_blocks_merge() {
        let plan = decorrelate("select * from xy where y - 1 in (select u from uv order by 1 limit 1)");
        assert!(plan.contains("Join: INNER ON (xy.y - 1) = applySubq0.u"), "{}", plan);
        assert!(plan.contains("Distinct"), "{}", plan);
        assert!(plan.contains("Limit: 1"), "{}", plan);

        let plan = decorrelate("select * from xy where x != (select u from uv limit 1 offset 5)");
        assert!(plan.contains("Join: ANTI ON xy.x = applySubq0.u (scalar)"), "{}", plan);

        let plan = decorrelate("select * from xy where y >= (select max(u) as m from uv)");
        assert!(plan.contains("Join: SEMI ON xy.y >= applySubq0.m"), "{}", plan);
    }

    #[test]
    fn test_blocked_correlated_stays_expression() {
        let plan = decorrelate("select * from xy where x in (select max(u) from uv where v = y group by v)");
        assert!(plan.contains("Subquery#0"), "{}", plan);
        assert!(!plan.contains("applySubq"), "{}", plan);

        let plan = decorrelate("select * from xy where x in (select cast(u as int) from uv)");
        assert!(plan.contains("Subquery#0"), "{}", plan);
    }

    #[test]
    fn test_exists_discards_limit() {
        let plan = decorrelate("select * from xy where exists (select 1 from uv where u = x limit 1)");
        assert!(plan.contains("Join: SEMI ON uv.u = xy.x"), "{}", plan);
    }
}
