//! Name resolution: turns the SQL AST into a logical plan.
//!
//! Every SELECT gets its own scope. Relations get a row key that is unique
//! across the whole statement, so a correlated reference from a nested scope
//! names exactly one relation no matter how the plan is later reshaped.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::error::{PlanError, PlanResult};
use super::expr::{
    AggregateCall, AggregateFunction, ColumnRef, ScalarExpr, ScalarFunction, SortKey,
    SubqueryExpr, SubqueryKind, WindowCall, WindowFunction,
};
use super::logical::{JoinKind, LogicalPlan, ProjectItem};
use super::scope::{ScopeId, ScopeTree};
use crate::catalog::CatalogReader;
use crate::sql::{
    Expr, JoinKind as SqlJoinKind, LiteralValue, Query, SelectColumn, TableRef, UnaryOperator,
};

/// Output of the binder for one statement.
#[derive(Debug)]
pub struct BoundStatement {
    pub plan: Arc<LogicalPlan>,
    pub column_names: Vec<String>,
    pub scopes: ScopeTree,
}

#[derive(Debug, Clone)]
struct BoundRelation {
    name: String,
    key: String,
    columns: Vec<String>,
}

/// Relations visible in one scope.
#[derive(Debug, Clone)]
struct Frame {
    scope: ScopeId,
    relations: Vec<BoundRelation>,
}

impl Frame {
    fn find(&self, name: &str) -> Option<&BoundRelation> {
        self.relations.iter().find(|r| r.name == name)
    }

    fn resolve(&self, table: Option<&str>, column: &str) -> PlanResult<Option<ColumnRef>> {
        match table {
            Some(t) => match self.find(t) {
                Some(rel) if rel.columns.iter().any(|c| c == column) => {
                    Ok(Some(ColumnRef::new(rel.key.clone(), column)))
                }
                Some(_) => Err(PlanError::ColumnNotFound(format!("{}.{}", t, column))),
                None => Ok(None),
            },
            None => {
                let mut hits = self
                    .relations
                    .iter()
                    .filter(|r| r.columns.iter().any(|c| c == column));
                match (hits.next(), hits.next()) {
                    (None, _) => Ok(None),
                    (Some(rel), None) => Ok(Some(ColumnRef::new(rel.key.clone(), column))),
                    (Some(_), Some(_)) => Err(PlanError::AmbiguousColumn(column.to_string())),
                }
            }
        }
    }
}

struct BoundSelect {
    plan: Arc<LogicalPlan>,
    outputs: Vec<ColumnRef>,
    names: Vec<String>,
    scope: ScopeId,
}

/// ORDER BY target before aggregation rewriting.
enum OrderTarget {
    Item(usize),
    Expr(ScalarExpr),
}

/// Binds one statement against a catalog snapshot.
pub struct Binder<'a> {
    catalog: &'a dyn CatalogReader,
    baseline_estimate: usize,
    scopes: ScopeTree,
    used_keys: HashSet<String>,
    next_subquery: usize,
}

impl<'a> Binder<'a> {
    pub fn new(catalog: &'a dyn CatalogReader, baseline_estimate: u64) -> Self {
        Self {
            catalog,
            baseline_estimate: baseline_estimate as usize,
            scopes: ScopeTree::new(),
            used_keys: HashSet::new(),
            next_subquery: 0,
        }
    }

    pub fn bind(mut self, query: &Query) -> PlanResult<BoundStatement> {
        let bound = self.bind_query(query, None, &[])?;
        debug!(scopes = self.scopes.len(), "bound statement");
        Ok(BoundStatement {
            plan: bound.plan,
            column_names: bound.names,
            scopes: self.scopes,
        })
    }

    fn unique_key(&mut self, name: &str) -> String {
        let mut key = name.to_string();
        let mut n = 2;
        while self.used_keys.contains(&key) {
            key = format!("{}_{}", name, n);
            n += 1;
        }
        self.used_keys.insert(key.clone());
        key
    }

    fn bind_query(
        &mut self,
        query: &Query,
        parent: Option<ScopeId>,
        outer: &[Frame],
    ) -> PlanResult<BoundSelect> {
        let select = &query.body;
        let scope = self.scopes.open(parent, select.hint.clone()).id();
        let mut frame = Frame {
            scope,
            relations: Vec::new(),
        };

        // FROM
        let mut plan: Option<Arc<LogicalPlan>> = None;
        for item in &select.from {
            let right = self.bind_table_ref(item, &mut frame, outer)?;
            plan = Some(match plan {
                None => right,
                Some(left) => Arc::new(LogicalPlan::Join {
                    kind: JoinKind::Cross,
                    left,
                    right,
                    predicate: None,
                    scalar_guard: false,
                    scope,
                }),
            });
        }
        let mut plan = plan.unwrap_or_else(|| Arc::new(LogicalPlan::OneRow { scope }));

        // WHERE
        if let Some(where_clause) = &select.where_clause {
            let predicate = self.bind_expr(where_clause, &frame, outer, None)?;
            if predicate.contains_aggregate() || predicate.contains_window() {
                return Err(PlanError::Unsupported(
                    "aggregate or window function in WHERE".into(),
                ));
            }
            plan = Arc::new(LogicalPlan::Filter {
                input: plan,
                predicate,
            });
        }

        // Select list
        let mut items: Vec<(ScalarExpr, String)> = Vec::new();
        let mut explicit_aliases: Vec<Option<String>> = Vec::new();
        for column in &select.columns {
            match column {
                SelectColumn::Wildcard => {
                    for rel in &frame.relations {
                        for c in &rel.columns {
                            items.push((ScalarExpr::column(rel.key.clone(), c.clone()), c.clone()));
                            explicit_aliases.push(None);
                        }
                    }
                }
                SelectColumn::QualifiedWildcard(table) => {
                    let rel = frame
                        .find(table)
                        .ok_or_else(|| PlanError::TableNotFound(table.clone()))?;
                    for c in &rel.columns {
                        items.push((ScalarExpr::column(rel.key.clone(), c.clone()), c.clone()));
                        explicit_aliases.push(None);
                    }
                }
                SelectColumn::Expr { expr, alias } => {
                    let bound = self.bind_expr(expr, &frame, outer, None)?;
                    let name = match (alias, expr) {
                        (Some(alias), _) => alias.clone(),
                        (None, Expr::Column { name, .. }) => name.clone(),
                        (None, _) => bound.to_string(),
                    };
                    items.push((bound, name));
                    explicit_aliases.push(alias.clone());
                }
            }
        }
        if items.is_empty() {
            return Err(PlanError::Unsupported("empty select list".into()));
        }

        let mut group_by = Vec::with_capacity(select.group_by.len());
        for expr in &select.group_by {
            group_by.push(self.bind_expr(expr, &frame, outer, Some(items.as_slice()))?);
        }
        let mut having = match &select.having {
            Some(expr) => Some(self.bind_expr(expr, &frame, outer, Some(items.as_slice()))?),
            None => None,
        };

        let mut order = Vec::with_capacity(query.order_by.len());
        for key in &query.order_by {
            let target = match &key.expr {
                Expr::Literal(LiteralValue::Integer(n)) => {
                    let idx = usize::try_from(*n)
                        .ok()
                        .and_then(|n| n.checked_sub(1))
                        .filter(|&i| i < items.len())
                        .ok_or_else(|| PlanError::ColumnNotFound(format!("ORDER BY position {}", n)))?;
                    OrderTarget::Item(idx)
                }
                Expr::Column { table: None, name } => {
                    match explicit_aliases
                        .iter()
                        .position(|a| a.as_deref() == Some(name.as_str()))
                    {
                        Some(idx) => OrderTarget::Item(idx),
                        None => OrderTarget::Expr(self.bind_expr(&key.expr, &frame, outer, None)?),
                    }
                }
                other => OrderTarget::Expr(self.bind_expr(other, &frame, outer, Some(items.as_slice()))?),
            };
            order.push((target, key.ascending));
        }

        // Aggregation
        let needs_aggregate = !group_by.is_empty()
            || items.iter().any(|(e, _)| e.contains_aggregate())
            || having.as_ref().is_some_and(ScalarExpr::contains_aggregate)
            || order
                .iter()
                .any(|(t, _)| matches!(t, OrderTarget::Expr(e) if e.contains_aggregate()));
        if needs_aggregate {
            let relation = self.unique_key(&format!("$agg{}", scope));
            let local: HashSet<String> = frame.relations.iter().map(|r| r.key.clone()).collect();
            let mut aggregates = Vec::new();
            let rewrite = |e: &ScalarExpr, aggregates: &mut Vec<AggregateCall>| {
                rewrite_post_aggregate(e, &relation, &group_by, aggregates, &local)
            };
            for (expr, _) in items.iter_mut() {
                *expr = rewrite(expr, &mut aggregates);
            }
            if let Some(h) = having.as_mut() {
                *h = rewrite(h, &mut aggregates);
            }
            for (target, _) in order.iter_mut() {
                if let OrderTarget::Expr(e) = target {
                    *e = rewrite(e, &mut aggregates);
                }
            }
            debug!(
                scope,
                groups = group_by.len(),
                aggregates = aggregates.len(),
                "bound aggregation"
            );
            plan = Arc::new(LogicalPlan::Aggregate {
                input: plan,
                relation: relation.clone(),
                group_by: group_by.clone(),
                aggregates,
            });
        }
        if let Some(predicate) = having {
            plan = Arc::new(LogicalPlan::Filter {
                input: plan,
                predicate,
            });
        }

        // Window functions
        let needs_window = items.iter().any(|(e, _)| e.contains_window())
            || order
                .iter()
                .any(|(t, _)| matches!(t, OrderTarget::Expr(e) if e.contains_window()));
        if needs_window {
            let relation = self.unique_key(&format!("$win{}", scope));
            let mut functions = Vec::new();
            for (expr, _) in items.iter_mut() {
                *expr = extract_windows(expr, &relation, &mut functions);
            }
            for (target, _) in order.iter_mut() {
                if let OrderTarget::Expr(e) = target {
                    *e = extract_windows(e, &relation, &mut functions);
                }
            }
            plan = Arc::new(LogicalPlan::Window {
                input: plan,
                relation,
                functions,
            });
        }

        // Projection, DISTINCT and ordering
        let out_relation = self.unique_key(&format!("$out{}", scope));
        let mut seen = HashSet::new();
        let project_items: Vec<ProjectItem> = items
            .iter()
            .map(|(expr, name)| {
                let mut column = name.clone();
                let mut n = 2;
                while !seen.insert(column.clone()) {
                    column = format!("{}_{}", name, n);
                    n += 1;
                }
                ProjectItem {
                    expr: expr.clone(),
                    output: ColumnRef::new(out_relation.clone(), column),
                    name: name.clone(),
                }
            })
            .collect();
        let outputs: Vec<ColumnRef> = project_items.iter().map(|i| i.output.clone()).collect();
        let names: Vec<String> = project_items.iter().map(|i| i.name.clone()).collect();

        if select.distinct {
            plan = Arc::new(LogicalPlan::Project {
                input: plan,
                items: project_items.clone(),
            });
            plan = Arc::new(LogicalPlan::Distinct { input: plan });
            if !order.is_empty() {
                let keys = order
                    .into_iter()
                    .map(|(target, ascending)| {
                        let idx = match target {
                            OrderTarget::Item(i) => Some(i),
                            OrderTarget::Expr(e) => project_items.iter().position(|i| i.expr == e),
                        };
                        idx.map(|i| SortKey {
                            expr: ScalarExpr::Column(outputs[i].clone()),
                            ascending,
                        })
                        .ok_or_else(|| {
                            PlanError::Unsupported(
                                "ORDER BY expression must appear in a DISTINCT select list".into(),
                            )
                        })
                    })
                    .collect::<PlanResult<Vec<_>>>()?;
                plan = Arc::new(LogicalPlan::Sort { input: plan, order: keys });
            }
        } else {
            if !order.is_empty() {
                let keys = order
                    .into_iter()
                    .map(|(target, ascending)| SortKey {
                        expr: match target {
                            OrderTarget::Item(i) => project_items[i].expr.clone(),
                            OrderTarget::Expr(e) => e,
                        },
                        ascending,
                    })
                    .collect();
                plan = Arc::new(LogicalPlan::Sort { input: plan, order: keys });
            }
            plan = Arc::new(LogicalPlan::Project {
                input: plan,
                items: project_items,
            });
        }

        if query.limit.is_some() || query.offset.is_some() {
            plan = Arc::new(LogicalPlan::Limit {
                input: plan,
                limit: query.limit,
                offset: query.offset.unwrap_or(0),
            });
        }

        Ok(BoundSelect {
            plan,
            outputs,
            names,
            scope,
        })
    }

    fn bind_table_ref(
        &mut self,
        table_ref: &TableRef,
        frame: &mut Frame,
        outer: &[Frame],
    ) -> PlanResult<Arc<LogicalPlan>> {
        match table_ref {
            TableRef::Table { name, alias } => {
                let schema = self
                    .catalog
                    .table(name)
                    .ok_or_else(|| PlanError::TableNotFound(name.clone()))?;
                let display = alias.clone().unwrap_or_else(|| name.clone());
                if frame.find(&display).is_some() {
                    return Err(PlanError::DuplicateRelation(display));
                }
                let key = self.unique_key(&display);
                let estimate = match self.catalog.estimate_row_count(name) {
                    Some(n) => n as usize,
                    None => {
                        debug!(
                            table = %name,
                            baseline = self.baseline_estimate,
                            "no statistics, using baseline row estimate"
                        );
                        self.baseline_estimate
                    }
                };
                let columns: Vec<String> = schema.column_names().into_iter().map(String::from).collect();
                frame.relations.push(BoundRelation {
                    name: display.clone(),
                    key: key.clone(),
                    columns: columns.clone(),
                });
                Ok(Arc::new(LogicalPlan::Scan {
                    table: name.clone(),
                    relation: key,
                    name: display,
                    columns,
                    estimate,
                    scope: frame.scope,
                }))
            }
            TableRef::Derived { query, alias } => {
                if frame.find(alias).is_some() {
                    return Err(PlanError::DuplicateRelation(alias.clone()));
                }
                let inner = self.bind_query(query, Some(frame.scope), outer)?;
                let mut seen = HashSet::new();
                if let Some(dup) = inner.names.iter().find(|n| !seen.insert(n.as_str())) {
                    return Err(PlanError::Unsupported(format!(
                        "derived table {} has duplicate column name {}",
                        alias, dup
                    )));
                }
                let key = self.unique_key(alias);
                let columns = inner
                    .outputs
                    .iter()
                    .zip(&inner.names)
                    .map(|(inner_col, name)| (inner_col.clone(), ColumnRef::new(key.clone(), name.clone())))
                    .collect();
                frame.relations.push(BoundRelation {
                    name: alias.clone(),
                    key: key.clone(),
                    columns: inner.names.clone(),
                });
                Ok(Arc::new(LogicalPlan::SubqueryAlias {
                    relation: key,
                    name: alias.clone(),
                    scope: frame.scope,
                    input: inner.plan,
                    columns,
                }))
            }
            TableRef::Join {
                left,
                right,
                kind,
                on,
            } => {
                let left = self.bind_table_ref(left, frame, outer)?;
                let right = self.bind_table_ref(right, frame, outer)?;
                let predicate = match on {
                    Some(on) => Some(self.bind_expr(on, frame, outer, None)?),
                    None => None,
                };
                let kind = match (kind, &predicate) {
                    (SqlJoinKind::LeftOuter, _) => JoinKind::LeftOuter,
                    (SqlJoinKind::Inner, Some(_)) => JoinKind::Inner,
                    (SqlJoinKind::Inner, None) => JoinKind::Cross,
                };
                Ok(Arc::new(LogicalPlan::Join {
                    kind,
                    left,
                    right,
                    predicate,
                    scalar_guard: false,
                    scope: frame.scope,
                }))
            }
        }
    }

    fn resolve_column(
        &self,
        table: Option<&str>,
        name: &str,
        frame: &Frame,
        outer: &[Frame],
        aliases: Option<&[(ScalarExpr, String)]>,
    ) -> PlanResult<ScalarExpr> {
        if let Some(col) = frame.resolve(table, name)? {
            return Ok(ScalarExpr::Column(col));
        }
        if let (None, Some(aliases)) = (table, aliases) {
            if let Some((expr, _)) = aliases.iter().find(|(_, n)| n == name) {
                return Ok(expr.clone());
            }
        }
        for parent in outer.iter().rev() {
            if let Some(col) = parent.resolve(table, name)? {
                return Ok(ScalarExpr::Column(col));
            }
        }
        Err(match table {
            Some(t) => PlanError::ColumnNotFound(format!("{}.{}", t, name)),
            None => PlanError::ColumnNotFound(name.to_string()),
        })
    }

    fn bind_expr(
        &mut self,
        expr: &Expr,
        frame: &Frame,
        outer: &[Frame],
        aliases: Option<&[(ScalarExpr, String)]>,
    ) -> PlanResult<ScalarExpr> {
        let bind = |binder: &mut Self, e: &Expr| binder.bind_expr(e, frame, outer, aliases);
        Ok(match expr {
            Expr::Column { table, name } => {
                self.resolve_column(table.as_deref(), name, frame, outer, aliases)?
            }
            Expr::Literal(lit) => ScalarExpr::Literal(lit.to_json()),
            Expr::BinaryOp { left, op, right } => {
                ScalarExpr::binary(bind(self, left)?, *op, bind(self, right)?)
            }
            Expr::UnaryOp { op, expr } => match op {
                UnaryOperator::Not => ScalarExpr::Not(Box::new(bind(self, expr)?)),
                UnaryOperator::Minus => ScalarExpr::Negate(Box::new(bind(self, expr)?)),
                UnaryOperator::Plus => bind(self, expr)?,
            },
            Expr::IsNull { expr, negated } => ScalarExpr::IsNull {
                expr: Box::new(bind(self, expr)?),
                negated: *negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => ScalarExpr::InList {
                expr: Box::new(bind(self, expr)?),
                list: list
                    .iter()
                    .map(|e| bind(self, e))
                    .collect::<PlanResult<_>>()?,
                negated: *negated,
            },
            Expr::Cast { expr, data_type } => ScalarExpr::Cast {
                expr: Box::new(bind(self, expr)?),
                data_type: *data_type,
            },
            Expr::Tuple(items) => ScalarExpr::Tuple(
                items
                    .iter()
                    .map(|e| bind(self, e))
                    .collect::<PlanResult<_>>()?,
            ),
            Expr::Nested(inner) => bind(self, inner)?,
            Expr::Function {
                name,
                args,
                star,
                over,
            } => {
                if let Some(spec) = over {
                    if name != "row_number" || !args.is_empty() {
                        return Err(PlanError::Unsupported(format!("window function {}", name)));
                    }
                    let partition_by = spec
                        .partition_by
                        .iter()
                        .map(|e| bind(self, e))
                        .collect::<PlanResult<_>>()?;
                    let order_by = spec
                        .order_by
                        .iter()
                        .map(|k| {
                            Ok(SortKey {
                                expr: bind(self, &k.expr)?,
                                ascending: k.ascending,
                            })
                        })
                        .collect::<PlanResult<_>>()?;
                    ScalarExpr::Window(Box::new(WindowCall {
                        func: WindowFunction::RowNumber,
                        partition_by,
                        order_by,
                    }))
                } else if let Some(func) = AggregateFunction::from_name(name) {
                    let call = match (func, *star, args.as_slice()) {
                        (AggregateFunction::Count, true, _) => AggregateCall {
                            func: AggregateFunction::CountStar,
                            arg: None,
                        },
                        (func, false, [arg]) => {
                            let arg = bind(self, arg)?;
                            if arg.contains_aggregate() {
                                return Err(PlanError::Unsupported("nested aggregate".into()));
                            }
                            AggregateCall {
                                func,
                                arg: Some(arg),
                            }
                        }
                        _ => {
                            return Err(PlanError::Unsupported(format!(
                                "{} takes exactly one argument",
                                name
                            )))
                        }
                    };
                    ScalarExpr::Aggregate(Box::new(call))
                } else if let Some(func) = ScalarFunction::from_name(name) {
                    ScalarExpr::Function {
                        func,
                        args: args
                            .iter()
                            .map(|e| bind(self, e))
                            .collect::<PlanResult<_>>()?,
                    }
                } else {
                    return Err(PlanError::Unsupported(format!("function {}", name)));
                }
            }
            Expr::Subquery(query) => self.bind_subquery(query, SubqueryKind::Scalar, frame, outer)?,
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let operand = Box::new(bind(self, expr)?);
                let sub = self.bind_subquery(subquery, SubqueryKind::In { operand }, frame, outer)?;
                if *negated {
                    ScalarExpr::Not(Box::new(sub))
                } else {
                    sub
                }
            }
            Expr::Exists { subquery, negated } => {
                let sub = self.bind_subquery(subquery, SubqueryKind::Exists, frame, outer)?;
                if *negated {
                    ScalarExpr::Not(Box::new(sub))
                } else {
                    sub
                }
            }
        })
    }

    fn bind_subquery(
        &mut self,
        query: &Query,
        kind: SubqueryKind,
        frame: &Frame,
        outer: &[Frame],
    ) -> PlanResult<ScalarExpr> {
        let mut frames = outer.to_vec();
        frames.push(frame.clone());
        let bound = self.bind_query(query, Some(frame.scope), &frames)?;

        if let SubqueryKind::In { operand } = &kind {
            let width = match operand.as_ref() {
                ScalarExpr::Tuple(items) => items.len(),
                _ => 1,
            };
            if width != bound.outputs.len() {
                return Err(PlanError::Unsupported(format!(
                    "IN operand has {} column(s) but the subquery returns {}",
                    width,
                    bound.outputs.len()
                )));
            }
        }

        let id = self.next_subquery;
        self.next_subquery += 1;
        Ok(ScalarExpr::Subquery(Box::new(SubqueryExpr {
            id,
            scope: bound.scope,
            kind,
            plan: bound.plan,
            physical: None,
        })))
    }
}

/// Rewrite an expression evaluated above an Aggregate node in terms of its
/// outputs. Columns of the aggregated scope that are not grouped become
/// implicit `any_value` aggregates.
fn rewrite_post_aggregate(
    expr: &ScalarExpr,
    relation: &str,
    group_by: &[ScalarExpr],
    aggregates: &mut Vec<AggregateCall>,
    local: &HashSet<String>,
) -> ScalarExpr {
    let slot = |call: AggregateCall, aggregates: &mut Vec<AggregateCall>| {
        let idx = match aggregates.iter().position(|a| *a == call) {
            Some(idx) => idx,
            None => {
                aggregates.push(call);
                aggregates.len() - 1
            }
        };
        ScalarExpr::column(relation, format!("a{}", idx))
    };
    expr.transform(&mut |e| {
        if let Some(i) = group_by.iter().position(|g| g == e) {
            return Some(ScalarExpr::column(relation, format!("g{}", i)));
        }
        match e {
            ScalarExpr::Aggregate(call) => Some(slot(AggregateCall::clone(call), aggregates)),
            ScalarExpr::Column(c) if local.contains(&c.relation) => Some(slot(
                AggregateCall {
                    func: AggregateFunction::AnyValue,
                    arg: Some(e.clone()),
                },
                aggregates,
            )),
            _ => None,
        }
    })
}

/// Replace window function placeholders with references to Window outputs.
fn extract_windows(expr: &ScalarExpr, relation: &str, functions: &mut Vec<WindowCall>) -> ScalarExpr {
    expr.transform(&mut |e| match e {
        ScalarExpr::Window(call) => {
            let idx = match functions.iter().position(|f| f == call.as_ref()) {
                Some(idx) => idx,
                None => {
                    functions.push(WindowCall::clone(call));
                    functions.len() - 1
                }
            };
            Some(ScalarExpr::column(relation, format!("w{}", idx)))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogSnapshot, DataType, SchemaBuilder};
    use crate::sql::Parser;

    fn catalog() -> CatalogSnapshot {
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
        }
        catalog.record_row_count("xy", 4);
        catalog.snapshot()
    }

    fn bind(sql: &str) -> PlanResult<BoundStatement> {
        let snapshot = catalog();
        let query = Parser::parse_query(sql)?;
        Binder::new(&snapshot, 1000).bind(&query)
    }

    #[test]
    fn test_bind_simple_select() {
        let bound = bind("select x, y + 1 as z from xy where y > 0").unwrap();
        assert_eq!(bound.column_names, vec!["x", "z"]);
        let text = bound.plan.to_string();
        assert!(text.contains("Project: xy.x AS x, xy.y + 1 AS z"), "{}", text);
        assert!(text.contains("Filter: xy.y > 0"), "{}", text);
        assert_eq!(bound.scopes.len(), 1);
    }

    #[test]
    fn test_baseline_estimate_without_statistics() {
        let bound = bind("select * from uv").unwrap();
        let LogicalPlan::Project { input, .. } = bound.plan.as_ref() else {
            panic!("expected project");
        };
        assert_eq!(input.estimated_rows(), 1000);
    }

    #[test]
    fn test_correlated_subquery_gets_unique_keys() {
        let bound = bind("select * from xy where exists (select 1 from xy where xy.x = 1)").unwrap();
        let text = bound.plan.to_string();
        assert!(text.contains("Scan: xy [xy_2]"), "{}", text);
        assert_eq!(bound.scopes.len(), 2);

        let bound = bind("select * from xy where exists (select 1 from uv where u = x)").unwrap();
        let LogicalPlan::Project { input, .. } = bound.plan.as_ref() else {
            panic!("expected project");
        };
        let LogicalPlan::Filter { predicate, .. } = input.as_ref() else {
            panic!("expected filter");
        };
        let sub = predicate.subqueries()[0];
        let free: Vec<String> = sub.plan.free_columns().iter().map(|c| c.key()).collect();
        assert_eq!(free, vec!["xy.x"]);
    }

    #[test]
    fn test_name_errors() {
        assert!(matches!(
            bind("select * from xy, xy"),
            Err(PlanError::DuplicateRelation(name)) if name == "xy"
        ));
        assert!(matches!(
            bind("select x from xy a, xy b"),
            Err(PlanError::AmbiguousColumn(_))
        ));
        assert!(matches!(bind("select nope from xy"), Err(PlanError::ColumnNotFound(_))));
        assert!(matches!(bind("select * from missing"), Err(PlanError::TableNotFound(_))));
        assert!(matches!(
            bind("select * from xy where x in (select u, v from uv)"),
            Err(PlanError::Unsupported(_))
        ));
    }

    #[test]
    fn test_group_by_with_having_alias() {
        let bound = bind("select y, count(*) as c from xy group by y having c > 1 order by 2 desc").unwrap();
        let text = bound.plan.to_string();
        assert!(text.contains("Aggregate: group=[xy.y], aggs=[count(*)]"), "{}", text);
        assert!(text.contains("Filter: $agg0.a0 > 1"), "{}", text);
        assert!(text.contains("Sort: $agg0.a0 DESC"), "{}", text);
    }

    #[test]
    fn test_distinct_sorts_on_outputs() {
        let bound = bind("select distinct y from xy order by y").unwrap();
        let text = bound.plan.to_string();
        let sort = text.find("Sort: $out0.y ASC").unwrap();
        let distinct = text.find("Distinct").unwrap();
        assert!(sort < distinct, "{}", text);

        assert!(bind("select distinct y from xy order by x").is_err());
    }

    #[test]
    fn test_derived_table() {
        let bound = bind("select t.a from (select x as a from xy) t").unwrap();
        let text = bound.plan.to_string();
        assert!(text.contains("SubqueryAlias: t"), "{}", text);
        assert!(text.contains("Project: t.a AS a"), "{}", text);
    }
}
