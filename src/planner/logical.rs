//! Logical query plan representation.
//!
//! Logical plans represent *what* the query does, not *how* it will be executed.
//! Nodes are immutable once built; rewrites produce new trees and share
//! unchanged subtrees through `Arc`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::expr::{AggregateCall, ColumnRef, ScalarExpr, SortKey, WindowCall};
use super::scope::ScopeId;

/// Logical join kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Cross,
    Inner,
    LeftOuter,
    /// Left rows with at least one match; right columns are not projected.
    Semi,
    /// Left rows without any match.
    Anti,
}

impl JoinKind {
    /// Semi and anti joins only test for existence.
    pub fn is_existence(&self) -> bool {
        matches!(self, JoinKind::Semi | JoinKind::Anti)
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKind::Cross => write!(f, "CROSS"),
            JoinKind::Inner => write!(f, "INNER"),
            JoinKind::LeftOuter => write!(f, "LEFT OUTER"),
            JoinKind::Semi => write!(f, "SEMI"),
            JoinKind::Anti => write!(f, "ANTI"),
        }
    }
}

/// One projected column.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectItem {
    pub expr: ScalarExpr,
    /// Statement-unique output column.
    pub output: ColumnRef,
    /// Name shown to the user.
    pub name: String,
}

/// Logical query plan.
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// Scan a table under a statement-unique relation key.
    Scan {
        table: String,
        /// Row key prefix of the scanned columns.
        relation: String,
        /// Name the relation has in its scope (alias or table name).
        name: String,
        columns: Vec<String>,
        /// Row-count estimate resolved at bind time.
        estimate: usize,
        scope: ScopeId,
    },

    /// A single empty row, for SELECT without FROM.
    OneRow { scope: ScopeId },

    Filter {
        input: Arc<LogicalPlan>,
        predicate: ScalarExpr,
    },

    Project {
        input: Arc<LogicalPlan>,
        items: Vec<ProjectItem>,
    },

    Join {
        kind: JoinKind,
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        predicate: Option<ScalarExpr>,
        /// Anti join that keeps no rows when the right side is empty, as a
        /// comparison against an empty scalar subquery yields NULL.
        scalar_guard: bool,
        scope: ScopeId,
    },

    /// A derived table or decorrelated subquery, renamed into its parent scope.
    SubqueryAlias {
        relation: String,
        name: String,
        /// Scope the alias is a relation of.
        scope: ScopeId,
        input: Arc<LogicalPlan>,
        /// Inner output column and the column it is exposed as.
        columns: Vec<(ColumnRef, ColumnRef)>,
    },

    Distinct { input: Arc<LogicalPlan> },

    Sort {
        input: Arc<LogicalPlan>,
        order: Vec<SortKey>,
    },

    Limit {
        input: Arc<LogicalPlan>,
        limit: Option<usize>,
        offset: usize,
    },

    /// Grouping; outputs `g<i>` per group expression then `a<i>` per
    /// aggregate, under `relation`.
    Aggregate {
        input: Arc<LogicalPlan>,
        relation: String,
        group_by: Vec<ScalarExpr>,
        aggregates: Vec<AggregateCall>,
    },

    /// Window functions; outputs the input columns plus `w<i>` under `relation`.
    Window {
        input: Arc<LogicalPlan>,
        relation: String,
        functions: Vec<WindowCall>,
    },
}

impl LogicalPlan {
    /// Columns produced by this node, in order.
    pub fn output_columns(&self) -> Vec<ColumnRef> {
        match self {
            LogicalPlan::Scan {
                relation, columns, ..
            } => columns
                .iter()
                .map(|c| ColumnRef::new(relation.clone(), c.clone()))
                .collect(),
            LogicalPlan::OneRow { .. } => Vec::new(),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => input.output_columns(),
            LogicalPlan::Project { items, .. } => items.iter().map(|i| i.output.clone()).collect(),
            LogicalPlan::Join {
                kind, left, right, ..
            } => {
                let mut cols = left.output_columns();
                if !kind.is_existence() {
                    cols.extend(right.output_columns());
                }
                cols
            }
            LogicalPlan::SubqueryAlias { columns, .. } => {
                columns.iter().map(|(_, outer)| outer.clone()).collect()
            }
            LogicalPlan::Aggregate {
                relation,
                group_by,
                aggregates,
                ..
            } => aggregate_outputs(relation, group_by.len(), aggregates.len()),
            LogicalPlan::Window {
                input,
                relation,
                functions,
            } => {
                let mut cols = input.output_columns();
                cols.extend(
                    (0..functions.len()).map(|i| ColumnRef::new(relation.clone(), format!("w{}", i))),
                );
                cols
            }
        }
    }

    pub fn children(&self) -> Vec<&Arc<LogicalPlan>> {
        match self {
            LogicalPlan::Scan { .. } | LogicalPlan::OneRow { .. } => Vec::new(),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Window { input, .. } => vec![input],
            LogicalPlan::Join { left, right, .. } => vec![left, right],
        }
    }

    /// Same node over new children, in [`children`](Self::children) order.
    pub fn with_children(&self, mut children: Vec<Arc<LogicalPlan>>) -> LogicalPlan {
        let mut next = || children.remove(0);
        match self {
            LogicalPlan::Scan { .. } | LogicalPlan::OneRow { .. } => self.clone(),
            LogicalPlan::Filter { predicate, .. } => LogicalPlan::Filter {
                input: next(),
                predicate: predicate.clone(),
            },
            LogicalPlan::Project { items, .. } => LogicalPlan::Project {
                input: next(),
                items: items.clone(),
            },
            LogicalPlan::SubqueryAlias {
                relation,
                name,
                scope,
                columns,
                ..
            } => LogicalPlan::SubqueryAlias {
                relation: relation.clone(),
                name: name.clone(),
                scope: *scope,
                input: next(),
                columns: columns.clone(),
            },
            LogicalPlan::Distinct { .. } => LogicalPlan::Distinct { input: next() },
            LogicalPlan::Sort { order, .. } => LogicalPlan::Sort {
                input: next(),
                order: order.clone(),
            },
            LogicalPlan::Limit { limit, offset, .. } => LogicalPlan::Limit {
                input: next(),
                limit: *limit,
                offset: *offset,
            },
            LogicalPlan::Aggregate {
                relation,
                group_by,
                aggregates,
                ..
            } => LogicalPlan::Aggregate {
                input: next(),
                relation: relation.clone(),
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
            },
            LogicalPlan::Window {
                relation,
                functions,
                ..
            } => LogicalPlan::Window {
                input: next(),
                relation: relation.clone(),
                functions: functions.clone(),
            },
            LogicalPlan::Join {
                kind,
                predicate,
                scalar_guard,
                scope,
                ..
            } => {
                let left = next();
                let right = next();
                LogicalPlan::Join {
                    kind: *kind,
                    left,
                    right,
                    predicate: predicate.clone(),
                    scalar_guard: *scalar_guard,
                    scope: *scope,
                }
            }
        }
    }

    /// Expressions held directly by this node.
    pub fn expressions(&self) -> Vec<&ScalarExpr> {
        match self {
            LogicalPlan::Filter { predicate, .. } => vec![predicate],
            LogicalPlan::Project { items, .. } => items.iter().map(|i| &i.expr).collect(),
            LogicalPlan::Join { predicate, .. } => predicate.iter().collect(),
            LogicalPlan::Sort { order, .. } => order.iter().map(|k| &k.expr).collect(),
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .chain(aggregates.iter().filter_map(|a| a.arg.as_ref()))
                .collect(),
            LogicalPlan::Window { functions, .. } => functions
                .iter()
                .flat_map(|w| w.partition_by.iter().chain(w.order_by.iter().map(|k| &k.expr)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Rebuild the node with every directly held expression transformed.
    pub fn map_expressions<E>(
        &self,
        f: &mut dyn FnMut(&ScalarExpr) -> Result<ScalarExpr, E>,
    ) -> Result<LogicalPlan, E> {
        Ok(match self {
            LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
                input: Arc::clone(input),
                predicate: f(predicate)?,
            },
            LogicalPlan::Project { input, items } => LogicalPlan::Project {
                input: Arc::clone(input),
                items: items
                    .iter()
                    .map(|i| {
                        Ok(ProjectItem {
                            expr: f(&i.expr)?,
                            output: i.output.clone(),
                            name: i.name.clone(),
                        })
                    })
                    .collect::<Result<_, E>>()?,
            },
            LogicalPlan::Join {
                kind,
                left,
                right,
                predicate,
                scalar_guard,
                scope,
            } => LogicalPlan::Join {
                kind: *kind,
                left: Arc::clone(left),
                right: Arc::clone(right),
                predicate: predicate.as_ref().map(|p| f(p)).transpose()?,
                scalar_guard: *scalar_guard,
                scope: *scope,
            },
            LogicalPlan::Sort { input, order } => LogicalPlan::Sort {
                input: Arc::clone(input),
                order: order
                    .iter()
                    .map(|k| {
                        Ok(SortKey {
                            expr: f(&k.expr)?,
                            ascending: k.ascending,
                        })
                    })
                    .collect::<Result<_, E>>()?,
            },
            LogicalPlan::Aggregate {
                input,
                relation,
                group_by,
                aggregates,
            } => LogicalPlan::Aggregate {
                input: Arc::clone(input),
                relation: relation.clone(),
                group_by: group_by.iter().map(|g| f(g)).collect::<Result<_, E>>()?,
                aggregates: aggregates
                    .iter()
                    .map(|a| {
                        Ok(AggregateCall {
                            func: a.func,
                            arg: a.arg.as_ref().map(|e| f(e)).transpose()?,
                        })
                    })
                    .collect::<Result<_, E>>()?,
            },
            LogicalPlan::Window {
                input,
                relation,
                functions,
            } => LogicalPlan::Window {
                input: Arc::clone(input),
                relation: relation.clone(),
                functions: functions
                    .iter()
                    .map(|w| {
                        Ok(WindowCall {
                            func: w.func,
                            partition_by: w
                                .partition_by
                                .iter()
                                .map(|e| f(e))
                                .collect::<Result<_, E>>()?,
                            order_by: w
                                .order_by
                                .iter()
                                .map(|k| {
                                    Ok(SortKey {
                                        expr: f(&k.expr)?,
                                        ascending: k.ascending,
                                    })
                                })
                                .collect::<Result<_, E>>()?,
                        })
                    })
                    .collect::<Result<_, E>>()?,
            },
            other => other.clone(),
        })
    }

    /// Every relation key this tree produces, inner scopes included.
    pub fn produced_relations(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_produced(&mut out);
        out
    }

    fn collect_produced(&self, out: &mut BTreeSet<String>) {
        match self {
            LogicalPlan::Scan { relation, .. } => {
                out.insert(relation.clone());
            }
            LogicalPlan::SubqueryAlias { relation, .. }
            | LogicalPlan::Aggregate { relation, .. }
            | LogicalPlan::Window { relation, .. } => {
                out.insert(relation.clone());
            }
            LogicalPlan::Project { items, .. } => {
                out.extend(items.iter().map(|i| i.output.relation.clone()));
            }
            _ => {}
        }
        for child in self.children() {
            child.collect_produced(out);
        }
    }

    /// Columns read by this tree that it does not produce: its correlation
    /// with enclosing scopes.
    pub fn free_columns(&self) -> BTreeSet<ColumnRef> {
        let mut used = BTreeSet::new();
        self.collect_used(&mut used);
        let produced = self.produced_relations();
        used.into_iter()
            .filter(|c| !produced.contains(&c.relation))
            .collect()
    }

    fn collect_used(&self, out: &mut BTreeSet<ColumnRef>) {
        for expr in self.expressions() {
            out.extend(expr.column_refs());
        }
        for child in self.children() {
            child.collect_used(out);
        }
    }

    pub fn is_correlated(&self) -> bool {
        !self.free_columns().is_empty()
    }

    /// Cardinality estimate used for join ordering and costing.
    pub fn estimated_rows(&self) -> usize {
        match self {
            LogicalPlan::Scan { estimate, .. } => *estimate,
            LogicalPlan::OneRow { .. } => 1,
            LogicalPlan::Filter { input, .. } => (input.estimated_rows() / 3).max(1),
            LogicalPlan::Project { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Window { input, .. } => input.estimated_rows(),
            LogicalPlan::Distinct { input } => (input.estimated_rows() / 2).max(1),
            LogicalPlan::Limit { input, limit, .. } => match limit {
                Some(n) => (*n).min(input.estimated_rows()),
                None => input.estimated_rows(),
            },
            LogicalPlan::Aggregate {
                input, group_by, ..
            } => {
                if group_by.is_empty() {
                    1
                } else {
                    (input.estimated_rows() / 10).max(1)
                }
            }
            LogicalPlan::Join {
                kind, left, right, ..
            } => {
                let l = left.estimated_rows();
                let r = right.estimated_rows();
                match kind {
                    JoinKind::Cross => l.saturating_mul(r),
                    JoinKind::Inner => (l.saturating_mul(r) / 100).max(1),
                    JoinKind::LeftOuter => l.max(l.saturating_mul(r) / 100),
                    JoinKind::Semi | JoinKind::Anti => (l / 2).max(1),
                }
            }
        }
    }

    /// The relation name a leaf of a join tree is known by in its scope.
    pub fn relation_name(&self) -> Option<&str> {
        match self {
            LogicalPlan::Scan { name, .. } | LogicalPlan::SubqueryAlias { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Output columns of an Aggregate node.
pub fn aggregate_outputs(relation: &str, groups: usize, aggregates: usize) -> Vec<ColumnRef> {
    (0..groups)
        .map(|i| ColumnRef::new(relation, format!("g{}", i)))
        .chain((0..aggregates).map(|i| ColumnRef::new(relation, format!("a{}", i))))
        .collect()
}

fn join_displayed<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl LogicalPlan {
    fn format_node(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            LogicalPlan::Scan {
                table,
                relation,
                name,
                ..
            } => {
                write!(f, "{}Scan: {}", pad, table)?;
                if name != table {
                    write!(f, " AS {}", name)?;
                }
                if relation != name {
                    write!(f, " [{}]", relation)?;
                }
            }
            LogicalPlan::OneRow { .. } => write!(f, "{}OneRow", pad)?,
            LogicalPlan::Filter { predicate, .. } => write!(f, "{}Filter: {}", pad, predicate)?,
            LogicalPlan::Project { items, .. } => {
                let cols: Vec<String> = items
                    .iter()
                    .map(|i| format!("{} AS {}", i.expr, i.name))
                    .collect();
                write!(f, "{}Project: {}", pad, cols.join(", "))?;
            }
            LogicalPlan::Join {
                kind,
                predicate,
                scalar_guard,
                ..
            } => {
                write!(f, "{}Join: {}", pad, kind)?;
                if let Some(p) = predicate {
                    write!(f, " ON {}", p)?;
                }
                if *scalar_guard {
                    write!(f, " (scalar)")?;
                }
            }
            LogicalPlan::SubqueryAlias { name, relation, .. } => {
                write!(f, "{}SubqueryAlias: {}", pad, name)?;
                if relation != name {
                    write!(f, " [{}]", relation)?;
                }
            }
            LogicalPlan::Distinct { .. } => write!(f, "{}Distinct", pad)?,
            LogicalPlan::Sort { order, .. } => write!(f, "{}Sort: {}", pad, join_displayed(order))?,
            LogicalPlan::Limit { limit, offset, .. } => {
                match limit {
                    Some(n) => write!(f, "{}Limit: {}", pad, n)?,
                    None => write!(f, "{}Limit: ALL", pad)?,
                }
                if *offset > 0 {
                    write!(f, " OFFSET {}", offset)?;
                }
            }
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                ..
            } => write!(
                f,
                "{}Aggregate: group=[{}], aggs=[{}]",
                pad,
                join_displayed(group_by),
                join_displayed(aggregates)
            )?,
            LogicalPlan::Window { functions, .. } => {
                write!(f, "{}Window: {}", pad, join_displayed(functions))?
            }
        }
        writeln!(f)?;

        for expr in self.expressions() {
            for sub in expr.subqueries() {
                writeln!(f, "{}  Subquery#{}:", pad, sub.id)?;
                sub.plan.format_node(f, indent + 2)?;
            }
        }
        for child in self.children() {
            child.format_node(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format_node(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::BinaryOperator;
    use serde_json::json;

    fn scan(table: &str, relation: &str, cols: &[&str], estimate: usize) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Scan {
            table: table.into(),
            relation: relation.into(),
            name: table.into(),
            columns: cols.iter().map(|c| c.to_string()).collect(),
            estimate,
            scope: 0,
        })
    }

    #[test]
    fn test_semi_join_hides_right_columns() {
        let join = LogicalPlan::Join {
            kind: JoinKind::Semi,
            left: scan("xy", "xy", &["x", "y"], 4),
            right: scan("uv", "uv", &["u", "v"], 4),
            predicate: Some(ScalarExpr::eq(
                ScalarExpr::column("xy", "x"),
                ScalarExpr::column("uv", "u"),
            )),
            scalar_guard: false,
            scope: 0,
        };
        let cols: Vec<String> = join.output_columns().iter().map(|c| c.key()).collect();
        assert_eq!(cols, vec!["xy.x", "xy.y"]);
        assert_eq!(join.estimated_rows(), 2);
    }

    #[test]
    fn test_free_columns_report_correlation() {
        let inner = LogicalPlan::Filter {
            input: scan("uv", "uv", &["u", "v"], 4),
            predicate: ScalarExpr::eq(ScalarExpr::column("uv", "u"), ScalarExpr::column("xy", "x")),
        };
        let free: Vec<String> = inner.free_columns().iter().map(|c| c.key()).collect();
        assert_eq!(free, vec!["xy.x"]);
        assert!(inner.is_correlated());
        assert!(!scan("uv", "uv", &["u"], 4).is_correlated());
    }

    #[test]
    fn test_estimates() {
        let filter = LogicalPlan::Filter {
            input: scan("xy", "xy", &["x"], 1000),
            predicate: ScalarExpr::binary(
                ScalarExpr::column("xy", "x"),
                BinaryOperator::Gt,
                ScalarExpr::literal(json!(1)),
            ),
        };
        assert_eq!(filter.estimated_rows(), 333);

        let limit = LogicalPlan::Limit {
            input: Arc::new(filter),
            limit: Some(5),
            offset: 0,
        };
        assert_eq!(limit.estimated_rows(), 5);
    }

    #[test]
    fn test_with_children_preserves_node() {
        let join = LogicalPlan::Join {
            kind: JoinKind::Inner,
            left: scan("xy", "xy", &["x"], 4),
            right: scan("uv", "uv", &["u"], 4),
            predicate: None,
            scalar_guard: false,
            scope: 0,
        };
        let swapped = join.with_children(vec![scan("uv", "uv", &["u"], 4), scan("xy", "xy", &["x"], 4)]);
        let cols: Vec<String> = swapped.output_columns().iter().map(|c| c.key()).collect();
        assert_eq!(cols, vec!["uv.u", "xy.x"]);
        assert!(swapped.to_string().starts_with("Join: INNER"));
    }
}
