//! Bound scalar expressions.
//!
//! The binder resolves every column of the SQL AST to a [`ColumnRef`] whose
//! relation key is unique within the statement, so an expression can be
//! evaluated against any row that carries the referenced keys.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::logical::LogicalPlan;
use super::physical::PhysicalPlanNode;
use super::scope::ScopeId;
use crate::catalog::DataType;
use crate::sql::BinaryOperator;

/// A resolved column: statement-unique relation key plus column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub relation: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(relation: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            column: column.into(),
        }
    }

    /// Key of this column inside an execution row.
    pub fn key(&self) -> String {
        format!("{}.{}", self.relation, self.column)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.relation, self.column)
    }
}

/// Built-in scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    Abs,
    Coalesce,
    Mod,
}

impl ScalarFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(ScalarFunction::Abs),
            "coalesce" | "ifnull" => Some(ScalarFunction::Coalesce),
            "mod" => Some(ScalarFunction::Mod),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalarFunction::Abs => "abs",
            ScalarFunction::Coalesce => "coalesce",
            ScalarFunction::Mod => "mod",
        }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    /// `count(*)`
    CountStar,
    Sum,
    Min,
    Max,
    Avg,
    /// Value of a non-grouped column; any row of the group will do.
    AnyValue,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            "avg" => Some(AggregateFunction::Avg),
            "any_value" => Some(AggregateFunction::AnyValue),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count | AggregateFunction::CountStar => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::AnyValue => "any_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub func: AggregateFunction,
    pub arg: Option<ScalarExpr>,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.func, &self.arg) {
            (AggregateFunction::CountStar, _) => write!(f, "count(*)"),
            (func, Some(arg)) => write!(f, "{}({})", func.name(), arg),
            (func, None) => write!(f, "{}()", func.name()),
        }
    }
}

/// Window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    RowNumber,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowCall {
    pub func: WindowFunction,
    pub partition_by: Vec<ScalarExpr>,
    pub order_by: Vec<SortKey>,
}

impl fmt::Display for WindowCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row_number() over (")?;
        if !self.partition_by.is_empty() {
            write!(f, "partition by {}", join_exprs(&self.partition_by))?;
        }
        if !self.order_by.is_empty() {
            if !self.partition_by.is_empty() {
                write!(f, " ")?;
            }
            let keys: Vec<String> = self.order_by.iter().map(|k| k.to_string()).collect();
            write!(f, "order by {}", keys.join(", "))?;
        }
        write!(f, ")")
    }
}

/// Sort key of a Sort node or window ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: ScalarExpr,
    pub ascending: bool,
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, if self.ascending { "ASC" } else { "DESC" })
    }
}

/// What a subquery expression computes.
#[derive(Debug, Clone, PartialEq)]
pub enum SubqueryKind {
    /// Single value (or tuple, for multi-column subqueries).
    Scalar,
    Exists,
    /// `operand IN (subquery)`; a tuple operand compares column-wise.
    In { operand: Box<ScalarExpr> },
}

/// A subquery used as an expression, evaluated per outer row unless the
/// decorrelator turns it into a join.
#[derive(Debug, Clone)]
pub struct SubqueryExpr {
    /// Statement-unique id; identifies the per-execution result cache.
    pub id: usize,
    pub scope: ScopeId,
    pub kind: SubqueryKind,
    pub plan: Arc<LogicalPlan>,
    /// Filled by physical selection.
    pub physical: Option<Arc<PhysicalPlanNode>>,
}

impl PartialEq for SubqueryExpr {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl SubqueryExpr {
    /// Columns of enclosing scopes the subquery reads.
    pub fn free_columns(&self) -> BTreeSet<ColumnRef> {
        let mut free = self.plan.free_columns();
        if let SubqueryKind::In { operand } = &self.kind {
            free.extend(operand.column_refs());
        }
        free
    }

    pub fn is_correlated(&self) -> bool {
        !self.plan.free_columns().is_empty()
    }
}

/// A bound scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Column(ColumnRef),
    Literal(Value),
    Binary {
        left: Box<ScalarExpr>,
        op: BinaryOperator,
        right: Box<ScalarExpr>,
    },
    Not(Box<ScalarExpr>),
    Negate(Box<ScalarExpr>),
    IsNull {
        expr: Box<ScalarExpr>,
        negated: bool,
    },
    InList {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    Cast {
        expr: Box<ScalarExpr>,
        data_type: DataType,
    },
    Tuple(Vec<ScalarExpr>),
    Function {
        func: ScalarFunction,
        args: Vec<ScalarExpr>,
    },
    /// Placeholder the binder lifts into an Aggregate node.
    Aggregate(Box<AggregateCall>),
    /// Placeholder the binder lifts into a Window node.
    Window(Box<WindowCall>),
    Subquery(Box<SubqueryExpr>),
}

impl ScalarExpr {
    pub fn column(relation: impl Into<String>, column: impl Into<String>) -> Self {
        ScalarExpr::Column(ColumnRef::new(relation, column))
    }

    pub fn literal(value: Value) -> Self {
        ScalarExpr::Literal(value)
    }

    pub fn binary(left: ScalarExpr, op: BinaryOperator, right: ScalarExpr) -> Self {
        ScalarExpr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: ScalarExpr, right: ScalarExpr) -> Self {
        Self::binary(left, BinaryOperator::Eq, right)
    }

    pub fn and(left: ScalarExpr, right: ScalarExpr) -> Self {
        Self::binary(left, BinaryOperator::And, right)
    }

    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            ScalarExpr::Column(c) => Some(c),
            _ => None,
        }
    }

    /// Flatten a tree of ANDs.
    pub fn split_conjuncts(self) -> Vec<ScalarExpr> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                ScalarExpr::Binary {
                    left,
                    op: BinaryOperator::And,
                    right,
                } => {
                    stack.push(*right);
                    stack.push(*left);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Flatten a tree of ORs.
    pub fn split_disjuncts(&self) -> Vec<&ScalarExpr> {
        match self {
            ScalarExpr::Binary {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                let mut out = left.split_disjuncts();
                out.extend(right.split_disjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// AND together conjuncts; `None` when there are none.
    pub fn conjoin(conjuncts: impl IntoIterator<Item = ScalarExpr>) -> Option<ScalarExpr> {
        conjuncts.into_iter().reduce(ScalarExpr::and)
    }

    /// Pre-order visit. Does not descend into subquery plans.
    pub fn visit<F: FnMut(&ScalarExpr)>(&self, f: &mut F) {
        f(self);
        match self {
            ScalarExpr::Column(_) | ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            ScalarExpr::Not(e) | ScalarExpr::Negate(e) => e.visit(f),
            ScalarExpr::IsNull { expr, .. } | ScalarExpr::Cast { expr, .. } => expr.visit(f),
            ScalarExpr::InList { expr, list, .. } => {
                expr.visit(f);
                list.iter().for_each(|e| e.visit(f));
            }
            ScalarExpr::Tuple(items) | ScalarExpr::Function { args: items, .. } => {
                items.iter().for_each(|e| e.visit(f))
            }
            ScalarExpr::Aggregate(call) => {
                if let Some(arg) = &call.arg {
                    arg.visit(f);
                }
            }
            ScalarExpr::Window(call) => {
                call.partition_by.iter().for_each(|e| e.visit(f));
                call.order_by.iter().for_each(|k| k.expr.visit(f));
            }
            ScalarExpr::Subquery(sub) => {
                if let SubqueryKind::In { operand } = &sub.kind {
                    operand.visit(f);
                }
            }
        }
    }

    /// Rebuild the expression top-down. `f` may replace a node; otherwise its
    /// children are transformed.
    pub fn try_transform<E, F>(&self, f: &mut F) -> Result<ScalarExpr, E>
    where
        F: FnMut(&ScalarExpr) -> Result<Option<ScalarExpr>, E>,
    {
        if let Some(replaced) = f(self)? {
            return Ok(replaced);
        }
        let boxed = |e: &ScalarExpr, f: &mut F| e.try_transform(f).map(Box::new);
        Ok(match self {
            ScalarExpr::Column(_) | ScalarExpr::Literal(_) => self.clone(),
            ScalarExpr::Binary { left, op, right } => ScalarExpr::Binary {
                left: boxed(left, f)?,
                op: *op,
                right: boxed(right, f)?,
            },
            ScalarExpr::Not(e) => ScalarExpr::Not(boxed(e, f)?),
            ScalarExpr::Negate(e) => ScalarExpr::Negate(boxed(e, f)?),
            ScalarExpr::IsNull { expr, negated } => ScalarExpr::IsNull {
                expr: boxed(expr, f)?,
                negated: *negated,
            },
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => ScalarExpr::InList {
                expr: boxed(expr, f)?,
                list: list
                    .iter()
                    .map(|e| e.try_transform(f))
                    .collect::<Result<_, E>>()?,
                negated: *negated,
            },
            ScalarExpr::Cast { expr, data_type } => ScalarExpr::Cast {
                expr: boxed(expr, f)?,
                data_type: *data_type,
            },
            ScalarExpr::Tuple(items) => ScalarExpr::Tuple(
                items
                    .iter()
                    .map(|e| e.try_transform(f))
                    .collect::<Result<_, E>>()?,
            ),
            ScalarExpr::Function { func, args } => ScalarExpr::Function {
                func: *func,
                args: args
                    .iter()
                    .map(|e| e.try_transform(f))
                    .collect::<Result<_, E>>()?,
            },
            ScalarExpr::Aggregate(call) => ScalarExpr::Aggregate(Box::new(AggregateCall {
                func: call.func,
                arg: call.arg.as_ref().map(|a| a.try_transform(f)).transpose()?,
            })),
            ScalarExpr::Window(call) => ScalarExpr::Window(Box::new(WindowCall {
                func: call.func,
                partition_by: call
                    .partition_by
                    .iter()
                    .map(|e| e.try_transform(f))
                    .collect::<Result<_, E>>()?,
                order_by: call
                    .order_by
                    .iter()
                    .map(|k| {
                        Ok(SortKey {
                            expr: k.expr.try_transform(f)?,
                            ascending: k.ascending,
                        })
                    })
                    .collect::<Result<_, E>>()?,
            })),
            ScalarExpr::Subquery(sub) => {
                let kind = match &sub.kind {
                    SubqueryKind::In { operand } => SubqueryKind::In {
                        operand: boxed(operand, f)?,
                    },
                    other => other.clone(),
                };
                ScalarExpr::Subquery(Box::new(SubqueryExpr {
                    kind,
                    ..SubqueryExpr::clone(sub)
                }))
            }
        })
    }

    /// Infallible [`try_transform`](Self::try_transform).
    pub fn transform<F>(&self, f: &mut F) -> ScalarExpr
    where
        F: FnMut(&ScalarExpr) -> Option<ScalarExpr>,
    {
        let result: Result<ScalarExpr, Infallible> = self.try_transform(&mut |e| Ok(f(e)));
        match result {
            Ok(expr) => expr,
            Err(never) => match never {},
        }
    }

    /// Replace column references found in `map`.
    pub fn rename_columns(&self, map: &dyn Fn(&ColumnRef) -> Option<ColumnRef>) -> ScalarExpr {
        self.transform(&mut |e| match e {
            ScalarExpr::Column(c) => map(c).map(ScalarExpr::Column),
            _ => None,
        })
    }

    /// Every column this expression reads, including the outer columns read
    /// by nested subqueries.
    pub fn column_refs(&self) -> BTreeSet<ColumnRef> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| match e {
            ScalarExpr::Column(c) => {
                out.insert(c.clone());
            }
            ScalarExpr::Subquery(sub) => {
                out.extend(sub.plan.free_columns());
            }
            _ => {}
        });
        out
    }

    /// Relation keys this expression reads.
    pub fn relations(&self) -> BTreeSet<String> {
        self.column_refs().into_iter().map(|c| c.relation).collect()
    }

    pub fn subqueries(&self) -> Vec<&SubqueryExpr> {
        let mut out = Vec::new();
        collect_subqueries(self, &mut out);
        out
    }

    pub fn contains_subquery(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, ScalarExpr::Subquery(_)));
        found
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, ScalarExpr::Aggregate(_)));
        found
    }

    pub fn contains_window(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, ScalarExpr::Window(_)));
        found
    }

    /// No column or subquery inside.
    pub fn is_constant(&self) -> bool {
        let mut constant = true;
        self.visit(&mut |e| {
            constant &= !matches!(
                e,
                ScalarExpr::Column(_)
                    | ScalarExpr::Subquery(_)
                    | ScalarExpr::Aggregate(_)
                    | ScalarExpr::Window(_)
            )
        });
        constant
    }
}

fn collect_subqueries<'a>(expr: &'a ScalarExpr, out: &mut Vec<&'a SubqueryExpr>) {
    match expr {
        ScalarExpr::Subquery(sub) => {
            if let SubqueryKind::In { operand } = &sub.kind {
                collect_subqueries(operand, out);
            }
            out.push(sub);
        }
        ScalarExpr::Column(_) | ScalarExpr::Literal(_) => {}
        ScalarExpr::Binary { left, right, .. } => {
            collect_subqueries(left, out);
            collect_subqueries(right, out);
        }
        ScalarExpr::Not(e)
        | ScalarExpr::Negate(e)
        | ScalarExpr::IsNull { expr: e, .. }
        | ScalarExpr::Cast { expr: e, .. } => collect_subqueries(e, out),
        ScalarExpr::InList { expr, list, .. } => {
            collect_subqueries(expr, out);
            list.iter().for_each(|e| collect_subqueries(e, out));
        }
        ScalarExpr::Tuple(items) | ScalarExpr::Function { args: items, .. } => {
            items.iter().for_each(|e| collect_subqueries(e, out))
        }
        ScalarExpr::Aggregate(call) => {
            if let Some(arg) = &call.arg {
                collect_subqueries(arg, out);
            }
        }
        ScalarExpr::Window(call) => {
            call.partition_by
                .iter()
                .for_each(|e| collect_subqueries(e, out));
            call.order_by
                .iter()
                .for_each(|k| collect_subqueries(&k.expr, out));
        }
    }
}

fn join_exprs(exprs: &[ScalarExpr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, expr: &ScalarExpr) -> fmt::Result {
    match expr {
        ScalarExpr::Binary { .. } => write!(f, "({})", expr),
        _ => write!(f, "{}", expr),
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Column(c) => write!(f, "{}", c),
            ScalarExpr::Literal(Value::Null) => write!(f, "NULL"),
            ScalarExpr::Literal(Value::String(s)) => write!(f, "'{}'", s),
            ScalarExpr::Literal(v) => write!(f, "{}", v),
            ScalarExpr::Binary { left, op, right } => {
                fmt_operand(f, left)?;
                write!(f, " {} ", op)?;
                fmt_operand(f, right)
            }
            ScalarExpr::Not(e) => {
                write!(f, "NOT ")?;
                fmt_operand(f, e)
            }
            ScalarExpr::Negate(e) => {
                write!(f, "-")?;
                fmt_operand(f, e)
            }
            ScalarExpr::IsNull { expr, negated } => {
                fmt_operand(f, expr)?;
                write!(f, " IS {}NULL", if *negated { "NOT " } else { "" })
            }
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                fmt_operand(f, expr)?;
                write!(
                    f,
                    " {}IN ({})",
                    if *negated { "NOT " } else { "" },
                    join_exprs(list)
                )
            }
            ScalarExpr::Cast { expr, data_type } => write!(f, "CAST({} AS {})", expr, data_type),
            ScalarExpr::Tuple(items) => write!(f, "({})", join_exprs(items)),
            ScalarExpr::Function { func, args } => write!(f, "{}({})", func.name(), join_exprs(args)),
            ScalarExpr::Aggregate(call) => write!(f, "{}", call),
            ScalarExpr::Window(call) => write!(f, "{}", call),
            ScalarExpr::Subquery(sub) => match &sub.kind {
                SubqueryKind::Scalar => write!(f, "(subquery#{})", sub.id),
                SubqueryKind::Exists => write!(f, "EXISTS(subquery#{})", sub.id),
                SubqueryKind::In { operand } => {
                    fmt_operand(f, operand)?;
                    write!(f, " IN (subquery#{})", sub.id)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(rel: &str, c: &str) -> ScalarExpr {
        ScalarExpr::column(rel, c)
    }

    #[test]
    fn test_split_and_conjoin() {
        let a = ScalarExpr::eq(col("xy", "x"), col("uv", "u"));
        let b = ScalarExpr::binary(col("xy", "y"), BinaryOperator::Gt, ScalarExpr::literal(json!(1)));
        let c = ScalarExpr::eq(col("uv", "v"), ScalarExpr::literal(json!(2)));

        let combined = ScalarExpr::conjoin(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(combined.split_conjuncts(), vec![a, b, c]);
        assert!(ScalarExpr::conjoin(Vec::new()).is_none());
    }

    #[test]
    fn test_relations_and_rename() {
        let expr = ScalarExpr::eq(col("xy", "x"), col("uv", "u"));
        let rels: Vec<String> = expr.relations().into_iter().collect();
        assert_eq!(rels, vec!["uv".to_string(), "xy".to_string()]);

        let renamed = expr.rename_columns(&|c| {
            (c.relation == "uv").then(|| ColumnRef::new("applySubq0", c.column.clone()))
        });
        assert_eq!(renamed.to_string(), "xy.x = applySubq0.u");
    }

    #[test]
    fn test_disjuncts_and_constants() {
        let expr = ScalarExpr::binary(
            ScalarExpr::eq(col("xy", "x"), ScalarExpr::literal(json!(1))),
            BinaryOperator::Or,
            ScalarExpr::eq(col("xy", "x"), ScalarExpr::literal(json!(2))),
        );
        assert_eq!(expr.split_disjuncts().len(), 2);
        assert!(!expr.is_constant());
        assert!(ScalarExpr::binary(
            ScalarExpr::literal(json!(1)),
            BinaryOperator::Plus,
            ScalarExpr::literal(json!(2))
        )
        .is_constant());
    }

    #[test]
    fn test_display() {
        let expr = ScalarExpr::and(
            ScalarExpr::eq(col("xy", "y"), col("rs", "s")),
            ScalarExpr::IsNull {
                expr: Box::new(col("rs", "r")),
                negated: true,
            },
        );
        assert_eq!(expr.to_string(), "(xy.y = rs.s) AND (rs.r IS NOT NULL)");
    }
}
