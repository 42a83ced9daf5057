//! Expression evaluation.
//!
//! Predicates follow SQL three-valued logic: comparisons against NULL are
//! unknown (JSON `null`), and only a definite `true` passes a filter.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Number, Value};

use super::error::{ExecuteError, ExecuteResult};
use super::executor::ExecutionContext;
use super::operators::{build_operator, Operator, Row, RowContext};
use crate::planner::expr::{ScalarFunction, SubqueryExpr, SubqueryKind};
use crate::planner::{PhysicalPlanNode, ScalarExpr};
use crate::sql::BinaryOperator;
use crate::storage::compare_total;

/// Operator tree of one subquery expression, rewound per evaluation.
struct SubqueryOperator {
    operator: Box<dyn Operator>,
    output: Vec<String>,
}

impl SubqueryOperator {
    fn value_of(&self, row: &Row) -> Value {
        match self.output.as_slice() {
            [single] => row.get(single).cloned().unwrap_or(Value::Null),
            columns => Value::Array(
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }
}

/// Evaluates the expressions of one plan node, owning the operators of the
/// subqueries those expressions contain.
#[derive(Default)]
pub struct ExprEvaluator {
    subqueries: HashMap<usize, SubqueryOperator>,
}

impl ExprEvaluator {
    pub fn new(node: &PhysicalPlanNode, exec: &Arc<ExecutionContext>) -> ExecuteResult<Self> {
        let mut subqueries = HashMap::new();
        for (id, plan) in node.subquery_plans() {
            let operator = build_operator(plan, exec)?;
            let output = plan.output.iter().map(|c| c.key()).collect();
            subqueries.insert(id, SubqueryOperator { operator, output });
        }
        Ok(Self { subqueries })
    }

    /// Evaluate `expr` against `row`, falling back to the enclosing rows of
    /// `ctx` for columns the row does not carry.
    pub fn evaluate(&mut self, expr: &ScalarExpr, row: &Row, ctx: &RowContext) -> ExecuteResult<Value> {
        match expr {
            ScalarExpr::Column(column) => {
                let key = column.key();
                row.get(&key)
                    .or_else(|| ctx.get(&key))
                    .cloned()
                    .ok_or(ExecuteError::ColumnNotFound(key))
            }

            ScalarExpr::Literal(value) => Ok(value.clone()),

            ScalarExpr::Binary {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                let l = truth(&self.evaluate(left, row, ctx)?)?;
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = truth(&self.evaluate(right, row, ctx)?)?;
                Ok(from_truth(and3(l, r)))
            }

            ScalarExpr::Binary {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                let l = truth(&self.evaluate(left, row, ctx)?)?;
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = truth(&self.evaluate(right, row, ctx)?)?;
                Ok(from_truth(or3(l, r)))
            }

            ScalarExpr::Binary { left, op, right } => {
                let l = self.evaluate(left, row, ctx)?;
                let r = self.evaluate(right, row, ctx)?;
                eval_binary_op(&l, *op, &r)
            }

            ScalarExpr::Not(inner) => {
                let v = truth(&self.evaluate(inner, row, ctx)?)?;
                Ok(from_truth(v.map(|b| !b)))
            }

            ScalarExpr::Negate(inner) => negate(&self.evaluate(inner, row, ctx)?),

            ScalarExpr::IsNull { expr, negated } => {
                let v = self.evaluate(expr, row, ctx)?;
                Ok(Value::Bool(v.is_null() != *negated))
            }

            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let v = self.evaluate(expr, row, ctx)?;
                let mut found = Some(false);
                for item in list {
                    match sql_eq(&v, &self.evaluate(item, row, ctx)?) {
                        Some(true) => {
                            found = Some(true);
                            break;
                        }
                        None => found = None,
                        Some(false) => {}
                    }
                }
                Ok(from_truth(found.map(|b| b != *negated)))
            }

            ScalarExpr::Cast { expr, data_type } => {
                Ok(data_type.coerce(&self.evaluate(expr, row, ctx)?))
            }

            ScalarExpr::Tuple(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|e| self.evaluate(e, row, ctx))
                    .collect::<ExecuteResult<_>>()?,
            )),

            ScalarExpr::Function { func, args } => {
                let values = args
                    .iter()
                    .map(|a| self.evaluate(a, row, ctx))
                    .collect::<ExecuteResult<Vec<_>>>()?;
                eval_function(*func, &values)
            }

            ScalarExpr::Aggregate(call) => Err(ExecuteError::Internal(format!(
                "aggregate {} evaluated outside an aggregate operator",
                call
            ))),

            ScalarExpr::Window(call) => Err(ExecuteError::Internal(format!(
                "window function {} evaluated outside a window operator",
                call
            ))),

            ScalarExpr::Subquery(sub) => self.eval_subquery(sub, row, ctx),
        }
    }

    /// True only when the predicate is definitely true.
    pub fn is_true(&mut self, expr: &ScalarExpr, row: &Row, ctx: &RowContext) -> ExecuteResult<bool> {
        Ok(truth(&self.evaluate(expr, row, ctx)?)? == Some(true))
    }

    /// Evaluate each expression in order.
    pub fn evaluate_all(
        &mut self,
        exprs: &[ScalarExpr],
        row: &Row,
        ctx: &RowContext,
    ) -> ExecuteResult<Vec<Value>> {
        exprs.iter().map(|e| self.evaluate(e, row, ctx)).collect()
    }

    fn eval_subquery(&mut self, sub: &SubqueryExpr, row: &Row, ctx: &RowContext) -> ExecuteResult<Value> {
        let operand = match &sub.kind {
            SubqueryKind::In { operand } => self.evaluate(operand, row, ctx)?,
            _ => Value::Null,
        };
        let entry = self.subqueries.get_mut(&sub.id).ok_or_else(|| {
            ExecuteError::Internal(format!("subquery #{} has no physical plan", sub.id))
        })?;
        entry.operator.rewind(&ctx.child(sub.scope, row))?;

        match &sub.kind {
            SubqueryKind::Scalar => {
                let Some(first) = entry.operator.next_row()? else {
                    return Ok(Value::Null);
                };
                if entry.operator.next_row()?.is_some() {
                    return Err(ExecuteError::ScalarSubqueryRows(sub.id));
                }
                Ok(entry.value_of(&first))
            }
            SubqueryKind::Exists => Ok(Value::Bool(entry.operator.next_row()?.is_some())),
            SubqueryKind::In { .. } => {
                let mut found = Some(false);
                while let Some(candidate) = entry.operator.next_row()? {
                    match sql_eq(&operand, &entry.value_of(&candidate)) {
                        Some(true) => return Ok(Value::Bool(true)),
                        None => found = None,
                        Some(false) => {}
                    }
                }
                Ok(from_truth(found))
            }
        }
    }
}

/// Truth value of a predicate result; `None` is unknown.
pub fn truth(value: &Value) -> ExecuteResult<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        other => Err(ExecuteError::TypeMismatch {
            expected: "boolean".to_string(),
            actual: type_name(other).to_string(),
        }),
    }
}

fn from_truth(value: Option<bool>) -> Value {
    value.map(Value::Bool).unwrap_or(Value::Null)
}

fn and3(l: Option<bool>, r: Option<bool>) -> Option<bool> {
    match (l, r) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(l: Option<bool>, r: Option<bool>) -> Option<bool> {
    match (l, r) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

/// SQL equality. Unknown when either side is NULL; tuples compare
/// column-wise.
pub fn sql_eq(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return Some(false);
            }
            let mut result = Some(true);
            for (p, q) in x.iter().zip(y) {
                match sql_eq(p, q) {
                    Some(false) => return Some(false),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        _ => Some(compare_total(a, b) == Ordering::Equal),
    }
}

fn sql_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        None
    } else {
        Some(compare_total(a, b))
    }
}

fn eval_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> ExecuteResult<Value> {
    let compared = |f: fn(Ordering) -> bool| from_truth(sql_cmp(left, right).map(f));
    match op {
        // Comparison operators
        BinaryOperator::Eq => Ok(from_truth(sql_eq(left, right))),
        BinaryOperator::NotEq => Ok(from_truth(sql_eq(left, right).map(|b| !b))),
        BinaryOperator::Lt => Ok(compared(|o| o == Ordering::Less)),
        BinaryOperator::LtEq => Ok(compared(|o| o != Ordering::Greater)),
        BinaryOperator::Gt => Ok(compared(|o| o == Ordering::Greater)),
        BinaryOperator::GtEq => Ok(compared(|o| o != Ordering::Less)),
        BinaryOperator::NullSafeEq => Ok(Value::Bool(compare_total(left, right) == Ordering::Equal)),

        // Logical operators
        BinaryOperator::And => Ok(from_truth(and3(truth(left)?, truth(right)?))),
        BinaryOperator::Or => Ok(from_truth(or3(truth(left)?, truth(right)?))),

        // Arithmetic operators
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => eval_arithmetic(left, op, right),
    }
}

fn numeric(value: &Value) -> ExecuteResult<Number> {
    match value {
        Value::Number(n) => Ok(n.clone()),
        Value::Bool(b) => Ok(Number::from(*b as i64)),
        other => Err(ExecuteError::TypeMismatch {
            expected: "number".to_string(),
            actual: type_name(other).to_string(),
        }),
    }
}

/// `a + b` with the arithmetic rules of expressions; used by SUM.
pub(crate) fn add_values(a: &Value, b: &Value) -> ExecuteResult<Value> {
    eval_arithmetic(a, BinaryOperator::Plus, b)
}

/// Numeric value as a float; used by AVG.
pub(crate) fn to_f64(value: &Value) -> ExecuteResult<f64> {
    Ok(numeric(value)?.as_f64().unwrap_or(f64::NAN))
}

pub(crate) fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn eval_arithmetic(left: &Value, op: BinaryOperator, right: &Value) -> ExecuteResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let (a, b) = (numeric(left)?, numeric(right)?);

    // Integer arithmetic while it stays exact.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOperator::Plus => x.checked_add(y),
            BinaryOperator::Minus => x.checked_sub(y),
            BinaryOperator::Multiply => x.checked_mul(y),
            BinaryOperator::Divide | BinaryOperator::Modulo if y == 0 => {
                return Err(ExecuteError::DivisionByZero)
            }
            BinaryOperator::Divide => x.checked_rem(y).filter(|r| *r == 0).and_then(|_| x.checked_div(y)),
            BinaryOperator::Modulo => x.checked_rem(y),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOperator::Plus => x + y,
        BinaryOperator::Minus => x - y,
        BinaryOperator::Multiply => x * y,
        BinaryOperator::Divide | BinaryOperator::Modulo if y == 0.0 => {
            return Err(ExecuteError::DivisionByZero)
        }
        BinaryOperator::Divide => x / y,
        BinaryOperator::Modulo => x % y,
        other => {
            return Err(ExecuteError::InvalidExpression(format!(
                "{} is not an arithmetic operator",
                other
            )))
        }
    };
    Ok(float_value(result))
}

fn negate(value: &Value) -> ExecuteResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let n = numeric(value)?;
    match n.as_i64().and_then(i64::checked_neg) {
        Some(v) => Ok(Value::from(v)),
        None => Ok(float_value(-n.as_f64().unwrap_or(f64::NAN))),
    }
}

fn eval_function(func: ScalarFunction, args: &[Value]) -> ExecuteResult<Value> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExecuteError::InvalidExpression(format!(
                "{} expects {} argument(s), got {}",
                func.name(),
                n,
                args.len()
            )))
        }
    };
    match func {
        ScalarFunction::Abs => {
            arity(1)?;
            if args[0].is_null() {
                return Ok(Value::Null);
            }
            let n = numeric(&args[0])?;
            match n.as_i64().and_then(i64::checked_abs) {
                Some(v) => Ok(Value::from(v)),
                None => Ok(float_value(n.as_f64().unwrap_or(f64::NAN).abs())),
            }
        }
        ScalarFunction::Coalesce => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        ScalarFunction::Mod => {
            arity(2)?;
            eval_arithmetic(&args[0], BinaryOperator::Modulo, &args[1])
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "tuple",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use crate::planner::expr::AggregateCall;
    use crate::planner::expr::AggregateFunction;
    use serde_json::json;

    fn col(rel: &str, c: &str) -> ScalarExpr {
        ScalarExpr::column(rel, c)
    }

    fn lit(v: Value) -> ScalarExpr {
        ScalarExpr::literal(v)
    }

    fn bin(l: ScalarExpr, op: BinaryOperator, r: ScalarExpr) -> ScalarExpr {
        ScalarExpr::binary(l, op, r)
    }

    fn eval(expr: &ScalarExpr) -> ExecuteResult<Value> {
        let row = Row::from([
            ("xy.x".to_string(), json!(2)),
            ("xy.y".to_string(), json!(null)),
        ]);
        let ctx = RowContext::root().child(0, &Row::from([("uv.u".to_string(), json!(5))]));
        ExprEvaluator::default().evaluate(expr, &row, &ctx)
    }

    #[test]
    fn test_columns_fall_back_to_outer_rows() {
        assert_eq!(eval(&col("xy", "x")).unwrap(), json!(2));
        assert_eq!(eval(&col("uv", "u")).unwrap(), json!(5));
        assert!(matches!(
            eval(&col("rs", "r")),
            Err(ExecuteError::ColumnNotFound(key)) if key == "rs.r"
        ));
    }

    #[test]
    fn test_three_valued_logic() {
        let unknown = bin(col("xy", "y"), BinaryOperator::Eq, lit(json!(1)));
        assert_eq!(eval(&unknown).unwrap(), json!(null));
        assert_eq!(eval(&ScalarExpr::Not(Box::new(unknown.clone()))).unwrap(), json!(null));

        let falsy = bin(col("xy", "x"), BinaryOperator::Gt, lit(json!(3)));
        assert_eq!(eval(&ScalarExpr::and(unknown.clone(), falsy.clone())).unwrap(), json!(false));
        assert_eq!(
            eval(&bin(unknown.clone(), BinaryOperator::Or, falsy)).unwrap(),
            json!(null)
        );
        assert_eq!(
            eval(&bin(unknown, BinaryOperator::Or, lit(json!(true)))).unwrap(),
            json!(true)
        );

        let null_safe = bin(col("xy", "y"), BinaryOperator::NullSafeEq, lit(json!(null)));
        assert_eq!(eval(&null_safe).unwrap(), json!(true));
    }

    #[test]
    fn test_in_list_with_null() {
        let in_list = |list: Vec<Value>, negated| ScalarExpr::InList {
            expr: Box::new(col("xy", "x")),
            list: list.into_iter().map(lit).collect(),
            negated,
        };
        assert_eq!(eval(&in_list(vec![json!(1), json!(2)], false)).unwrap(), json!(true));
        assert_eq!(eval(&in_list(vec![json!(1), json!(null)], false)).unwrap(), json!(null));
        assert_eq!(eval(&in_list(vec![json!(1)], true)).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic() {
        let plus = bin(col("xy", "x"), BinaryOperator::Plus, lit(json!(3)));
        assert_eq!(eval(&plus).unwrap(), json!(5));
        let half = bin(col("xy", "x"), BinaryOperator::Divide, lit(json!(4)));
        assert_eq!(eval(&half).unwrap(), json!(0.5));
        let whole = bin(col("xy", "x"), BinaryOperator::Divide, lit(json!(2)));
        assert_eq!(eval(&whole).unwrap(), json!(1));
        let with_null = bin(col("xy", "y"), BinaryOperator::Minus, lit(json!(1)));
        assert_eq!(eval(&with_null).unwrap(), json!(null));
        let by_zero = bin(col("xy", "x"), BinaryOperator::Modulo, lit(json!(0)));
        assert!(matches!(eval(&by_zero), Err(ExecuteError::DivisionByZero)));
        let text = bin(lit(json!("a")), BinaryOperator::Plus, lit(json!(1)));
        assert!(matches!(eval(&text), Err(ExecuteError::TypeMismatch { .. })));
        assert_eq!(eval(&ScalarExpr::Negate(Box::new(col("xy", "x")))).unwrap(), json!(-2));
    }

    #[test]
    fn test_functions_cast_and_tuples() {
        let abs = ScalarExpr::Function {
            func: ScalarFunction::Abs,
            args: vec![lit(json!(-4))],
        };
        assert_eq!(eval(&abs).unwrap(), json!(4));
        let coalesce = ScalarExpr::Function {
            func: ScalarFunction::Coalesce,
            args: vec![col("xy", "y"), col("xy", "x")],
        };
        assert_eq!(eval(&coalesce).unwrap(), json!(2));
        let modulo = ScalarExpr::Function {
            func: ScalarFunction::Mod,
            args: vec![lit(json!(7)), lit(json!(3))],
        };
        assert_eq!(eval(&modulo).unwrap(), json!(1));

        let cast = ScalarExpr::Cast {
            expr: Box::new(lit(json!("12"))),
            data_type: DataType::Integer,
        };
        assert_eq!(eval(&cast).unwrap(), json!(12));

        let tuple = ScalarExpr::Tuple(vec![col("xy", "x"), col("uv", "u")]);
        assert_eq!(eval(&tuple).unwrap(), json!([2, 5]));
        assert_eq!(sql_eq(&json!([2, 5]), &json!([2, null])), None);
        assert_eq!(sql_eq(&json!([2, 5]), &json!([3, null])), Some(false));
    }

    #[test]
    fn test_aggregate_placeholder_is_internal_error() {
        let agg = ScalarExpr::Aggregate(Box::new(AggregateCall {
            func: AggregateFunction::CountStar,
            arg: None,
        }));
        assert!(matches!(eval(&agg), Err(ExecuteError::Internal(_))));
    }
}
