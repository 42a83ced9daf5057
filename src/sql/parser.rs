//! SQL parser implementation.
//!
//! Converts SQL strings to our internal AST using sqlparser. Only SELECT
//! queries (optionally wrapped in EXPLAIN) are accepted.

use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use super::ast::*;
use super::error::{ParseError, ParseResult};
use super::hints::extract_hints;
use crate::catalog::DataType;

/// SQL parser for join planning queries.
pub struct Parser;

impl Parser {
    /// Parse a SQL string into a statement.
    pub fn parse(sql: &str) -> ParseResult<Statement> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(ParseError::EmptyQuery);
        }

        let hints = extract_hints(sql)?;
        let dialect = GenericDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;

        if statements.is_empty() {
            return Err(ParseError::EmptyQuery);
        }
        if statements.len() > 1 {
            return Err(ParseError::MultipleStatements);
        }

        let mut converter = Converter {
            hints,
            next_select: 0,
        };
        converter.convert_statement(&statements[0])
    }

    /// Parse a SQL string that must be a SELECT query.
    pub fn parse_query(sql: &str) -> ParseResult<Query> {
        match Self::parse(sql)? {
            Statement::Select(query) => Ok(query),
            Statement::Explain(_) => Err(ParseError::UnsupportedStatement(
                "EXPLAIN where a query was expected".into(),
            )),
        }
    }
}

/// Walks the sqlparser AST in textual order so every SELECT picks up the
/// hint found at the same SELECT ordinal in the token stream.
struct Converter {
    hints: Vec<Option<JoinOrderHint>>,
    next_select: usize,
}

impl Converter {
    fn convert_statement(&mut self, stmt: &sp::Statement) -> ParseResult<Statement> {
        match stmt {
            sp::Statement::Query(query) => Ok(Statement::Select(self.convert_query(query)?)),
            sp::Statement::Explain { statement, .. } => match statement.as_ref() {
                sp::Statement::Query(query) => Ok(Statement::Explain(self.convert_query(query)?)),
                other => Err(ParseError::UnsupportedStatement(format!(
                    "EXPLAIN {}",
                    other
                ))),
            },
            other => Err(ParseError::UnsupportedStatement(other.to_string())),
        }
    }

    fn take_hint(&mut self) -> Option<JoinOrderHint> {
        let hint = self.hints.get(self.next_select).cloned().flatten();
        self.next_select += 1;
        hint
    }

    fn convert_query(&mut self, query: &sp::Query) -> ParseResult<Query> {
        if query.with.is_some() {
            return Err(ParseError::UnsupportedStatement("WITH clause".into()));
        }
        let select = match query.body.as_ref() {
            sp::SetExpr::Select(s) => s,
            other => {
                return Err(ParseError::UnsupportedStatement(format!(
                    "Unsupported query type: {}",
                    other
                )))
            }
        };
        let body = self.convert_select(select)?;

        let order_by = match &query.order_by {
            Some(ob) => self.convert_order_by(ob)?,
            None => Vec::new(),
        };

        let limit = query.limit.as_ref().map(Self::expr_to_usize).transpose()?;
        let offset = query
            .offset
            .as_ref()
            .map(|o| Self::expr_to_usize(&o.value))
            .transpose()?;

        Ok(Query {
            body,
            order_by,
            limit,
            offset,
        })
    }

    fn convert_select(&mut self, select: &sp::Select) -> ParseResult<Select> {
        let hint = self.take_hint();

        let distinct = match &select.distinct {
            None => false,
            Some(sp::Distinct::Distinct) => true,
            Some(other) => {
                return Err(ParseError::UnsupportedExpression(other.to_string()));
            }
        };

        let columns = self.convert_projection(&select.projection)?;

        let from = select
            .from
            .iter()
            .map(|twj| self.convert_table_with_joins(twj))
            .collect::<ParseResult<Vec<_>>>()?;

        let where_clause = select
            .selection
            .as_ref()
            .map(|e| self.convert_expr(e))
            .transpose()?;

        let group_by = match &select.group_by {
            sp::GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|e| self.convert_expr(e))
                .collect::<ParseResult<Vec<_>>>()?,
            sp::GroupByExpr::All(_) => {
                return Err(ParseError::UnsupportedExpression("GROUP BY ALL".into()))
            }
        };

        let having = select
            .having
            .as_ref()
            .map(|e| self.convert_expr(e))
            .transpose()?;

        Ok(Select {
            hint,
            distinct,
            columns,
            from,
            where_clause,
            group_by,
            having,
        })
    }

    fn convert_projection(&mut self, items: &[sp::SelectItem]) -> ParseResult<Vec<SelectColumn>> {
        items
            .iter()
            .map(|item| match item {
                sp::SelectItem::Wildcard(_) => Ok(SelectColumn::Wildcard),
                sp::SelectItem::UnnamedExpr(expr) => Ok(SelectColumn::Expr {
                    expr: self.convert_expr(expr)?,
                    alias: None,
                }),
                sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectColumn::Expr {
                    expr: self.convert_expr(expr)?,
                    alias: Some(alias.value.clone()),
                }),
                sp::SelectItem::QualifiedWildcard(kind, _) => {
                    Ok(SelectColumn::QualifiedWildcard(Self::last_ident(&kind.to_string())))
                }
            })
            .collect()
    }

    fn convert_table_with_joins(&mut self, twj: &sp::TableWithJoins) -> ParseResult<TableRef> {
        let mut current = self.convert_table_factor(&twj.relation)?;
        let unconstrained = sp::JoinConstraint::None;
        for join in &twj.joins {
            let (kind, constraint) = match &join.join_operator {
                sp::JoinOperator::Join(c) | sp::JoinOperator::Inner(c) => (JoinKind::Inner, c),
                sp::JoinOperator::CrossJoin => (JoinKind::Inner, &unconstrained),
                sp::JoinOperator::Left(c) | sp::JoinOperator::LeftOuter(c) => (JoinKind::LeftOuter, c),
                other => {
                    return Err(ParseError::UnsupportedStatement(format!(
                        "join operator {:?}",
                        other
                    )))
                }
            };
            let right = self.convert_table_factor(&join.relation)?;
            let on = match constraint {
                sp::JoinConstraint::On(expr) => Some(self.convert_expr(expr)?),
                sp::JoinConstraint::None => None,
                other => {
                    return Err(ParseError::UnsupportedStatement(format!(
                        "join constraint {:?}",
                        other
                    )))
                }
            };
            if kind == JoinKind::LeftOuter && on.is_none() {
                return Err(ParseError::Syntax("LEFT JOIN requires ON".into()));
            }
            current = TableRef::Join {
                left: Box::new(current),
                right: Box::new(right),
                kind,
                on,
            };
        }
        Ok(current)
    }

    fn convert_table_factor(&mut self, factor: &sp::TableFactor) -> ParseResult<TableRef> {
        match factor {
            sp::TableFactor::Table { name, alias, .. } => Ok(TableRef::Table {
                name: Self::extract_table_name(name)?,
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            }),
            sp::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .ok_or_else(|| {
                        ParseError::InvalidIdentifier("derived table requires an alias".into())
                    })?;
                Ok(TableRef::Derived {
                    query: Box::new(self.convert_query(subquery)?),
                    alias,
                })
            }
            sp::TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.convert_table_with_joins(table_with_joins),
            other => Err(ParseError::UnsupportedStatement(format!(
                "Unsupported FROM clause: {}",
                other
            ))),
        }
    }

    fn convert_order_by(&mut self, ob: &sp::OrderBy) -> ParseResult<Vec<OrderBy>> {
        match &ob.kind {
            sp::OrderByKind::All(_) => Err(ParseError::UnsupportedExpression("ORDER BY ALL".into())),
            sp::OrderByKind::Expressions(exprs) => exprs
                .iter()
                .map(|e| self.convert_order_by_expr(e))
                .collect(),
        }
    }

    fn convert_order_by_expr(&mut self, expr: &sp::OrderByExpr) -> ParseResult<OrderBy> {
        Ok(OrderBy {
            expr: self.convert_expr(&expr.expr)?,
            ascending: expr.options.asc.unwrap_or(true),
        })
    }

    fn convert_boxed(&mut self, expr: &sp::Expr) -> ParseResult<Box<Expr>> {
        Ok(Box::new(self.convert_expr(expr)?))
    }

    fn convert_expr(&mut self, expr: &sp::Expr) -> ParseResult<Expr> {
        match expr {
            sp::Expr::Identifier(id) => Ok(Expr::column(id.value.clone())),

            sp::Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [column] => Ok(Expr::column(column.value.clone())),
                [.., table, column] => Ok(Expr::qualified(table.value.clone(), column.value.clone())),
                [] => Err(ParseError::InvalidIdentifier("empty compound identifier".into())),
            },

            sp::Expr::Value(v) => Ok(Expr::Literal(Self::convert_value(v)?)),

            sp::Expr::BinaryOp { left, op, right } => {
                let l = self.convert_boxed(left)?;
                let r = self.convert_boxed(right)?;
                Ok(Expr::BinaryOp {
                    left: l,
                    op: Self::convert_binary_op(op)?,
                    right: r,
                })
            }

            sp::Expr::UnaryOp { op, expr } => Ok(Expr::UnaryOp {
                op: Self::convert_unary_op(op)?,
                expr: self.convert_boxed(expr)?,
            }),

            sp::Expr::IsNull(e) => Ok(Expr::IsNull {
                expr: self.convert_boxed(e)?,
                negated: false,
            }),

            sp::Expr::IsNotNull(e) => Ok(Expr::IsNull {
                expr: self.convert_boxed(e)?,
                negated: true,
            }),

            sp::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let e = self.convert_boxed(expr)?;
                let items = list
                    .iter()
                    .map(|item| self.convert_expr(item))
                    .collect::<ParseResult<Vec<_>>>()?;
                Ok(Expr::InList {
                    expr: e,
                    list: items,
                    negated: *negated,
                })
            }

            sp::Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let e = self.convert_boxed(expr)?;
                Ok(Expr::InSubquery {
                    expr: e,
                    subquery: Box::new(self.convert_query(subquery)?),
                    negated: *negated,
                })
            }

            sp::Expr::Exists { subquery, negated } => Ok(Expr::Exists {
                subquery: Box::new(self.convert_query(subquery)?),
                negated: *negated,
            }),

            sp::Expr::Subquery(query) => Ok(Expr::Subquery(Box::new(self.convert_query(query)?))),

            sp::Expr::Cast {
                expr, data_type, ..
            } => Ok(Expr::Cast {
                expr: self.convert_boxed(expr)?,
                data_type: Self::convert_data_type(data_type)?,
            }),

            sp::Expr::Tuple(items) => Ok(Expr::Tuple(
                items
                    .iter()
                    .map(|item| self.convert_expr(item))
                    .collect::<ParseResult<Vec<_>>>()?,
            )),

            sp::Expr::Function(f) => self.convert_function(f),

            sp::Expr::Nested(inner) => Ok(Expr::Nested(self.convert_boxed(inner)?)),

            other => Err(ParseError::UnsupportedExpression(other.to_string())),
        }
    }

    fn convert_function(&mut self, f: &sp::Function) -> ParseResult<Expr> {
        let name = Self::last_ident(&f.name.to_string()).to_lowercase();
        let mut star = false;
        let args = match &f.args {
            sp::FunctionArguments::List(list) => {
                let mut args = Vec::with_capacity(list.args.len());
                for arg in &list.args {
                    match arg {
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => {
                            args.push(self.convert_expr(e)?)
                        }
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => star = true,
                        other => {
                            return Err(ParseError::UnsupportedExpression(other.to_string()))
                        }
                    }
                }
                args
            }
            sp::FunctionArguments::None => Vec::new(),
            sp::FunctionArguments::Subquery(_) => {
                return Err(ParseError::UnsupportedExpression(format!(
                    "subquery argument to {}",
                    name
                )))
            }
        };

        let over = match &f.over {
            None => None,
            Some(sp::WindowType::WindowSpec(spec)) => {
                let partition_by = spec
                    .partition_by
                    .iter()
                    .map(|e| self.convert_expr(e))
                    .collect::<ParseResult<Vec<_>>>()?;
                let order_by = spec
                    .order_by
                    .iter()
                    .map(|e| self.convert_order_by_expr(e))
                    .collect::<ParseResult<Vec<_>>>()?;
                Some(WindowSpec {
                    partition_by,
                    order_by,
                })
            }
            Some(other) => {
                return Err(ParseError::UnsupportedExpression(format!(
                    "named window {}",
                    other
                )))
            }
        };

        Ok(Expr::Function {
            name,
            args,
            star,
            over,
        })
    }

    fn convert_data_type(dt: &sp::DataType) -> ParseResult<DataType> {
        match dt {
            sp::DataType::Text
            | sp::DataType::Varchar(_)
            | sp::DataType::CharVarying(_)
            | sp::DataType::Character(_)
            | sp::DataType::Char(_)
            | sp::DataType::String(_) => Ok(DataType::Text),

            sp::DataType::Int(_)
            | sp::DataType::Integer(_)
            | sp::DataType::BigInt(_)
            | sp::DataType::SmallInt(_)
            | sp::DataType::TinyInt(_)
            | sp::DataType::Signed
            | sp::DataType::SignedInteger
            | sp::DataType::Unsigned
            | sp::DataType::UnsignedInteger => Ok(DataType::Integer),

            sp::DataType::Float(_)
            | sp::DataType::Real
            | sp::DataType::Double(_)
            | sp::DataType::DoublePrecision
            | sp::DataType::Decimal(_)
            | sp::DataType::Numeric(_) => Ok(DataType::Float),

            sp::DataType::Boolean | sp::DataType::Bool => Ok(DataType::Boolean),

            other => Err(ParseError::UnsupportedDataType(other.to_string())),
        }
    }

    fn convert_value(v: &sp::ValueWithSpan) -> ParseResult<LiteralValue> {
        match &v.value {
            sp::Value::Null => Ok(LiteralValue::Null),
            sp::Value::Boolean(b) => Ok(LiteralValue::Boolean(*b)),
            sp::Value::Number(s, _) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(LiteralValue::Integer(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(LiteralValue::Float(f))
                } else {
                    Err(ParseError::UnsupportedExpression(format!("Invalid number: {}", s)))
                }
            }
            sp::Value::SingleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            sp::Value::DoubleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            other => Err(ParseError::UnsupportedExpression(format!(
                "Unsupported value: {}",
                other
            ))),
        }
    }

    fn convert_binary_op(op: &sp::BinaryOperator) -> ParseResult<BinaryOperator> {
        match op {
            sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
            sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
            sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
            sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
            sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
            sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
            sp::BinaryOperator::Spaceship => Ok(BinaryOperator::NullSafeEq),
            sp::BinaryOperator::And => Ok(BinaryOperator::And),
            sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
            sp::BinaryOperator::Plus => Ok(BinaryOperator::Plus),
            sp::BinaryOperator::Minus => Ok(BinaryOperator::Minus),
            sp::BinaryOperator::Multiply => Ok(BinaryOperator::Multiply),
            sp::BinaryOperator::Divide => Ok(BinaryOperator::Divide),
            sp::BinaryOperator::Modulo => Ok(BinaryOperator::Modulo),
            other => Err(ParseError::UnsupportedExpression(format!(
                "Unsupported operator: {}",
                other
            ))),
        }
    }

    fn convert_unary_op(op: &sp::UnaryOperator) -> ParseResult<UnaryOperator> {
        match op {
            sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
            sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
            sp::UnaryOperator::Plus => Ok(UnaryOperator::Plus),
            other => Err(ParseError::UnsupportedExpression(format!(
                "Unsupported unary operator: {}",
                other
            ))),
        }
    }

    fn extract_table_name(name: &sp::ObjectName) -> ParseResult<String> {
        // Use just the table name, ignoring schema
        name.0
            .last()
            .map(|i| {
                i.as_ident()
                    .map(|id| id.value.clone())
                    .unwrap_or_else(|| i.to_string())
            })
            .ok_or_else(|| ParseError::InvalidIdentifier("empty table name".into()))
    }

    /// `schema.t` -> `t`, `t.*` -> `t`
    fn last_ident(text: &str) -> String {
        let trimmed = text.trim_end_matches(".*");
        trimmed
            .rsplit('.')
            .next()
            .unwrap_or(trimmed)
            .trim_matches('`')
            .trim_matches('"')
            .to_string()
    }

    fn expr_to_usize(expr: &sp::Expr) -> ParseResult<usize> {
        if let sp::Expr::Value(v) = expr {
            if let sp::Value::Number(s, _) = &v.value {
                if let Ok(n) = s.parse() {
                    return Ok(n);
                }
            }
        }
        Err(ParseError::UnsupportedExpression(format!(
            "expected a non-negative integer, got {}",
            expr
        )))
    }
}
