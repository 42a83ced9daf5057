//! Volcano-style operators for query execution.
//!
//! Each operator implements the iterator model where rows are pulled
//! one at a time through the tree. An operator is restarted with
//! [`Operator::rewind`], which also hands it the enclosing rows its
//! correlated expressions read.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::cache::CachedRows;
use super::error::{ExecuteError, ExecuteResult};
use super::eval::{add_values, float_value, to_f64, ExprEvaluator};
use super::executor::ExecutionContext;
use super::joins::build_join;
use crate::planner::expr::{AggregateCall, AggregateFunction, SortKey, WindowCall};
use crate::planner::logical::ProjectItem;
use crate::planner::{ColumnRef, IndexAccess, PhysicalOperator, PhysicalPlanNode, ScalarExpr, ScopeId};
use crate::storage::{compare_total, IndexKey, RowId, TableStore};

/// A row in the query execution pipeline, keyed by `relation.column`.
pub type Row = BTreeMap<String, Value>;

/// The enclosing rows an operator is evaluated under.
///
/// A join's right side sees the current left row; a subquery sees the row of
/// the expression that contains it. Lookups fall back to these values for
/// columns the operator's own rows do not carry.
#[derive(Debug, Clone, Default)]
pub struct RowContext {
    scope: ScopeId,
    parent: Arc<Row>,
}

impl RowContext {
    /// Context of the outermost query: no enclosing row.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Context for an operator evaluated under `row`.
    pub fn child(&self, scope: ScopeId, row: &Row) -> Self {
        if row.is_empty() {
            return Self {
                scope,
                parent: Arc::clone(&self.parent),
            };
        }
        let mut merged = Row::clone(&self.parent);
        merged.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            scope,
            parent: Arc::new(merged),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parent.get(key)
    }
}

/// Trait for all query operators.
pub trait Operator: Send {
    /// Restart the operator under the enclosing rows of `ctx`.
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()>;

    /// Get the next row, or None if exhausted.
    fn next_row(&mut self) -> ExecuteResult<Option<Row>>;

    /// Storage row id of the last row returned, for operators reading a
    /// single table.
    fn current_row_id(&self) -> Option<RowId> {
        None
    }
}

/// Build the operator tree of a physical plan node.
pub fn build_operator(
    node: &Arc<PhysicalPlanNode>,
    exec: &Arc<ExecutionContext>,
) -> ExecuteResult<Box<dyn Operator>> {
    let operator: Box<dyn Operator> = match &node.operator {
        PhysicalOperator::TableScan {
            table,
            relation,
            columns,
            ..
        } => {
            let store = Arc::clone(exec.storage.table(table)?);
            let columns = column_positions(&store, relation, columns)?;
            Box::new(TableScan {
                table: store,
                columns,
                position: 0,
                current: None,
            })
        }
        PhysicalOperator::IndexedTableAccess {
            table,
            relation,
            columns,
            index,
            access,
            ..
        } => {
            let store = Arc::clone(exec.storage.table(table)?);
            let columns = column_positions(&store, relation, columns)?;
            Box::new(IndexedTableAccess {
                exec: Arc::clone(exec),
                table: store,
                index: index.name.clone(),
                access: access.clone(),
                columns,
                evaluator: ExprEvaluator::new(node, exec)?,
                ids: Vec::new(),
                position: 0,
                current: None,
            })
        }
        PhysicalOperator::OneRow => Box::new(OneRow { done: false }),
        PhysicalOperator::Filter { predicate } => Box::new(Filter {
            input: input(node, exec)?,
            predicate: predicate.clone(),
            evaluator: ExprEvaluator::new(node, exec)?,
            ctx: RowContext::root(),
        }),
        PhysicalOperator::Project { items } => Box::new(Project {
            input: input(node, exec)?,
            items: items.clone(),
            evaluator: ExprEvaluator::new(node, exec)?,
            ctx: RowContext::root(),
        }),
        PhysicalOperator::SubqueryAlias { columns, .. } => Box::new(SubqueryAlias {
            input: input(node, exec)?,
            columns: columns.iter().map(|(i, o)| (i.key(), o.key())).collect(),
        }),
        PhysicalOperator::CachedResults => Box::new(CachedResults {
            input: input(node, exec)?,
            exec: Arc::clone(exec),
            ctx: RowContext::root(),
            cache: None,
            position: 0,
        }),
        PhysicalOperator::Distinct => Box::new(Distinct {
            input: input(node, exec)?,
            seen: HashSet::new(),
        }),
        PhysicalOperator::Sort { order } => Box::new(Sort {
            input: input(node, exec)?,
            order: order.clone(),
            evaluator: ExprEvaluator::new(node, exec)?,
            ctx: RowContext::root(),
            sorted: None,
        }),
        PhysicalOperator::Limit { limit, offset } => Box::new(Limit {
            input: input(node, exec)?,
            limit: *limit,
            offset: *offset,
            emitted: 0,
            skipped: 0,
        }),
        PhysicalOperator::Aggregate {
            relation,
            group_by,
            aggregates,
        } => Box::new(Aggregate {
            input: input(node, exec)?,
            group_by: group_by.clone(),
            aggregates: aggregates.clone(),
            group_keys: (0..group_by.len())
                .map(|i| ColumnRef::new(relation.clone(), format!("g{}", i)).key())
                .collect(),
            aggregate_keys: (0..aggregates.len())
                .map(|i| ColumnRef::new(relation.clone(), format!("a{}", i)).key())
                .collect(),
            evaluator: ExprEvaluator::new(node, exec)?,
            ctx: RowContext::root(),
            results: None,
        }),
        PhysicalOperator::Window {
            relation,
            functions,
        } => Box::new(Window {
            input: input(node, exec)?,
            functions: functions.clone(),
            keys: (0..functions.len())
                .map(|i| ColumnRef::new(relation.clone(), format!("w{}", i)).key())
                .collect(),
            evaluator: ExprEvaluator::new(node, exec)?,
            ctx: RowContext::root(),
            results: None,
        }),
        PhysicalOperator::Join { .. } => build_join(node, exec)?,
    };
    Ok(operator)
}

/// Operator of the node's only input.
fn input(node: &PhysicalPlanNode, exec: &Arc<ExecutionContext>) -> ExecuteResult<Box<dyn Operator>> {
    let child = node.children.first().ok_or_else(|| {
        ExecuteError::Internal(format!("{:?} node has no input", node.operator))
    })?;
    build_operator(child, exec)
}

/// Row keys of the selected table columns with their storage positions.
fn column_positions(
    table: &TableStore,
    relation: &str,
    columns: &[String],
) -> ExecuteResult<Vec<(String, usize)>> {
    columns
        .iter()
        .map(|c| {
            let position = table.schema().column_position(c).ok_or_else(|| {
                ExecuteError::ColumnNotFound(format!("{}.{}", table.schema().name, c))
            })?;
            Ok((ColumnRef::new(relation, c.clone()).key(), position))
        })
        .collect()
}

fn table_row(table: &TableStore, id: RowId, columns: &[(String, usize)]) -> ExecuteResult<Row> {
    let values = table.row(id).ok_or_else(|| {
        ExecuteError::Internal(format!("row {} missing from {}", id, table.schema().name))
    })?;
    Ok(columns
        .iter()
        .map(|(key, pos)| (key.clone(), values.get(*pos).cloned().unwrap_or(Value::Null)))
        .collect())
}

/// Scan operator - reads all rows of a table in insertion order.
pub struct TableScan {
    table: Arc<TableStore>,
    columns: Vec<(String, usize)>,
    position: usize,
    current: Option<RowId>,
}

impl Operator for TableScan {
    fn rewind(&mut self, _ctx: &RowContext) -> ExecuteResult<()> {
        self.position = 0;
        self.current = None;
        Ok(())
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.position >= self.table.len() {
            return Ok(None);
        }
        let id = self.position;
        self.position += 1;
        self.current = Some(id);
        table_row(&self.table, id, &self.columns).map(Some)
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.current
    }
}

/// Reads a table through one of its indexes.
pub struct IndexedTableAccess {
    exec: Arc<ExecutionContext>,
    table: Arc<TableStore>,
    index: String,
    access: IndexAccess,
    columns: Vec<(String, usize)>,
    evaluator: ExprEvaluator,
    ids: Vec<RowId>,
    position: usize,
    current: Option<RowId>,
}

impl Operator for IndexedTableAccess {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        let empty = Row::new();
        self.ids = match &self.access {
            IndexAccess::Scan => self.table.scan_index(&self.index)?,
            IndexAccess::Point(keys) | IndexAccess::Probe(keys) => {
                let prefix = self.evaluator.evaluate_all(keys, &empty, ctx)?;
                self.exec.record_probe();
                self.table.lookup(&self.index, &prefix)?
            }
            IndexAccess::Concat(keys) => {
                let mut seen = HashSet::new();
                let mut ids = Vec::new();
                for key in keys {
                    let value = self.evaluator.evaluate(key, &empty, ctx)?;
                    self.exec.record_probe();
                    for id in self.table.lookup(&self.index, &[value])? {
                        if seen.insert(id) {
                            ids.push(id);
                        }
                    }
                }
                ids
            }
        };
        self.position = 0;
        self.current = None;
        Ok(())
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        let Some(&id) = self.ids.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        self.current = Some(id);
        table_row(&self.table, id, &self.columns).map(Some)
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.current
    }
}

/// Produces a single empty row, for SELECTs without FROM.
pub struct OneRow {
    done: bool,
}

impl Operator for OneRow {
    fn rewind(&mut self, _ctx: &RowContext) -> ExecuteResult<()> {
        self.done = false;
        Ok(())
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(Row::new()))
    }
}

/// Filter operator - keeps rows whose predicate is true.
pub struct Filter {
    input: Box<dyn Operator>,
    predicate: ScalarExpr,
    evaluator: ExprEvaluator,
    ctx: RowContext,
}

impl Operator for Filter {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.ctx = ctx.clone();
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        while let Some(row) = self.input.next_row()? {
            if self.evaluator.is_true(&self.predicate, &row, &self.ctx)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.input.current_row_id()
    }
}

/// Project operator - computes the output columns.
pub struct Project {
    input: Box<dyn Operator>,
    items: Vec<ProjectItem>,
    evaluator: ExprEvaluator,
    ctx: RowContext,
}

impl Operator for Project {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.ctx = ctx.clone();
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        let Some(row) = self.input.next_row()? else {
            return Ok(None);
        };
        let mut projected = Row::new();
        for item in &self.items {
            let value = self.evaluator.evaluate(&item.expr, &row, &self.ctx)?;
            projected.insert(item.output.key(), value);
        }
        Ok(Some(projected))
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.input.current_row_id()
    }
}

/// Renames a derived table's columns into its parent scope.
pub struct SubqueryAlias {
    input: Box<dyn Operator>,
    columns: Vec<(String, String)>,
}

impl Operator for SubqueryAlias {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        let Some(row) = self.input.next_row()? else {
            return Ok(None);
        };
        Ok(Some(
            self.columns
                .iter()
                .map(|(inner, outer)| (outer.clone(), row.get(inner).cloned().unwrap_or(Value::Null)))
                .collect(),
        ))
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.input.current_row_id()
    }
}

/// Materializes its input on first use and replays it on every rewind.
pub struct CachedResults {
    input: Box<dyn Operator>,
    exec: Arc<ExecutionContext>,
    ctx: RowContext,
    cache: Option<CachedRows>,
    position: usize,
}

impl Operator for CachedResults {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        if self.cache.is_none() {
            self.ctx = ctx.clone();
        }
        self.position = 0;
        Ok(())
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.cache.is_none() {
            self.input.rewind(&self.ctx)?;
            let mut rows = Vec::new();
            while let Some(row) = self.input.next_row()? {
                rows.push(row);
            }
            self.cache = Some(self.exec.cache(rows));
        }
        let row = self
            .cache
            .as_ref()
            .and_then(|cache| cache.rows().get(self.position).cloned());
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }
}

/// Removes duplicate rows.
pub struct Distinct {
    input: Box<dyn Operator>,
    seen: HashSet<IndexKey>,
}

impl Operator for Distinct {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.seen.clear();
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        while let Some(row) = self.input.next_row()? {
            if self.seen.insert(IndexKey::new(row.values().cloned().collect())) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Sort operator - orders rows, keeping input order among equal keys.
pub struct Sort {
    input: Box<dyn Operator>,
    order: Vec<SortKey>,
    evaluator: ExprEvaluator,
    ctx: RowContext,
    sorted: Option<std::vec::IntoIter<Row>>,
}

impl Sort {
    fn materialize(&mut self) -> ExecuteResult<Vec<Row>> {
        let exprs: Vec<ScalarExpr> = self.order.iter().map(|k| k.expr.clone()).collect();
        let mut keyed = Vec::new();
        while let Some(row) = self.input.next_row()? {
            let key = self.evaluator.evaluate_all(&exprs, &row, &self.ctx)?;
            keyed.push((key, row));
        }
        let order = &self.order;
        keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, order));
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

fn compare_keys(a: &[Value], b: &[Value], order: &[SortKey]) -> Ordering {
    for ((x, y), key) in a.iter().zip(b).zip(order) {
        let ord = compare_total(x, y);
        if ord != Ordering::Equal {
            return if key.ascending { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

impl Operator for Sort {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.ctx = ctx.clone();
        self.sorted = None;
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.sorted.is_none() {
            self.sorted = Some(self.materialize()?.into_iter());
        }
        Ok(self.sorted.as_mut().and_then(Iterator::next))
    }
}

/// Limit operator - skips `offset` rows, then returns at most `limit`.
pub struct Limit {
    input: Box<dyn Operator>,
    limit: Option<usize>,
    offset: usize,
    emitted: usize,
    skipped: usize,
}

impl Operator for Limit {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.emitted = 0;
        self.skipped = 0;
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.limit.is_some_and(|n| self.emitted >= n) {
            return Ok(None);
        }
        while self.skipped < self.offset {
            if self.input.next_row()?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }
        let row = self.input.next_row()?;
        if row.is_some() {
            self.emitted += 1;
        }
        Ok(row)
    }

    fn current_row_id(&self) -> Option<RowId> {
        self.input.current_row_id()
    }
}

/// Running state of one aggregate call within a group.
#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
    AnyValue(Option<Value>),
}

impl Accumulator {
    fn new(func: AggregateFunction) -> Self {
        match func {
            AggregateFunction::Count | AggregateFunction::CountStar => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum(None),
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
            AggregateFunction::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateFunction::AnyValue => Accumulator::AnyValue(None),
        }
    }

    /// `value` is `None` for `count(*)`.
    fn update(&mut self, value: Option<Value>) -> ExecuteResult<()> {
        let Some(value) = value else {
            if let Accumulator::Count(n) = self {
                *n += 1;
            }
            return Ok(());
        };
        if let Accumulator::AnyValue(slot) = self {
            slot.get_or_insert(value);
            return Ok(());
        }
        // Every other aggregate skips NULLs.
        if value.is_null() {
            return Ok(());
        }
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(total) => {
                let next = match total.as_ref() {
                    Some(t) => add_values(t, &value)?,
                    None => add_values(&Value::from(0), &value)?,
                };
                *total = Some(next);
            }
            Accumulator::Min(best) => {
                if best.as_ref().map_or(true, |b| compare_total(&value, b) == Ordering::Less) {
                    *best = Some(value);
                }
            }
            Accumulator::Max(best) => {
                if best.as_ref().map_or(true, |b| compare_total(&value, b) == Ordering::Greater) {
                    *best = Some(value);
                }
            }
            Accumulator::Avg { sum, count } => {
                *sum += to_f64(&value)?;
                *count += 1;
            }
            Accumulator::AnyValue(_) => {}
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::from(n),
            Accumulator::Sum(v)
            | Accumulator::Min(v)
            | Accumulator::Max(v)
            | Accumulator::AnyValue(v) => v.unwrap_or(Value::Null),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { sum, count } => float_value(sum / count as f64),
        }
    }
}

/// Hash aggregation. Groups are emitted in key order.
pub struct Aggregate {
    input: Box<dyn Operator>,
    group_by: Vec<ScalarExpr>,
    aggregates: Vec<AggregateCall>,
    group_keys: Vec<String>,
    aggregate_keys: Vec<String>,
    evaluator: ExprEvaluator,
    ctx: RowContext,
    results: Option<std::vec::IntoIter<Row>>,
}

impl Aggregate {
    fn materialize(&mut self) -> ExecuteResult<Vec<Row>> {
        let mut groups: BTreeMap<IndexKey, Vec<Accumulator>> = BTreeMap::new();
        while let Some(row) = self.input.next_row()? {
            let key = IndexKey::new(self.evaluator.evaluate_all(&self.group_by, &row, &self.ctx)?);
            let accumulators = groups.entry(key).or_insert_with(|| {
                self.aggregates.iter().map(|a| Accumulator::new(a.func)).collect()
            });
            for (call, acc) in self.aggregates.iter().zip(accumulators.iter_mut()) {
                let value = match (&call.func, &call.arg) {
                    (AggregateFunction::CountStar, _) | (_, None) => None,
                    (_, Some(arg)) => Some(self.evaluator.evaluate(arg, &row, &self.ctx)?),
                };
                acc.update(value)?;
            }
        }

        // A global aggregate over no rows still yields one row.
        if groups.is_empty() && self.group_by.is_empty() {
            groups.insert(
                IndexKey::new(Vec::new()),
                self.aggregates.iter().map(|a| Accumulator::new(a.func)).collect(),
            );
        }

        Ok(groups
            .into_iter()
            .map(|(key, accumulators)| {
                let mut row: Row = self.group_keys.iter().cloned().zip(key.0).collect();
                row.extend(
                    self.aggregate_keys
                        .iter()
                        .cloned()
                        .zip(accumulators.into_iter().map(Accumulator::finish)),
                );
                row
            })
            .collect())
    }
}

impl Operator for Aggregate {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.ctx = ctx.clone();
        self.results = None;
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.results.is_none() {
            self.results = Some(self.materialize()?.into_iter());
        }
        Ok(self.results.as_mut().and_then(Iterator::next))
    }
}

/// Numbers rows within partitions. Rows keep their input order.
pub struct Window {
    input: Box<dyn Operator>,
    functions: Vec<WindowCall>,
    keys: Vec<String>,
    evaluator: ExprEvaluator,
    ctx: RowContext,
    results: Option<std::vec::IntoIter<Row>>,
}

impl Window {
    fn materialize(&mut self) -> ExecuteResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.input.next_row()? {
            rows.push(row);
        }

        for (call, key) in self.functions.iter().zip(&self.keys) {
            let order_exprs: Vec<ScalarExpr> = call.order_by.iter().map(|k| k.expr.clone()).collect();
            let mut partitions: BTreeMap<IndexKey, Vec<(Vec<Value>, usize)>> = BTreeMap::new();
            for (i, row) in rows.iter().enumerate() {
                let partition = self.evaluator.evaluate_all(&call.partition_by, row, &self.ctx)?;
                let order = self.evaluator.evaluate_all(&order_exprs, row, &self.ctx)?;
                partitions
                    .entry(IndexKey::new(partition))
                    .or_default()
                    .push((order, i));
            }

            let mut numbers = vec![0i64; rows.len()];
            for members in partitions.values_mut() {
                members.sort_by(|(a, _), (b, _)| compare_keys(a, b, &call.order_by));
                for (n, (_, i)) in members.iter().enumerate() {
                    numbers[*i] = n as i64 + 1;
                }
            }
            for (row, n) in rows.iter_mut().zip(numbers) {
                row.insert(key.clone(), Value::from(n));
            }
        }
        Ok(rows)
    }
}

impl Operator for Window {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.ctx = ctx.clone();
        self.results = None;
        self.input.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.results.is_none() {
            self.results = Some(self.materialize()?.into_iter());
        }
        Ok(self.results.as_mut().and_then(Iterator::next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, SchemaBuilder};
    use crate::executor::cache::CacheRegistry;
    use crate::planner::expr::WindowFunction;
    use crate::storage::Storage;
    use crate::sql::BinaryOperator;
    use serde_json::json;

    fn context() -> Arc<ExecutionContext> {
        let schema = SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer)
            .primary_key("x")
            .index("y_idx", ["y"])
            .build()
            .unwrap();
        let mut storage = Storage::new();
        storage.create_table(Arc::new(schema)).unwrap();
        storage
            .insert(
                "xy",
                [(1, 0), (2, 1), (0, 2), (3, 3), (4, 1)]
                    .into_iter()
                    .map(|(x, y)| vec![json!(x), json!(y)])
                    .collect(),
            )
            .unwrap();
        Arc::new(ExecutionContext::new(storage.snapshot(), CacheRegistry::new()))
    }

    fn xy() -> Vec<ColumnRef> {
        vec![ColumnRef::new("xy", "x"), ColumnRef::new("xy", "y")]
    }

    fn scan() -> Arc<PhysicalPlanNode> {
        Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::TableScan {
                    table: "xy".into(),
                    relation: "xy".into(),
                    name: "xy".into(),
                    columns: vec!["x".into(), "y".into()],
                },
                0,
            )
            .with_output(xy()),
        )
    }

    fn index_access(index: &str, access: IndexAccess) -> Arc<PhysicalPlanNode> {
        let exec = context();
        let def = exec
            .storage
            .table("xy")
            .unwrap()
            .schema()
            .all_indexes()
            .into_iter()
            .find(|i| i.name == index)
            .unwrap();
        Arc::new(
            PhysicalPlanNode::new(
                PhysicalOperator::IndexedTableAccess {
                    table: "xy".into(),
                    relation: "xy".into(),
                    name: "xy".into(),
                    columns: vec!["x".into(), "y".into()],
                    index: def,
                    access,
                },
                0,
            )
            .with_output(xy()),
        )
    }

    fn over(operator: PhysicalOperator, input: Arc<PhysicalPlanNode>, output: Vec<ColumnRef>) -> Arc<PhysicalPlanNode> {
        Arc::new(PhysicalPlanNode::new(operator, 0).with_child(input).with_output(output))
    }

    fn drain(node: &Arc<PhysicalPlanNode>, exec: &Arc<ExecutionContext>, ctx: &RowContext) -> Vec<Row> {
        let mut op = build_operator(node, exec).unwrap();
        op.rewind(ctx).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = op.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    fn column(rows: &[Row], key: &str) -> Vec<Value> {
        rows.iter().map(|r| r[key].clone()).collect()
    }

    #[test]
    fn test_scan_and_filter() {
        let exec = context();
        let filter = over(
            PhysicalOperator::Filter {
                predicate: ScalarExpr::binary(
                    ScalarExpr::column("xy", "y"),
                    BinaryOperator::Eq,
                    ScalarExpr::column("uv", "u"),
                ),
            },
            scan(),
            xy(),
        );
        let ctx = RowContext::root().child(1, &Row::from([("uv.u".to_string(), json!(1))]));
        let rows = drain(&filter, &exec, &ctx);
        assert_eq!(column(&rows, "xy.x"), vec![json!(2), json!(4)]);
    }

    #[test]
    fn test_index_access_modes() {
        let exec = context();
        let rows = drain(&index_access("PRIMARY", IndexAccess::Scan), &exec, &RowContext::root());
        assert_eq!(column(&rows, "xy.x"), vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(exec.index_probes(), 0);

        let probe = index_access("y_idx", IndexAccess::Probe(vec![ScalarExpr::column("uv", "u")]));
        let ctx = RowContext::root().child(0, &Row::from([("uv.u".to_string(), json!(1))]));
        let rows = drain(&probe, &exec, &ctx);
        assert_eq!(column(&rows, "xy.x"), vec![json!(2), json!(4)]);
        assert_eq!(exec.index_probes(), 1);

        let concat = index_access(
            "y_idx",
            IndexAccess::Concat(vec![
                ScalarExpr::literal(json!(1)),
                ScalarExpr::literal(json!(3)),
                ScalarExpr::literal(json!(1)),
            ]),
        );
        let rows = drain(&concat, &exec, &RowContext::root());
        assert_eq!(column(&rows, "xy.x"), vec![json!(2), json!(4), json!(3)]);
        assert_eq!(exec.index_probes(), 4);
    }

    #[test]
    fn test_sort_limit_distinct() {
        let exec = context();
        let sort = over(
            PhysicalOperator::Sort {
                order: vec![
                    SortKey {
                        expr: ScalarExpr::column("xy", "y"),
                        ascending: false,
                    },
                    SortKey {
                        expr: ScalarExpr::column("xy", "x"),
                        ascending: true,
                    },
                ],
            },
            scan(),
            xy(),
        );
        let limit = over(
            PhysicalOperator::Limit {
                limit: Some(3),
                offset: 1,
            },
            sort,
            xy(),
        );
        let rows = drain(&limit, &exec, &RowContext::root());
        assert_eq!(column(&rows, "xy.x"), vec![json!(0), json!(2), json!(4)]);

        let y_only = over(
            PhysicalOperator::Project {
                items: vec![ProjectItem {
                    expr: ScalarExpr::column("xy", "y"),
                    output: ColumnRef::new("$out0", "y"),
                    name: "y".into(),
                }],
            },
            scan(),
            vec![ColumnRef::new("$out0", "y")],
        );
        let distinct = over(PhysicalOperator::Distinct, y_only, vec![ColumnRef::new("$out0", "y")]);
        let rows = drain(&distinct, &exec, &RowContext::root());
        assert_eq!(column(&rows, "$out0.y"), vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_aggregate_groups_and_empty_input() {
        let exec = context();
        let aggregates = vec![
            AggregateCall {
                func: AggregateFunction::CountStar,
                arg: None,
            },
            AggregateCall {
                func: AggregateFunction::Sum,
                arg: Some(ScalarExpr::column("xy", "x")),
            },
            AggregateCall {
                func: AggregateFunction::Avg,
                arg: Some(ScalarExpr::column("xy", "x")),
            },
        ];
        let grouped = over(
            PhysicalOperator::Aggregate {
                relation: "agg0".into(),
                group_by: vec![ScalarExpr::column("xy", "y")],
                aggregates: aggregates.clone(),
            },
            scan(),
            Vec::new(),
        );
        let rows = drain(&grouped, &exec, &RowContext::root());
        assert_eq!(column(&rows, "agg0.g0"), vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(column(&rows, "agg0.a0"), vec![json!(1), json!(2), json!(1), json!(1)]);
        assert_eq!(rows[1]["agg0.a1"], json!(6));
        assert_eq!(rows[1]["agg0.a2"], json!(3.0));

        let nothing = over(
            PhysicalOperator::Filter {
                predicate: ScalarExpr::literal(json!(false)),
            },
            scan(),
            xy(),
        );
        let global = over(
            PhysicalOperator::Aggregate {
                relation: "agg0".into(),
                group_by: Vec::new(),
                aggregates,
            },
            nothing,
            Vec::new(),
        );
        let rows = drain(&global, &exec, &RowContext::root());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["agg0.a0"], json!(0));
        assert_eq!(rows[0]["agg0.a1"], json!(null));
        assert_eq!(rows[0]["agg0.a2"], json!(null));
    }

    #[test]
    fn test_row_number_per_partition() {
        let exec = context();
        let window = over(
            PhysicalOperator::Window {
                relation: "win0".into(),
                functions: vec![WindowCall {
                    func: WindowFunction::RowNumber,
                    partition_by: vec![ScalarExpr::column("xy", "y")],
                    order_by: vec![SortKey {
                        expr: ScalarExpr::column("xy", "x"),
                        ascending: false,
                    }],
                }],
            },
            scan(),
            Vec::new(),
        );
        let rows = drain(&window, &exec, &RowContext::root());
        // Input order is kept: (1,0) (2,1) (0,2) (3,3) (4,1).
        assert_eq!(
            column(&rows, "win0.w0"),
            vec![json!(1), json!(2), json!(1), json!(1), json!(1)]
        );
    }

    #[test]
    fn test_cached_results_materialize_once() {
        let exec = context();
        let cached = over(PhysicalOperator::CachedResults, scan(), xy());
        let mut op = build_operator(&cached, &exec).unwrap();
        for _ in 0..3 {
            op.rewind(&RowContext::root()).unwrap();
            let mut n = 0;
            while op.next_row().unwrap().is_some() {
                n += 1;
            }
            assert_eq!(n, 5);
        }
        assert_eq!(exec.caches.live_count(), 1);
        assert_eq!(exec.caches_created(), 1);
        drop(op);
        assert_eq!(exec.caches.live_count(), 0);
    }
}
