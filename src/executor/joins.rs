//! Join operators.
//!
//! Every [`JoinType`] maps onto one of four algorithms:
//!
//! - nested loop: the right input is rewound per left row with that row in
//!   its context; index lookups are a nested loop over a probing right side,
//! - hash: one side is materialized into a table keyed by the join keys,
//! - merge: two inputs ordered on the keys are advanced together,
//! - right semi lookup: the right input drives probes into the left table.
//!
//! Key comparisons use SQL equality, so NULL keys never match. Conjuncts
//! outside the key set are checked per candidate pair after the key match.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use super::error::{ExecuteError, ExecuteResult};
use super::eval::{sql_eq, ExprEvaluator};
use super::executor::ExecutionContext;
use super::operators::{build_operator, Operator, Row, RowContext};
use crate::planner::{BuildSide, JoinType, PhysicalOperator, PhysicalPlanNode, ScalarExpr, ScopeId};
use crate::storage::{compare_slices, IndexKey, RowId};

/// Build the operator of a join node.
pub fn build_join(
    node: &Arc<PhysicalPlanNode>,
    exec: &Arc<ExecutionContext>,
) -> ExecuteResult<Box<dyn Operator>> {
    let PhysicalOperator::Join {
        join_type,
        keys,
        residual,
        build,
        scalar_guard,
    } = &node.operator
    else {
        return Err(ExecuteError::Internal("join operator over a non-join node".into()));
    };
    let [left_node, right_node] = node.children.as_slice() else {
        return Err(ExecuteError::Internal(format!(
            "{} join with {} inputs",
            join_type,
            node.children.len()
        )));
    };

    let left = build_operator(left_node, exec)?;
    let right = build_operator(right_node, exec)?;
    let right_output: Vec<String> = right_node.output.iter().map(|c| c.key()).collect();
    let core = JoinCore {
        keys: keys.clone(),
        residual: residual.clone(),
        evaluator: ExprEvaluator::new(node, exec)?,
        scope: node.scope,
        ctx: RowContext::root(),
    };

    let operator: Box<dyn Operator> = match join_type {
        JoinType::Hash => Box::new(HashJoin::new(HashMode::Inner(*build), left, right, core, false, right_output)),
        JoinType::LeftOuterHash => {
            Box::new(HashJoin::new(HashMode::LeftOuter, left, right, core, false, right_output))
        }
        JoinType::Merge | JoinType::LeftOuterMerge => Box::new(MergeJoin {
            outer: join_type.is_left_outer(),
            left,
            right,
            core,
            right_output,
            right_rows: None,
            right_pos: 0,
            pending: VecDeque::new(),
        }),
        JoinType::RightSemiLookup => Box::new(RightSemiLookupJoin {
            left,
            right,
            core,
            probing: None,
            emitted: HashSet::new(),
        }),
        // An existence join whose right side does not read the left row
        // checks membership against one hashed copy of the right side.
        JoinType::Semi | JoinType::Anti if !keys.is_empty() && !reads_left(left_node, right_node) => {
            let mode = if *join_type == JoinType::Semi {
                HashMode::Semi
            } else {
                HashMode::Anti
            };
            Box::new(HashJoin::new(mode, left, right, core, *scalar_guard, right_output))
        }
        JoinType::Cross
        | JoinType::Inner
        | JoinType::LeftOuter
        | JoinType::Lookup
        | JoinType::LeftOuterLookup
        | JoinType::Semi
        | JoinType::Anti
        | JoinType::SemiLookup
        | JoinType::AntiLookup => Box::new(NestedLoopJoin {
            join_type: *join_type,
            left,
            right,
            core,
            scalar_guard: *scalar_guard,
            right_output,
            current: None,
            matched: false,
        }),
    };
    Ok(operator)
}

fn reads_left(left: &PhysicalPlanNode, right: &PhysicalPlanNode) -> bool {
    let produced: HashSet<&str> = left.output.iter().map(|c| c.relation.as_str()).collect();
    right
        .free_relations()
        .iter()
        .any(|r| produced.contains(r.as_str()))
}

fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut merged = left.clone();
    merged.extend(right.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn null_extend(left: &Row, right_output: &[String]) -> Row {
    let mut row = left.clone();
    row.extend(right_output.iter().map(|k| (k.clone(), Value::Null)));
    row
}

/// Keys, residual and evaluation state shared by the join algorithms.
struct JoinCore {
    keys: Vec<(ScalarExpr, ScalarExpr)>,
    residual: Option<ScalarExpr>,
    evaluator: ExprEvaluator,
    scope: ScopeId,
    /// Enclosing rows of the join itself.
    ctx: RowContext,
}

impl JoinCore {
    /// Context for a side evaluated under `row`.
    fn child_ctx(&self, row: &Row) -> RowContext {
        self.ctx.child(self.scope, row)
    }

    /// Key equality and residual over a combined row.
    fn matches(&mut self, row: &Row) -> ExecuteResult<bool> {
        for (l, r) in &self.keys {
            let a = self.evaluator.evaluate(l, row, &self.ctx)?;
            let b = self.evaluator.evaluate(r, row, &self.ctx)?;
            if sql_eq(&a, &b) != Some(true) {
                return Ok(false);
            }
        }
        self.residual_holds(row)
    }

    fn residual_holds(&mut self, row: &Row) -> ExecuteResult<bool> {
        match &self.residual {
            Some(predicate) => self.evaluator.is_true(predicate, row, &self.ctx),
            None => Ok(true),
        }
    }

    fn left_key(&mut self, row: &Row) -> ExecuteResult<Vec<Value>> {
        let mut key = Vec::with_capacity(self.keys.len());
        for (l, _) in &self.keys {
            key.push(self.evaluator.evaluate(l, row, &self.ctx)?);
        }
        Ok(key)
    }

    fn right_key(&mut self, row: &Row, ctx: &RowContext) -> ExecuteResult<Vec<Value>> {
        let mut key = Vec::with_capacity(self.keys.len());
        for (_, r) in &self.keys {
            key.push(self.evaluator.evaluate(r, row, ctx)?);
        }
        Ok(key)
    }
}

/// Nested loop join, also used for index lookups: the right input is
/// rewound for every left row.
struct NestedLoopJoin {
    join_type: JoinType,
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    core: JoinCore,
    scalar_guard: bool,
    right_output: Vec<String>,
    current: Option<Row>,
    matched: bool,
}

impl NestedLoopJoin {
    /// Whether the current left row survives a semi or anti join.
    fn keeps(&mut self, left_row: &Row, right_ctx: &RowContext) -> ExecuteResult<bool> {
        let anti = matches!(self.join_type, JoinType::Anti | JoinType::AntiLookup);
        if self.scalar_guard && self.core.left_key(left_row)?.iter().any(Value::is_null) {
            return Ok(false);
        }

        let mut seen_right = false;
        let mut found = false;
        while let Some(right_row) = self.right.next_row()? {
            seen_right = true;
            if self.scalar_guard && self.core.right_key(&right_row, right_ctx)?.iter().any(Value::is_null) {
                // Comparing against NULL is never true.
                return Ok(false);
            }
            if !found && self.core.matches(&merge_rows(left_row, &right_row))? {
                found = true;
                if !self.scalar_guard {
                    break;
                }
            }
        }
        if self.scalar_guard && !seen_right {
            return Ok(false);
        }
        Ok(found != anti)
    }
}

impl Operator for NestedLoopJoin {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.core.ctx = ctx.clone();
        self.current = None;
        self.left.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            let Some(left_row) = self.current.take() else {
                let Some(left_row) = self.left.next_row()? else {
                    return Ok(None);
                };
                let right_ctx = self.core.child_ctx(&left_row);
                self.right.rewind(&right_ctx)?;
                if self.join_type.is_existence() {
                    if self.keeps(&left_row, &right_ctx)? {
                        return Ok(Some(left_row));
                    }
                    continue;
                }
                self.current = Some(left_row);
                self.matched = false;
                continue;
            };

            match self.right.next_row()? {
                Some(right_row) => {
                    let merged = merge_rows(&left_row, &right_row);
                    self.current = Some(left_row);
                    if self.core.matches(&merged)? {
                        self.matched = true;
                        return Ok(Some(merged));
                    }
                }
                None => {
                    if self.join_type.is_left_outer() && !self.matched {
                        return Ok(Some(null_extend(&left_row, &self.right_output)));
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashMode {
    Inner(BuildSide),
    LeftOuter,
    Semi,
    Anti,
}

/// Hash join. The build side is read only once the probe side has produced
/// a row, so an empty probe side never touches the build side.
struct HashJoin {
    mode: HashMode,
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    core: JoinCore,
    scalar_guard: bool,
    right_output: Vec<String>,
    table: Option<HashMap<IndexKey, Vec<Row>>>,
    build_rows: usize,
    build_has_null: bool,
    pending: VecDeque<Row>,
}

impl HashJoin {
    fn new(
        mode: HashMode,
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        core: JoinCore,
        scalar_guard: bool,
        right_output: Vec<String>,
    ) -> Self {
        Self {
            mode,
            left,
            right,
            core,
            scalar_guard,
            right_output,
            table: None,
            build_rows: 0,
            build_has_null: false,
            pending: VecDeque::new(),
        }
    }

    fn builds_left(&self) -> bool {
        self.mode == HashMode::Inner(BuildSide::Left)
    }

    fn build(&mut self) -> ExecuteResult<()> {
        let ctx = self.core.ctx.clone();
        let mut table: HashMap<IndexKey, Vec<Row>> = HashMap::new();
        let mut rows = 0;
        let builds_left = self.builds_left();
        let side = if builds_left { &mut self.left } else { &mut self.right };
        side.rewind(&ctx)?;
        while let Some(row) = side.next_row()? {
            rows += 1;
            let key = if builds_left {
                self.core.left_key(&row)?
            } else {
                self.core.right_key(&row, &ctx)?
            };
            let key = IndexKey::new(key);
            if key.has_null() {
                self.build_has_null = true;
                continue;
            }
            table.entry(key).or_default().push(row);
        }
        trace!(rows, keys = table.len(), build_left = builds_left, "hash table built");
        self.build_rows = rows;
        self.table = Some(table);
        Ok(())
    }

    /// Build-side rows sharing the probe row's key.
    fn candidates(&mut self, probe_row: &Row) -> ExecuteResult<Vec<Row>> {
        let key = if self.builds_left() {
            let ctx = self.core.ctx.clone();
            self.core.right_key(probe_row, &ctx)?
        } else {
            self.core.left_key(probe_row)?
        };
        let key = IndexKey::new(key);
        if key.has_null() {
            return Ok(Vec::new());
        }
        Ok(self
            .table
            .as_ref()
            .and_then(|t| t.get(&key))
            .cloned()
            .unwrap_or_default())
    }
}

impl Operator for HashJoin {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.core.ctx = ctx.clone();
        self.table = None;
        self.build_rows = 0;
        self.build_has_null = false;
        self.pending.clear();
        if self.builds_left() {
            self.right.rewind(ctx)
        } else {
            self.left.rewind(ctx)
        }
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let probe = if self.builds_left() {
                self.right.next_row()?
            } else {
                self.left.next_row()?
            };
            let Some(probe_row) = probe else {
                return Ok(None);
            };
            if self.table.is_none() {
                self.build()?;
            }

            if self.scalar_guard && (self.build_rows == 0 || self.build_has_null) {
                // Every comparison against the scalar result is unknown.
                return Ok(None);
            }
            if self.scalar_guard && self.core.left_key(&probe_row)?.iter().any(Value::is_null) {
                continue;
            }

            let candidates = self.candidates(&probe_row)?;
            match self.mode {
                HashMode::Inner(_) | HashMode::LeftOuter => {
                    for candidate in &candidates {
                        let merged = merge_rows(&probe_row, candidate);
                        if self.core.residual_holds(&merged)? {
                            self.pending.push_back(merged);
                        }
                    }
                    if self.mode == HashMode::LeftOuter && self.pending.is_empty() {
                        return Ok(Some(null_extend(&probe_row, &self.right_output)));
                    }
                }
                HashMode::Semi | HashMode::Anti => {
                    let mut found = false;
                    for candidate in &candidates {
                        if self.core.residual_holds(&merge_rows(&probe_row, candidate))? {
                            found = true;
                            break;
                        }
                    }
                    if found == (self.mode == HashMode::Semi) {
                        return Ok(Some(probe_row));
                    }
                }
            }
        }
    }
}

/// Merge join over two inputs read in key order. The right input is
/// materialized and walked with a cursor that only moves forward.
struct MergeJoin {
    outer: bool,
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    core: JoinCore,
    right_output: Vec<String>,
    right_rows: Option<Vec<(Vec<Value>, Row)>>,
    right_pos: usize,
    pending: VecDeque<Row>,
}

impl MergeJoin {
    fn materialize_right(&mut self) -> ExecuteResult<Vec<(Vec<Value>, Row)>> {
        let ctx = self.core.ctx.clone();
        self.right.rewind(&ctx)?;
        let mut rows = Vec::new();
        while let Some(row) = self.right.next_row()? {
            rows.push((self.core.right_key(&row, &ctx)?, row));
        }
        Ok(rows)
    }
}

impl Operator for MergeJoin {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.core.ctx = ctx.clone();
        self.right_rows = None;
        self.right_pos = 0;
        self.pending.clear();
        self.left.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(left_row) = self.left.next_row()? else {
                return Ok(None);
            };
            if self.right_rows.is_none() {
                self.right_rows = Some(self.materialize_right()?);
            }
            let key = self.core.left_key(&left_row)?;

            let mut matched = false;
            if !key.iter().any(Value::is_null) {
                let right_rows = self.right_rows.as_deref().unwrap_or_default();
                while self.right_pos < right_rows.len()
                    && compare_slices(&right_rows[self.right_pos].0, &key) == Ordering::Less
                {
                    self.right_pos += 1;
                }
                let group = right_rows[self.right_pos..]
                    .iter()
                    .take_while(|(k, _)| compare_slices(k, &key) == Ordering::Equal);
                for (_, right_row) in group {
                    let merged = merge_rows(&left_row, right_row);
                    if self.core.residual_holds(&merged)? {
                        matched = true;
                        self.pending.push_back(merged);
                    }
                }
            }
            if self.outer && !matched {
                return Ok(Some(null_extend(&left_row, &self.right_output)));
            }
        }
    }
}

/// Semi join driven from the right input: each right row probes the left
/// table's index, and every left row is returned at most once.
struct RightSemiLookupJoin {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    core: JoinCore,
    probing: Option<Row>,
    emitted: HashSet<RowId>,
}

impl Operator for RightSemiLookupJoin {
    fn rewind(&mut self, ctx: &RowContext) -> ExecuteResult<()> {
        self.core.ctx = ctx.clone();
        self.probing = None;
        self.emitted.clear();
        self.right.rewind(ctx)
    }

    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            if let Some(right_row) = &self.probing {
                while let Some(left_row) = self.left.next_row()? {
                    let id = self.left.current_row_id();
                    if id.is_some_and(|id| self.emitted.contains(&id)) {
                        continue;
                    }
                    if self.core.matches(&merge_rows(&left_row, right_row))? {
                        if let Some(id) = id {
                            self.emitted.insert(id);
                        }
                        return Ok(Some(left_row));
                    }
                }
                self.probing = None;
            }

            let Some(right_row) = self.right.next_row()? else {
                return Ok(None);
            };
            self.left.rewind(&self.core.child_ctx(&right_row))?;
            self.probing = Some(right_row);
        }
    }
}
