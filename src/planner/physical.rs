//! Physical query plan representation.
//!
//! Physical plans specify *how* the query will actually be executed,
//! including specific algorithms and access methods.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::expr::{AggregateCall, ColumnRef, ScalarExpr, SortKey, WindowCall};
use super::logical::ProjectItem;
use super::scope::ScopeId;
use crate::catalog::IndexDef;

/// Physical join strategies, each fixing both the logical semantics and the
/// algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Nested loop without predicate.
    Cross,
    /// Nested loop, full predicate per pair.
    Inner,
    LeftOuter,
    /// Build a hash table on one side, probe with the other.
    Hash,
    LeftOuterHash,
    /// Probe an index of the right side per left row.
    Lookup,
    LeftOuterLookup,
    /// Advance two index-ordered inputs in key order.
    Merge,
    LeftOuterMerge,
    Semi,
    Anti,
    SemiLookup,
    AntiLookup,
    /// Drive from the right side and probe an index of the left side,
    /// emitting each left row once.
    RightSemiLookup,
}

impl JoinType {
    pub fn is_left_outer(&self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter
                | JoinType::LeftOuterHash
                | JoinType::LeftOuterLookup
                | JoinType::LeftOuterMerge
        )
    }

    /// Only the left side's columns are produced.
    pub fn is_existence(&self) -> bool {
        matches!(
            self,
            JoinType::Semi
                | JoinType::Anti
                | JoinType::SemiLookup
                | JoinType::AntiLookup
                | JoinType::RightSemiLookup
        )
    }

    /// The right side is re-evaluated per left row and may read its columns.
    pub fn right_sees_left(&self) -> bool {
        matches!(
            self,
            JoinType::Cross
                | JoinType::Inner
                | JoinType::LeftOuter
                | JoinType::Lookup
                | JoinType::LeftOuterLookup
                | JoinType::Semi
                | JoinType::Anti
                | JoinType::SemiLookup
                | JoinType::AntiLookup
        )
    }

    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            JoinType::Lookup
                | JoinType::LeftOuterLookup
                | JoinType::SemiLookup
                | JoinType::AntiLookup
                | JoinType::RightSemiLookup
        )
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How an [`PhysicalOperator::IndexedTableAccess`] reads its index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexAccess {
    /// Every row, in index order.
    Scan,
    /// Constant equality on an index prefix.
    Point(Vec<ScalarExpr>),
    /// Equality on an index prefix, keys evaluated against the outer row.
    Probe(Vec<ScalarExpr>),
    /// One single-column probe per key, duplicates removed by row id.
    Concat(Vec<ScalarExpr>),
}

impl IndexAccess {
    pub fn keys(&self) -> &[ScalarExpr] {
        match self {
            IndexAccess::Scan => &[],
            IndexAccess::Point(keys) | IndexAccess::Probe(keys) | IndexAccess::Concat(keys) => keys,
        }
    }
}

/// Which side of a hash join is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    Left,
    Right,
}

/// Physical execution operators.
#[derive(Debug, Clone)]
pub enum PhysicalOperator {
    /// Sequential table scan.
    TableScan {
        table: String,
        relation: String,
        name: String,
        columns: Vec<String>,
    },

    /// Table read through an index.
    IndexedTableAccess {
        table: String,
        relation: String,
        name: String,
        columns: Vec<String>,
        index: IndexDef,
        access: IndexAccess,
    },

    OneRow,

    Filter { predicate: ScalarExpr },

    Project { items: Vec<ProjectItem> },

    Join {
        join_type: JoinType,
        /// Equality key pairs, left expression first.
        keys: Vec<(ScalarExpr, ScalarExpr)>,
        /// Conjuncts checked per candidate pair after a key match.
        residual: Option<ScalarExpr>,
        build: BuildSide,
        scalar_guard: bool,
    },

    SubqueryAlias {
        relation: String,
        name: String,
        columns: Vec<(ColumnRef, ColumnRef)>,
    },

    /// Materialize the child once per execution.
    CachedResults,

    Distinct,

    Sort { order: Vec<SortKey> },

    Limit { limit: Option<usize>, offset: usize },

    Aggregate {
        relation: String,
        group_by: Vec<ScalarExpr>,
        aggregates: Vec<AggregateCall>,
    },

    Window {
        relation: String,
        functions: Vec<WindowCall>,
    },
}

impl PhysicalOperator {
    /// Expressions held directly by the operator.
    pub fn expressions(&self) -> Vec<&ScalarExpr> {
        match self {
            PhysicalOperator::IndexedTableAccess { access, .. } => access.keys().iter().collect(),
            PhysicalOperator::Filter { predicate } => vec![predicate],
            PhysicalOperator::Project { items } => items.iter().map(|i| &i.expr).collect(),
            PhysicalOperator::Join { keys, residual, .. } => keys
                .iter()
                .flat_map(|(l, r)| [l, r])
                .chain(residual.iter())
                .collect(),
            PhysicalOperator::Sort { order } => order.iter().map(|k| &k.expr).collect(),
            PhysicalOperator::Aggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .chain(aggregates.iter().filter_map(|a| a.arg.as_ref()))
                .collect(),
            PhysicalOperator::Window { functions, .. } => functions
                .iter()
                .flat_map(|w| w.partition_by.iter().chain(w.order_by.iter().map(|k| &k.expr)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Relation name of a join-tree leaf.
    pub fn relation_name(&self) -> Option<&str> {
        match self {
            PhysicalOperator::TableScan { name, .. }
            | PhysicalOperator::IndexedTableAccess { name, .. }
            | PhysicalOperator::SubqueryAlias { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A physical plan node.
#[derive(Debug, Clone)]
pub struct PhysicalPlanNode {
    pub operator: PhysicalOperator,
    pub children: Vec<Arc<PhysicalPlanNode>>,
    pub estimated_cost: f64,
    pub estimated_rows: usize,
    /// Columns of the rows this node yields.
    pub output: Vec<ColumnRef>,
    pub scope: ScopeId,
}

impl PhysicalPlanNode {
    /// Create a new physical plan node.
    pub fn new(operator: PhysicalOperator, scope: ScopeId) -> Self {
        Self {
            operator,
            children: Vec::new(),
            estimated_cost: 0.0,
            estimated_rows: 0,
            output: Vec::new(),
            scope,
        }
    }

    /// Add a child node.
    pub fn with_child(mut self, child: Arc<PhysicalPlanNode>) -> Self {
        self.children.push(child);
        self
    }

    /// Add multiple children.
    pub fn with_children(mut self, children: Vec<Arc<PhysicalPlanNode>>) -> Self {
        self.children = children;
        self
    }

    /// Set estimated cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    /// Set estimated rows.
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.estimated_rows = rows;
        self
    }

    pub fn with_output(mut self, output: Vec<ColumnRef>) -> Self {
        self.output = output;
        self
    }

    /// Get the total cost of this plan including children.
    pub fn total_cost(&self) -> f64 {
        let child_cost: f64 = self.children.iter().map(|c| c.total_cost()).sum();
        self.estimated_cost + child_cost
    }

    /// Physical plans of the subquery expressions this node evaluates.
    pub fn subquery_plans(&self) -> Vec<(usize, &Arc<PhysicalPlanNode>)> {
        self.operator
            .expressions()
            .into_iter()
            .flat_map(|e| e.subqueries())
            .filter_map(|s| s.physical.as_ref().map(|p| (s.id, p)))
            .collect()
    }

    /// Relations this subtree reads without producing them.
    pub fn free_relations(&self) -> BTreeSet<String> {
        let mut used = BTreeSet::new();
        let mut produced = BTreeSet::new();
        self.collect_relations(&mut used, &mut produced);
        used.retain(|r| !produced.contains(r));
        used
    }

    fn collect_relations(
        &self,
        used: &mut BTreeSet<String>,
        produced: &mut BTreeSet<String>,
    ) {
        for expr in self.operator.expressions() {
            used.extend(expr.relations());
        }
        produced.extend(self.output.iter().map(|c| c.relation.clone()));
        for child in &self.children {
            child.collect_relations(used, produced);
        }
    }

    pub fn is_correlated(&self) -> bool {
        !self.free_relations().is_empty()
    }

    fn collect_join_types(&self, out: &mut Vec<JoinType>) {
        if let PhysicalOperator::Join { join_type, .. } = &self.operator {
            out.push(*join_type);
        }
        for (_, sub) in self.subquery_plans() {
            sub.collect_join_types(out);
        }
        for child in &self.children {
            child.collect_join_types(out);
        }
    }

    /// Left-to-right relation order of the join tree rooted here.
    pub fn join_order(&self) -> Vec<String> {
        if let Some(name) = self.operator.relation_name() {
            return vec![name.to_string()];
        }
        self.children.iter().flat_map(|c| c.join_order()).collect()
    }

    fn collect_scope_orders(&self, out: &mut BTreeMap<ScopeId, Vec<String>>) {
        let is_region_root = matches!(self.operator, PhysicalOperator::Join { .. })
            || self.operator.relation_name().is_some();
        if is_region_root && !out.contains_key(&self.scope) {
            out.insert(self.scope, self.join_order());
        }
        for (_, sub) in self.subquery_plans() {
            sub.collect_scope_orders(out);
        }
        for child in &self.children {
            child.collect_scope_orders(out);
        }
    }

    fn format_node(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);

        match &self.operator {
            PhysicalOperator::TableScan { table, name, .. } => {
                write!(f, "{}TableScan: {}", pad, table)?;
                if name != table {
                    write!(f, " AS {}", name)?;
                }
            }
            PhysicalOperator::IndexedTableAccess {
                table,
                name,
                index,
                access,
                ..
            } => {
                write!(f, "{}IndexedTableAccess: {}", pad, table)?;
                if name != table {
                    write!(f, " AS {}", name)?;
                }
                write!(f, " using {}", index.name)?;
                match access {
                    IndexAccess::Scan => {}
                    IndexAccess::Point(keys) => write!(f, " point [{}]", join_exprs(keys))?,
                    IndexAccess::Probe(keys) => write!(f, " probe [{}]", join_exprs(keys))?,
                    IndexAccess::Concat(keys) => write!(f, " concat [{}]", join_exprs(keys))?,
                }
            }
            PhysicalOperator::OneRow => write!(f, "{}OneRow", pad)?,
            PhysicalOperator::Filter { predicate } => write!(f, "{}Filter: {}", pad, predicate)?,
            PhysicalOperator::Project { items } => {
                let cols: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
                write!(f, "{}Project: [{}]", pad, cols.join(", "))?;
            }
            PhysicalOperator::Join {
                join_type,
                keys,
                residual,
                build,
                scalar_guard,
            } => {
                write!(f, "{}{}Join", pad, join_type)?;
                if !keys.is_empty() {
                    let pairs: Vec<String> =
                        keys.iter().map(|(l, r)| format!("{} = {}", l, r)).collect();
                    write!(f, " on [{}]", pairs.join(", "))?;
                }
                if let Some(residual) = residual {
                    write!(f, " where {}", residual)?;
                }
                if matches!(join_type, JoinType::Hash) && *build == BuildSide::Left {
                    write!(f, " (build left)")?;
                }
                if *scalar_guard {
                    write!(f, " (scalar)")?;
                }
            }
            PhysicalOperator::SubqueryAlias { name, .. } => {
                write!(f, "{}SubqueryAlias: {}", pad, name)?
            }
            PhysicalOperator::CachedResults => write!(f, "{}CachedResults", pad)?,
            PhysicalOperator::Distinct => write!(f, "{}Distinct", pad)?,
            PhysicalOperator::Sort { order } => {
                let keys: Vec<String> = order.iter().map(|k| k.to_string()).collect();
                write!(f, "{}Sort: {}", pad, keys.join(", "))?;
            }
            PhysicalOperator::Limit { limit, offset } => {
                match limit {
                    Some(n) => write!(f, "{}Limit: {}", pad, n)?,
                    None => write!(f, "{}Limit: ALL", pad)?,
                }
                if *offset > 0 {
                    write!(f, " OFFSET {}", offset)?;
                }
            }
            PhysicalOperator::Aggregate {
                group_by,
                aggregates,
                ..
            } => {
                let aggs: Vec<String> = aggregates.iter().map(|a| a.to_string()).collect();
                write!(
                    f,
                    "{}HashAggregate: group=[{}], aggs=[{}]",
                    pad,
                    join_exprs(group_by),
                    aggs.join(", ")
                )?;
            }
            PhysicalOperator::Window { functions, .. } => {
                let funcs: Vec<String> = functions.iter().map(|w| w.to_string()).collect();
                write!(f, "{}Window: {}", pad, funcs.join(", "))?;
            }
        }

        writeln!(
            f,
            " (rows: {}, cost: {:.2})",
            self.estimated_rows, self.estimated_cost
        )?;

        for (id, sub) in self.subquery_plans() {
            writeln!(f, "{}  Subquery#{}:", pad, id)?;
            sub.format_node(f, indent + 2)?;
        }
        for child in &self.children {
            child.format_node(f, indent + 1)?;
        }
        Ok(())
    }
}

fn join_exprs(exprs: &[ScalarExpr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A complete physical query plan.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    pub root: Arc<PhysicalPlanNode>,
    /// User-facing names of the result columns.
    pub column_names: Vec<String>,
}

impl PhysicalPlan {
    /// Create a new physical plan.
    pub fn new(root: Arc<PhysicalPlanNode>, column_names: Vec<String>) -> Self {
        Self { root, column_names }
    }

    /// Get the total estimated cost.
    pub fn total_cost(&self) -> f64 {
        self.root.total_cost()
    }

    /// Get the estimated output rows.
    pub fn estimated_rows(&self) -> usize {
        self.root.estimated_rows
    }

    /// Every join strategy in the plan, pre-order, including the joins of
    /// subqueries evaluated as expressions.
    pub fn join_types(&self) -> Vec<JoinType> {
        let mut out = Vec::new();
        self.root.collect_join_types(&mut out);
        out
    }

    /// Relation order of the outermost scope.
    pub fn join_order(&self) -> Vec<String> {
        self.scope_orders().remove(&0).unwrap_or_default()
    }

    /// Relation order of every scope that reads at least one relation.
    pub fn scope_orders(&self) -> BTreeMap<ScopeId, Vec<String>> {
        let mut out = BTreeMap::new();
        self.root.collect_scope_orders(&mut out);
        out
    }
}

impl fmt::Display for PhysicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Physical Plan (estimated cost: {:.2}):", self.total_cost())?;
        self.root.format_node(f, 0)
    }
}
