//! Query result types.

use serde_json::Value;
use ulid::Ulid;

use crate::storage::compare_slices;

/// Rows returned by a SELECT, positional in `columns` order.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Column names in order. Names may repeat (`select * from xy a, xy b`).
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create a new empty result set.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Add a row.
    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a row by index.
    pub fn get(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<Value>> {
        self.rows.iter()
    }

    /// Rows in the total value order, for comparisons that ignore row order.
    pub fn sorted_rows(&self) -> Vec<Vec<Value>> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| compare_slices(a, b));
        rows
    }
}

impl IntoIterator for ResultSet {
    type Item = Vec<Value>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Counters collected during one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStats {
    pub execution_id: Ulid,
    /// Index lookups issued by point, probe and concat accesses.
    pub index_probes: u64,
    /// Cached result sets materialized.
    pub caches_created: u64,
    pub rows_returned: usize,
}
