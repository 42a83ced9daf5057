//! Main query executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info_span, warn};
use ulid::Ulid;

use super::cache::{CacheRegistry, CachedRows};
use super::error::ExecuteResult;
use super::operators::{build_operator, Row, RowContext};
use super::result::{ExecutionStats, ResultSet};
use crate::planner::PhysicalPlan;
use crate::storage::StorageSnapshot;

/// State shared by every operator of one execution.
#[derive(Debug)]
pub struct ExecutionContext {
    pub id: Ulid,
    pub storage: StorageSnapshot,
    pub caches: CacheRegistry,
    index_probes: AtomicU64,
    caches_created: AtomicU64,
}

impl ExecutionContext {
    pub fn new(storage: StorageSnapshot, caches: CacheRegistry) -> Self {
        Self {
            id: Ulid::new(),
            storage,
            caches,
            index_probes: AtomicU64::new(0),
            caches_created: AtomicU64::new(0),
        }
    }

    /// Count one index lookup.
    pub fn record_probe(&self) {
        self.index_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn index_probes(&self) -> u64 {
        self.index_probes.load(Ordering::Relaxed)
    }

    pub fn caches_created(&self) -> u64 {
        self.caches_created.load(Ordering::Relaxed)
    }

    /// Register materialized rows for the rest of this execution.
    pub fn cache(&self, rows: Vec<Row>) -> CachedRows {
        self.caches_created.fetch_add(1, Ordering::Relaxed);
        self.caches.acquire(self.id, rows)
    }
}

/// The query executor.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    caches: CacheRegistry,
}

impl QueryExecutor {
    /// Create an executor registering its caches in `caches`.
    pub fn new(caches: CacheRegistry) -> Self {
        Self { caches }
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Run a physical plan to completion against one storage snapshot.
    pub fn execute(
        &self,
        plan: &PhysicalPlan,
        storage: StorageSnapshot,
    ) -> ExecuteResult<(ResultSet, ExecutionStats)> {
        let exec = Arc::new(ExecutionContext::new(storage, self.caches.clone()));
        let _span = info_span!("execute", execution = %exec.id).entered();

        let keys: Vec<String> = plan.root.output.iter().map(|c| c.key()).collect();
        let columns = if plan.column_names.len() == keys.len() {
            plan.column_names.clone()
        } else {
            plan.root.output.iter().map(|c| c.column.clone()).collect()
        };
        let mut result = ResultSet::new(columns);

        {
            // The operator tree owns every cache handle; dropping it at the
            // end of this block releases them, on error paths too.
            let mut root = build_operator(&plan.root, &exec)?;
            root.rewind(&RowContext::root())?;
            while let Some(row) = root.next_row()? {
                result.push(
                    keys.iter()
                        .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }

        let leaked = exec.caches.live_for(exec.id);
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "cached results outlived their execution");
        }

        let stats = ExecutionStats {
            execution_id: exec.id,
            index_probes: exec.index_probes(),
            caches_created: exec.caches_created(),
            rows_returned: result.len(),
        };
        debug!(
            rows = stats.rows_returned,
            index_probes = stats.index_probes,
            caches = stats.caches_created,
            "execution finished"
        );
        Ok((result, stats))
    }
}
