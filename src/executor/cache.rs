//! Materialized result caches.
//!
//! A [`CachedRows`] handle owns one materialized child result for the length
//! of an execution. The handle is registered in a [`CacheRegistry`] when it is
//! acquired and removes itself when dropped, so finished, aborted and
//! LIMIT-truncated executions all leave the registry empty.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;
use ulid::Ulid;

use super::operators::Row;

/// Bookkeeping for one live cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub execution_id: Ulid,
    pub rows: usize,
    pub created_at: DateTime<Utc>,
}

/// Live cache handles, shared by every execution of a database.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    live: Arc<Mutex<HashMap<Ulid, CacheEntry>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register materialized rows and return the handle that owns them.
    pub fn acquire(&self, execution_id: Ulid, rows: Vec<Row>) -> CachedRows {
        let id = Ulid::new();
        let entry = CacheEntry {
            execution_id,
            rows: rows.len(),
            created_at: Utc::now(),
        };
        trace!(cache = %id, execution = %execution_id, rows = entry.rows, "cache acquired");
        self.live.lock().insert(id, entry);
        CachedRows {
            id,
            rows: Arc::new(rows),
            registry: self.clone(),
        }
    }

    /// Number of handles not yet released.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Live handles belonging to one execution.
    pub fn live_for(&self, execution_id: Ulid) -> Vec<CacheEntry> {
        self.live
            .lock()
            .values()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn release(&self, id: Ulid) {
        if let Some(entry) = self.live.lock().remove(&id) {
            let held = Utc::now() - entry.created_at;
            trace!(
                cache = %id,
                execution = %entry.execution_id,
                held_us = held.num_microseconds().unwrap_or(i64::MAX),
                "cache released"
            );
        }
    }
}

/// Rows materialized once per execution. Released on drop.
#[derive(Debug)]
pub struct CachedRows {
    id: Ulid,
    rows: Arc<Vec<Row>>,
    registry: CacheRegistry,
}

impl CachedRows {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Drop for CachedRows {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
