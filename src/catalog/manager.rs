//! Catalog manager: schemas, indexes and statistics behind a shared lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::schema::{SchemaError, TableSchema};
use super::stats::{
    IndexRegistry, SchemaProvider, StatisticsProvider, TableStatistics,
};
use super::types::IndexDef;

#[derive(Debug, Default)]
struct CatalogState {
    tables: BTreeMap<String, Arc<TableSchema>>,
    statistics: BTreeMap<String, TableStatistics>,
}

/// The catalog manages table schemas and their statistics.
///
/// Cloning a catalog yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    state: Arc<RwLock<CatalogState>>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new table schema.
    pub fn create_table(&self, schema: TableSchema) -> Result<(), SchemaError> {
        schema.validate()?;

        let mut state = self.state.write();
        if state.tables.contains_key(&schema.name) {
            return Err(SchemaError::TableExists(schema.name.clone()));
        }
        debug!(table = %schema.name, columns = schema.columns.len(), "created table");
        state.tables.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Get a table schema by name.
    pub fn get_table(&self, name: &str) -> Result<Arc<TableSchema>, SchemaError> {
        self.state
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::TableNotFound(name.to_string()))
    }

    /// Check if a table exists.
    pub fn table_exists(&self, name: &str) -> bool {
        self.state.read().tables.contains_key(name)
    }

    /// Drop a table and its statistics.
    pub fn drop_table(&self, name: &str) -> Result<(), SchemaError> {
        let mut state = self.state.write();
        if state.tables.remove(name).is_none() {
            return Err(SchemaError::TableNotFound(name.to_string()));
        }
        state.statistics.remove(name);
        Ok(())
    }

    /// List all table names.
    pub fn list_tables(&self) -> Vec<String> {
        self.state.read().tables.keys().cloned().collect()
    }

    /// Add a secondary index to an existing table.
    pub fn create_index(&self, index: IndexDef) -> Result<Arc<TableSchema>, SchemaError> {
        let mut state = self.state.write();
        let current = state
            .tables
            .get(&index.table)
            .ok_or_else(|| SchemaError::TableNotFound(index.table.clone()))?;

        let mut schema = TableSchema::clone(current);
        schema.add_index(index)?;
        let schema = Arc::new(schema);
        state.tables.insert(schema.name.clone(), schema.clone());
        Ok(schema)
    }

    /// Record a freshly counted row total. Overrides take precedence.
    pub fn record_row_count(&self, table: &str, row_count: u64) {
        let mut state = self.state.write();
        state
            .statistics
            .entry(table.to_string())
            .and_modify(|s| s.refresh(row_count))
            .or_insert_with(|| TableStatistics::computed(row_count));
    }

    /// Pin a table's row estimate, ignoring computed counts until cleared.
    pub fn set_row_estimate(&self, table: &str, row_count: u64) -> Result<(), SchemaError> {
        let mut state = self.state.write();
        if !state.tables.contains_key(table) {
            return Err(SchemaError::TableNotFound(table.to_string()));
        }
        debug!(table, row_count, "statistics override");
        state
            .statistics
            .insert(table.to_string(), TableStatistics::overridden(row_count));
        Ok(())
    }

    /// Drop an override; the next recorded count replaces it.
    pub fn clear_row_estimate(&self, table: &str) {
        let mut state = self.state.write();
        if let Some(stats) = state.statistics.get_mut(table) {
            *stats = TableStatistics::computed(stats.row_count);
        }
    }

    /// Current statistics of a table.
    pub fn statistics(&self, table: &str) -> Option<TableStatistics> {
        self.state.read().statistics.get(table).cloned()
    }

    /// Take an immutable view for one planning call.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let state = self.state.read();
        CatalogSnapshot {
            tables: state.tables.clone(),
            statistics: state.statistics.clone(),
        }
    }
}

/// A consistent, read-only copy of the catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    tables: BTreeMap<String, Arc<TableSchema>>,
    statistics: BTreeMap<String, TableStatistics>,
}

impl StatisticsProvider for CatalogSnapshot {
    fn estimate_row_count(&self, table: &str) -> Option<u64> {
        self.statistics.get(table).map(|s| s.row_count)
    }
}

impl IndexRegistry for CatalogSnapshot {
    fn indexes_for(&self, table: &str) -> Vec<IndexDef> {
        self.tables
            .get(table)
            .map(|t| t.all_indexes())
            .unwrap_or_default()
    }
}

impl SchemaProvider for CatalogSnapshot {
    fn table(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(name).cloned()
    }
}
