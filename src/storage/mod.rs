//! In-memory row storage.
//!
//! Tables are held as `Arc<TableStore>`. Writers clone-on-write, so a
//! [`StorageSnapshot`] taken before a query keeps reading the rows it saw even
//! if inserts happen concurrently.

mod error;
mod key;
mod table;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use key::{compare_slices, compare_total, IndexKey};
pub use table::{RowId, TableStore};

use crate::catalog::{IndexDef, TableSchema};

/// All table stores of a database.
#[derive(Debug, Default)]
pub struct Storage {
    tables: HashMap<String, Arc<TableStore>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store for a table.
    pub fn create_table(&mut self, schema: Arc<TableSchema>) -> StorageResult<()> {
        if self.tables.contains_key(&schema.name) {
            return Err(StorageError::TableAlreadyExists(schema.name.clone()));
        }
        let store = TableStore::new(schema)?;
        self.tables
            .insert(store.schema().name.clone(), Arc::new(store));
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> StorageResult<()> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> StorageResult<&mut TableStore> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    /// Insert positional rows; returns the table's new row count.
    pub fn insert(&mut self, table: &str, rows: Vec<Vec<Value>>) -> StorageResult<usize> {
        let store = self.table_mut(table)?;
        for row in rows {
            store.insert(row)?;
        }
        Ok(store.len())
    }

    /// Build an index over a table's existing rows.
    pub fn add_index(&mut self, schema: Arc<TableSchema>, def: IndexDef) -> StorageResult<()> {
        let store = self.table_mut(&def.table)?;
        store.add_index(schema, def)
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableStore>> {
        self.tables.get(name).cloned()
    }

    /// Capture the current version of every table.
    pub fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            tables: self.tables.clone(),
        }
    }
}

/// Immutable view of the stored tables for one execution.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    tables: HashMap<String, Arc<TableStore>>,
}

impl StorageSnapshot {
    pub fn table(&self, name: &str) -> StorageResult<&Arc<TableStore>> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, SchemaBuilder};
    use serde_json::json;

    #[test]
    fn test_snapshot_isolated_from_later_inserts() {
        let schema = SchemaBuilder::new("uv")
            .add_column("u", DataType::Integer)
            .add_column("v", DataType::Integer)
            .primary_key("u")
            .build()
            .unwrap();
        let mut storage = Storage::new();
        storage.create_table(Arc::new(schema)).unwrap();
        storage.insert("uv", vec![vec![json!(0), json!(1)]]).unwrap();

        let snapshot = storage.snapshot();
        assert_eq!(storage.insert("uv", vec![vec![json!(1), json!(1)]]).unwrap(), 2);

        assert_eq!(snapshot.table("uv").unwrap().len(), 1);
        assert_eq!(storage.table("uv").unwrap().len(), 2);
        assert!(snapshot.table("xy").is_err());
    }
}
