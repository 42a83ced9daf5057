//! In-memory table stores with ordered secondary indexes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use super::error::{StorageError, StorageResult};
use super::key::IndexKey;
use crate::catalog::{IndexDef, SchemaError, TableSchema};

/// Position of a row inside its table.
pub type RowId = usize;

#[derive(Debug, Clone)]
struct StoredIndex {
    def: IndexDef,
    positions: Vec<usize>,
    entries: BTreeMap<IndexKey, Vec<RowId>>,
}

impl StoredIndex {
    fn build(schema: &TableSchema, def: IndexDef) -> StorageResult<Self> {
        let positions = def
            .columns
            .iter()
            .map(|c| {
                schema
                    .column_position(c)
                    .ok_or_else(|| SchemaError::ColumnNotFound(c.clone()).into())
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Self {
            def,
            positions,
            entries: BTreeMap::new(),
        })
    }

    fn key_of(&self, row: &[Value]) -> IndexKey {
        IndexKey::new(self.positions.iter().map(|&p| row[p].clone()).collect())
    }

    fn check_unique(&self, table: &str, key: &IndexKey) -> StorageResult<()> {
        // NULLs never collide in a unique index.
        if self.def.unique && !key.has_null() && self.entries.contains_key(key) {
            return Err(StorageError::DuplicateKey {
                table: table.to_string(),
                index: self.def.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, key: IndexKey, id: RowId) {
        self.entries.entry(key).or_default().push(id);
    }
}

/// Rows of one table plus its index structures.
#[derive(Debug, Clone)]
pub struct TableStore {
    schema: Arc<TableSchema>,
    rows: Vec<Vec<Value>>,
    indexes: HashMap<String, StoredIndex>,
}

impl TableStore {
    /// Create an empty store with every index of the schema.
    pub fn new(schema: Arc<TableSchema>) -> StorageResult<Self> {
        let mut indexes = HashMap::new();
        for def in schema.all_indexes() {
            let stored = StoredIndex::build(&schema, def)?;
            indexes.insert(stored.def.name.clone(), stored);
        }
        Ok(Self {
            schema,
            rows: Vec::new(),
            indexes,
        })
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row(&self, id: RowId) -> Option<&[Value]> {
        self.rows.get(id).map(Vec::as_slice)
    }

    /// Insert a positional row, maintaining every index.
    pub fn insert(&mut self, row: Vec<Value>) -> StorageResult<RowId> {
        self.schema.validate_row(&row)?;

        let keys: Vec<(String, IndexKey)> = self
            .indexes
            .values()
            .map(|idx| (idx.def.name.clone(), idx.key_of(&row)))
            .collect();
        for (name, key) in &keys {
            if let Some(idx) = self.indexes.get(name) {
                idx.check_unique(&self.schema.name, key)?;
            }
        }

        let id = self.rows.len();
        for (name, key) in keys {
            if let Some(idx) = self.indexes.get_mut(&name) {
                idx.insert(key, id);
            }
        }
        self.rows.push(row);
        Ok(id)
    }

    /// Build a new index over the existing rows.
    pub fn add_index(&mut self, schema: Arc<TableSchema>, def: IndexDef) -> StorageResult<()> {
        let mut stored = StoredIndex::build(&schema, def)?;
        for (id, row) in self.rows.iter().enumerate() {
            let key = stored.key_of(row);
            stored.check_unique(&schema.name, &key)?;
            stored.insert(key, id);
        }
        trace!(table = %schema.name, index = %stored.def.name, "built index");
        self.indexes.insert(stored.def.name.clone(), stored);
        self.schema = schema;
        Ok(())
    }

    fn index(&self, name: &str) -> StorageResult<&StoredIndex> {
        self.indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound {
                table: self.schema.name.clone(),
                index: name.to_string(),
            })
    }

    /// Every row id in index order.
    pub fn scan_index(&self, name: &str) -> StorageResult<Vec<RowId>> {
        let idx = self.index(name)?;
        Ok(idx.entries.values().flatten().copied().collect())
    }

    /// Row ids whose leading index columns equal `prefix`, in index order.
    ///
    /// A NULL in the prefix matches nothing.
    pub fn lookup(&self, name: &str, prefix: &[Value]) -> StorageResult<Vec<RowId>> {
        let idx = self.index(name)?;
        if prefix.len() > idx.def.columns.len() {
            return Err(StorageError::IndexNotFound {
                table: self.schema.name.clone(),
                index: format!("{} (prefix of {} columns)", name, prefix.len()),
            });
        }
        if prefix.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }

        let start = IndexKey::new(prefix.to_vec());
        Ok(idx
            .entries
            .range(start..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, SchemaBuilder};
    use serde_json::json;

    fn store() -> TableStore {
        let schema = SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer)
            .primary_key("x")
            .index("y_idx", ["y"])
            .build()
            .unwrap();
        let mut store = TableStore::new(Arc::new(schema)).unwrap();
        for (x, y) in [(1, 0), (2, 1), (0, 2), (3, 3)] {
            store.insert(vec![json!(x), json!(y)]).unwrap();
        }
        store
    }

    #[test]
    fn test_primary_key_is_unique() {
        let mut store = store();
        let err = store.insert(vec![json!(1), json!(9)]).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { .. }));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_scan_index_order() {
        let store = store();
        let ids = store.scan_index("PRIMARY").unwrap();
        let xs: Vec<Value> = ids.iter().map(|&id| store.rows()[id][0].clone()).collect();
        assert_eq!(xs, vec![json!(0), json!(1), json!(2), json!(3)]);

        let ids = store.scan_index("y_idx").unwrap();
        let ys: Vec<Value> = ids.iter().map(|&id| store.rows()[id][1].clone()).collect();
        assert_eq!(ys, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_lookup() {
        let store = store();
        assert_eq!(store.lookup("y_idx", &[json!(2)]).unwrap(), vec![2]);
        assert!(store.lookup("y_idx", &[json!(7)]).unwrap().is_empty());
        assert!(store.lookup("y_idx", &[json!(null)]).unwrap().is_empty());
        assert!(store.lookup("nope", &[json!(1)]).is_err());
        assert!(store.lookup("y_idx", &[json!(1), json!(2)]).is_err());
    }

    #[test]
    fn test_composite_prefix_lookup() {
        let schema = SchemaBuilder::new("ab")
            .add_column("a", DataType::Integer)
            .add_column("b", DataType::Integer)
            .composite_primary_key(["a", "b"])
            .build()
            .unwrap();
        let mut store = TableStore::new(Arc::new(schema)).unwrap();
        for (a, b) in [(1, 2), (1, 1), (2, 0)] {
            store.insert(vec![json!(a), json!(b)]).unwrap();
        }
        assert_eq!(store.lookup("PRIMARY", &[json!(1)]).unwrap(), vec![1, 0]);
        assert_eq!(store.lookup("PRIMARY", &[json!(1), json!(2)]).unwrap(), vec![0]);
    }

    #[test]
    fn test_add_index_over_existing_rows() {
        let mut store = store();
        let mut schema = TableSchema::clone(store.schema());
        let def = IndexDef::new("xy", "xy_idx", ["x", "y"]);
        schema.add_index(def.clone()).unwrap();
        store.add_index(Arc::new(schema), def).unwrap();
        assert_eq!(store.lookup("xy_idx", &[json!(3)]).unwrap(), vec![3]);
    }
}
