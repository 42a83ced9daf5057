//! Table schema definitions and validation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ColumnDef, DataType, IndexDef};

/// Table schema definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column definitions, in storage order.
    pub columns: Vec<ColumnDef>,
    /// Primary key columns. Empty for keyless tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    /// Secondary indexes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl TableSchema {
    /// Create a new keyless table schema.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            indexes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Get a column definition by name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column in storage order.
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The primary key index, if the table has a primary key.
    pub fn primary_index(&self) -> Option<IndexDef> {
        if self.primary_key.is_empty() {
            None
        } else {
            Some(IndexDef::primary(&self.name, self.primary_key.clone()))
        }
    }

    /// All indexes: the primary key index first, then secondary indexes.
    pub fn all_indexes(&self) -> Vec<IndexDef> {
        self.primary_index()
            .into_iter()
            .chain(self.indexes.iter().cloned())
            .collect()
    }

    /// Add a secondary index.
    pub fn add_index(&mut self, index: IndexDef) -> Result<(), SchemaError> {
        if self.indexes.iter().any(|i| i.name == index.name) || index.primary {
            return Err(SchemaError::DuplicateIndex(index.name));
        }
        for column in &index.columns {
            if self.get_column(column).is_none() {
                return Err(SchemaError::ColumnNotFound(column.clone()));
            }
        }
        self.indexes.push(index);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Validate the schema itself.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(&col.name) {
                return Err(SchemaError::DuplicateColumn(col.name.clone()));
            }
        }

        for pk in &self.primary_key {
            if self.get_column(pk).is_none() {
                return Err(SchemaError::InvalidPrimaryKey(pk.clone()));
            }
        }

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            if !index_names.insert(&index.name) {
                return Err(SchemaError::DuplicateIndex(index.name.clone()));
            }
            if index.columns.is_empty() {
                return Err(SchemaError::InvalidIndex(index.name.clone()));
            }
            for column in &index.columns {
                if self.get_column(column).is_none() {
                    return Err(SchemaError::ColumnNotFound(column.clone()));
                }
            }
        }

        Ok(())
    }

    /// Validate a positional row against this schema.
    pub fn validate_row(&self, row: &[Value]) -> Result<(), SchemaError> {
        if row.len() != self.columns.len() {
            return Err(SchemaError::InvalidRow(format!(
                "table '{}' has {} columns, row has {} values",
                self.name,
                self.columns.len(),
                row.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(row) {
            col.validate(value).map_err(SchemaError::InvalidRow)?;
        }
        for pk in &self.primary_key {
            if let Some(pos) = self.column_position(pk) {
                if row[pos].is_null() {
                    return Err(SchemaError::InvalidRow(format!(
                        "primary key column '{}' cannot be null",
                        pk
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Schema-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("duplicate index: {0}")]
    DuplicateIndex(String),

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("invalid primary key reference: {0}")]
    InvalidPrimaryKey(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),
}

/// Builder for creating table schemas.
pub struct SchemaBuilder {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indexes: Vec<IndexDef>,
}

impl SchemaBuilder {
    /// Start building a new schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a simple nullable column with just name and type.
    pub fn add_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type));
        self
    }

    /// Set a single-column primary key.
    pub fn primary_key(self, column_name: impl Into<String>) -> Self {
        self.composite_primary_key([column_name.into()])
    }

    /// Set a multi-column primary key.
    pub fn composite_primary_key(
        mut self,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a non-unique secondary index.
    pub fn index(
        mut self,
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let index = IndexDef::new(self.name.clone(), name, columns);
        self.indexes.push(index);
        self
    }

    /// Add a unique secondary index.
    pub fn unique_index(
        mut self,
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let index = IndexDef::new(self.name.clone(), name, columns).unique();
        self.indexes.push(index);
        self
    }

    /// Build the schema.
    pub fn build(self) -> Result<TableSchema, SchemaError> {
        let mut schema = TableSchema::new(self.name, self.columns);
        for pk in &self.primary_key {
            if let Some(col) = schema.columns.iter_mut().find(|c| &c.name == pk) {
                col.nullable = false;
            }
        }
        schema.primary_key = self.primary_key;
        schema.indexes = self.indexes;
        schema.validate()?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> TableSchema {
        SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer)
            .primary_key("x")
            .index("y_idx", ["y"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_schema_validation() {
        let schema = sample_schema();
        assert!(schema.validate().is_ok());
        assert_eq!(schema.primary_key, vec!["x".to_string()]);
        assert!(!schema.get_column("x").unwrap().nullable);
    }

    #[test]
    fn test_all_indexes_primary_first() {
        let schema = sample_schema();
        let indexes = schema.all_indexes();
        assert_eq!(indexes.len(), 2);
        assert!(indexes[0].primary);
        assert_eq!(indexes[1].name, "y_idx");
    }

    #[test]
    fn test_schema_duplicate_column() {
        let result = SchemaBuilder::new("bad")
            .add_column("a", DataType::Text)
            .add_column("a", DataType::Integer)
            .build();
        assert!(matches!(result, Err(SchemaError::DuplicateColumn(_))));
    }

    #[test]
    fn test_index_on_missing_column() {
        let result = SchemaBuilder::new("bad")
            .add_column("a", DataType::Integer)
            .index("b_idx", ["b"])
            .build();
        assert!(matches!(result, Err(SchemaError::ColumnNotFound(_))));
    }

    #[test]
    fn test_row_validation() {
        let schema = sample_schema();
        assert!(schema.validate_row(&[json!(1), json!(null)]).is_ok());
        assert!(schema.validate_row(&[json!(null), json!(1)]).is_err());
        assert!(schema.validate_row(&[json!(1)]).is_err());
        assert!(schema.validate_row(&[json!("1"), json!(1)]).is_err());
    }

    #[test]
    fn test_schema_serialization() {
        let schema = sample_schema();
        let json = serde_json::to_string_pretty(&schema).unwrap();
        let deserialized: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema.name, deserialized.name);
        assert_eq!(schema.indexes, deserialized.indexes);
        assert_eq!(schema.primary_key, deserialized.primary_key);
    }
}
