//! Column types, column definitions and index descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column data types understood by the planner and the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 64-bit signed integers.
    Integer,
    /// Double precision floats.
    Float,
    /// UTF-8 text.
    Text,
    /// Booleans.
    Boolean,
}

impl DataType {
    /// Check if a JSON value matches this data type. NULL matches every type.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (DataType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (DataType::Float, Value::Number(_)) => true,
            (DataType::Text, Value::String(_)) => true,
            (DataType::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }

    /// Coerce a value to this type, as `CAST(value AS type)` does.
    ///
    /// Values that cannot be converted become NULL.
    pub fn coerce(&self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (DataType::Integer, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Value::from(i)
                } else {
                    n.as_f64().map(|f| Value::from(f.trunc() as i64)).unwrap_or(Value::Null)
                }
            }
            (DataType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null)
            }
            (DataType::Integer, Value::Bool(b)) => Value::from(*b as i64),
            (DataType::Float, Value::Number(n)) => {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
            (DataType::Float, Value::String(s)) => {
                s.trim().parse::<f64>().map(Value::from).unwrap_or(Value::Null)
            }
            (DataType::Text, Value::String(s)) => Value::String(s.clone()),
            (DataType::Text, other) => Value::String(other.to_string()),
            (DataType::Boolean, Value::Bool(b)) => Value::Bool(*b),
            (DataType::Boolean, Value::Number(n)) => {
                Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))
            }
            _ => Value::Null,
        }
    }

    /// Get the SQL name for this type.
    pub fn sql_name(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Float => "DOUBLE",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_name())
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    /// Create a new nullable column definition.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Validate a value against this column definition.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if value.is_null() && !self.nullable {
            return Err(format!("column '{}' cannot be null", self.name));
        }
        if !self.data_type.matches(value) {
            return Err(format!(
                "column '{}' expects type {}, got {}",
                self.name, self.data_type, value
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// Name given to the index backing a primary key.
pub const PRIMARY_INDEX: &str = "PRIMARY";

/// An index descriptor: ordered columns plus uniqueness flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    /// Indexed columns in index order.
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
}

impl IndexDef {
    /// Create a non-unique secondary index.
    pub fn new(
        table: impl Into<String>,
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            primary: false,
        }
    }

    /// Create the primary key index of a table.
    pub fn primary(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: PRIMARY_INDEX.to_string(),
            table: table.into(),
            columns,
            unique: true,
            primary: true,
        }
    }

    /// Mark the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Length of the longest leading prefix whose columns are all in `bound`.
    pub fn bound_prefix_len(&self, bound: &[&str]) -> usize {
        self.columns
            .iter()
            .take_while(|c| bound.contains(&c.as_str()))
            .count()
    }

    /// Check whether the index's leading columns are exactly `columns`, in any order.
    pub fn leading_prefix_is(&self, columns: &[&str]) -> bool {
        if columns.is_empty() || columns.len() > self.columns.len() {
            return false;
        }
        let prefix = &self.columns[..columns.len()];
        columns.iter().all(|c| prefix.iter().any(|p| p == c))
            && prefix.iter().all(|p| columns.contains(&p.as_str()))
    }

    /// A unique index whose every column appears in `columns` proves those columns distinct.
    pub fn is_covered_by(&self, columns: &[&str]) -> bool {
        self.unique && self.columns.iter().all(|c| columns.contains(&c.as_str()))
    }
}

impl fmt::Display for IndexDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.table, self.name, self.columns.join(", "))?;
        if self.primary {
            write!(f, " PRIMARY")?;
        } else if self.unique {
            write!(f, " UNIQUE")?;
        }
        Ok(())
    }
}
