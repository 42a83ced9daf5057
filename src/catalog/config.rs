//! JSON catalog configuration: statistics overrides and secondary indexes.
//!
//! ```json
//! {
//!   "statistics": { "xy": 100, "uv": 100 },
//!   "indexes": [ { "table": "xy", "name": "y_idx", "columns": ["y"] } ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::manager::Catalog;
use super::schema::SchemaError;
use super::types::IndexDef;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// One secondary index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl From<&IndexConfig> for IndexDef {
    fn from(cfg: &IndexConfig) -> Self {
        let index = IndexDef::new(cfg.table.clone(), cfg.name.clone(), cfg.columns.clone());
        if cfg.unique {
            index.unique()
        } else {
            index
        }
    }
}

/// Administrative catalog configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Row-count overrides by table name.
    #[serde(default)]
    pub statistics: BTreeMap<String, u64>,
    /// Secondary indexes to create.
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}

impl CatalogConfig {
    /// Read a configuration from a reader.
    pub fn read_from(reader: impl Read) -> ConfigResult<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Write the configuration to a writer.
    pub fn write_to(&self, writer: impl Write) -> ConfigResult<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let file = File::open(path)?;
        Self::read_from(BufReader::new(file))
    }

    /// Write the configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

impl Catalog {
    /// Apply index definitions and statistics overrides.
    ///
    /// Indexes that already exist by name are skipped.
    pub fn apply_config(&self, config: &CatalogConfig) -> ConfigResult<()> {
        for index in &config.indexes {
            let schema = self.get_table(&index.table)?;
            if schema.indexes.iter().any(|i| i.name == index.name) {
                continue;
            }
            self.create_index(IndexDef::from(index))?;
        }
        for (table, rows) in &config.statistics {
            self.set_row_estimate(table, *rows)?;
        }
        info!(
            indexes = config.indexes.len(),
            overrides = config.statistics.len(),
            "applied catalog config"
        );
        Ok(())
    }
}
