//! Catalog module: table schemas, index descriptors and statistics.
//!
//! The planner reads the catalog through an immutable [`CatalogSnapshot`]
//! via the [`StatisticsProvider`], [`IndexRegistry`] and [`SchemaProvider`]
//! traits.

mod config;
mod manager;
mod schema;
mod stats;
mod types;

pub use config::{CatalogConfig, ConfigError, ConfigResult, IndexConfig};
pub use manager::{Catalog, CatalogSnapshot};
pub use schema::{SchemaBuilder, SchemaError, TableSchema};
pub use stats::{
    CatalogReader, EstimateSource, IndexRegistry, SchemaProvider, StatisticsProvider,
    TableStatistics, BASELINE_ROW_ESTIMATE,
};
pub use types::{ColumnDef, DataType, IndexDef, PRIMARY_INDEX};
