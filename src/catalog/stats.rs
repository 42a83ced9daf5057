//! Table statistics and the read-only adapter traits the planner consumes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schema::TableSchema;
use super::types::IndexDef;

/// Row estimate substituted when a table has no statistics.
pub const BASELINE_ROW_ESTIMATE: u64 = 1000;

/// Where a row-count estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// Counted from the stored rows.
    Computed,
    /// Set through an administrative override.
    Override,
}

/// Statistics for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub row_count: u64,
    pub source: EstimateSource,
    pub refreshed_at: DateTime<Utc>,
}

impl TableStatistics {
    pub fn computed(row_count: u64) -> Self {
        Self {
            row_count,
            source: EstimateSource::Computed,
            refreshed_at: Utc::now(),
        }
    }

    pub fn overridden(row_count: u64) -> Self {
        Self {
            row_count,
            source: EstimateSource::Override,
            refreshed_at: Utc::now(),
        }
    }

    /// Apply a freshly computed count. Overrides stay in force.
    pub fn refresh(&mut self, row_count: u64) {
        if self.source == EstimateSource::Computed {
            self.row_count = row_count;
            self.refreshed_at = Utc::now();
        }
    }
}

/// Row-count estimates.
pub trait StatisticsProvider {
    /// Estimated row count, or `None` when the table has no statistics.
    fn estimate_row_count(&self, table: &str) -> Option<u64>;
}

/// Index definitions per table.
pub trait IndexRegistry {
    /// Every index of `table`, primary key first.
    fn indexes_for(&self, table: &str) -> Vec<IndexDef>;
}

/// Schema lookups.
pub trait SchemaProvider {
    fn table(&self, name: &str) -> Option<Arc<TableSchema>>;
}

/// Everything the planner reads from the catalog.
pub trait CatalogReader: StatisticsProvider + IndexRegistry + SchemaProvider {}

impl<T: StatisticsProvider + IndexRegistry + SchemaProvider> CatalogReader for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_survives_refresh() {
        let mut stats = TableStatistics::overridden(100);
        stats.refresh(4);
        assert_eq!(stats.row_count, 100);

        let mut stats = TableStatistics::computed(1);
        let before = stats.refreshed_at;
        stats.refresh(4);
        assert_eq!(stats.row_count, 4);
        assert!(stats.refreshed_at >= before);
    }
}
