//! Database API - high-level interface over catalog, storage, planner and
//! executor.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{
    Catalog, CatalogConfig, ConfigError, IndexDef, SchemaError, TableSchema, TableStatistics,
};
use crate::executor::{CacheRegistry, ExecuteError, ExecutionStats, QueryExecutor, ResultSet};
use crate::planner::{PlanError, PlannerOptions, QueryPlan, QueryPlanner};
use crate::storage::{Storage, StorageError};

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl DatabaseError {
    /// Errors caused by the statement or data rather than an engine bug.
    pub fn is_user_facing(&self) -> bool {
        match self {
            DatabaseError::Plan(e) => e.is_user_facing(),
            DatabaseError::Execute(e) => e.is_user_facing(),
            DatabaseError::Schema(_) | DatabaseError::Config(_) => true,
            DatabaseError::Storage(_) => false,
        }
    }
}

/// Database configuration options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub planner: PlannerOptions,
}

impl DatabaseConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let file = std::fs::File::open(path).map_err(ConfigError::from)?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| DatabaseError::Config(e.into()))
    }

    pub fn planner(mut self, options: PlannerOptions) -> Self {
        self.planner = options;
        self
    }
}

/// The main database handle.
///
/// Cloning a handle shares the catalog, the stored tables and the live
/// cache registry.
#[derive(Clone)]
pub struct Database {
    config: DatabaseConfig,
    catalog: Catalog,
    storage: Arc<RwLock<Storage>>,
    planner: Arc<QueryPlanner>,
    executor: QueryExecutor,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Create an empty database with default options.
    pub fn new() -> Self {
        Self::with_config(DatabaseConfig::default())
    }

    pub fn with_config(config: DatabaseConfig) -> Self {
        Self {
            planner: Arc::new(QueryPlanner::new(config.planner.clone())),
            config,
            catalog: Catalog::new(),
            storage: Arc::new(RwLock::new(Storage::new())),
            executor: QueryExecutor::new(CacheRegistry::new()),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Create a table and its indexes.
    pub fn create_table(&self, schema: TableSchema) -> DatabaseResult<()> {
        let name = schema.name.clone();
        self.catalog.create_table(schema)?;
        let schema = self.catalog.get_table(&name)?;
        if let Err(e) = self.storage.write().create_table(schema) {
            self.catalog.drop_table(&name)?;
            return Err(e.into());
        }
        info!(table = %name, "created table");
        Ok(())
    }

    /// Add a secondary index, built over the rows already stored.
    pub fn create_index(&self, index: IndexDef) -> DatabaseResult<()> {
        let schema = self.catalog.create_index(index.clone())?;
        debug!(table = %index.table, index = %index.name, "created index");
        self.storage.write().add_index(schema, index)?;
        Ok(())
    }

    /// Insert positional rows and refresh the table's computed statistics.
    /// Returns the number of rows inserted.
    pub fn insert(&self, table: &str, rows: Vec<Vec<Value>>) -> DatabaseResult<usize> {
        let inserted = rows.len();
        let total = self.storage.write().insert(table, rows)?;
        self.catalog.record_row_count(table, total as u64);
        debug!(table, inserted, total, "inserted rows");
        Ok(inserted)
    }

    /// Pin a table's row estimate.
    pub fn set_row_estimate(&self, table: &str, rows: u64) -> DatabaseResult<()> {
        Ok(self.catalog.set_row_estimate(table, rows)?)
    }

    pub fn clear_row_estimate(&self, table: &str) {
        self.catalog.clear_row_estimate(table);
    }

    pub fn statistics(&self, table: &str) -> Option<TableStatistics> {
        self.catalog.statistics(table)
    }

    /// Apply a catalog configuration. New indexes are built over stored rows.
    pub fn apply_config(&self, config: &CatalogConfig) -> DatabaseResult<()> {
        for index in &config.indexes {
            let schema = self.catalog.get_table(&index.table)?;
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

    /// Load and apply a catalog configuration file.
    pub fn apply_config_file(&self, path: impl AsRef<Path>) -> DatabaseResult<()> {
        let config = CatalogConfig::load(path)?;
        self.apply_config(&config)
    }

    /// Plan a SELECT statement without running it.
    pub fn plan(&self, sql: &str) -> DatabaseResult<QueryPlan> {
        Ok(self.planner.plan_sql(&self.catalog.snapshot(), sql)?)
    }

    /// Explain a query (show the logical and physical plans).
    pub fn explain(&self, sql: &str) -> DatabaseResult<String> {
        Ok(self.planner.explain(&self.catalog.snapshot(), sql)?)
    }

    /// Plan and run a SELECT statement.
    pub fn query(&self, sql: &str) -> DatabaseResult<ResultSet> {
        self.query_with_stats(sql).map(|(result, _)| result)
    }

    /// Plan and run a SELECT statement, returning execution counters too.
    pub fn query_with_stats(&self, sql: &str) -> DatabaseResult<(ResultSet, ExecutionStats)> {
        debug!(sql, "query");
        let plan = self.plan(sql)?;
        let storage = self.storage.read().snapshot();
        Ok(self.executor.execute(&plan.physical, storage)?)
    }

    /// Cached results not yet released, across all executions.
    pub fn live_caches(&self) -> usize {
        self.executor.caches().live_count()
    }

    pub fn tables(&self) -> Vec<String> {
        self.catalog.list_tables()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.catalog.table_exists(name)
    }

    /// Get the schema for a table.
    pub fn table_schema(&self, name: &str) -> DatabaseResult<Option<Arc<TableSchema>>> {
        match self.catalog.get_table(name) {
            Ok(schema) => Ok(Some(schema)),
            Err(SchemaError::TableNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, IndexConfig, SchemaBuilder};
    use crate::planner::{HintError, JoinType};
    use serde_json::json;
    use tempfile::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn rows(values: &[(i64, i64)]) -> Vec<Vec<Value>> {
        values.iter().map(|(a, b)| vec![json!(a), json!(b)]).collect()
    }

    fn pair_table(name: &str, a: &str, b: &str, b_index: bool) -> TableSchema {
        let builder = SchemaBuilder::new(name)
            .add_column(a, DataType::Integer)
            .add_column(b, DataType::Integer)
            .primary_key(a);
        let builder = if b_index {
            builder.index(format!("{}_idx", b), [b])
        } else {
            builder
        };
        builder.build().unwrap()
    }

    /// `xy(x pk, y indexed)`, `rs(r pk, s indexed)`, `uv(u pk)`, `ab(a pk)`.
    fn database() -> Database {
        init_tracing();
        let db = Database::new();
        db.create_table(pair_table("xy", "x", "y", true)).unwrap();
        db.create_table(pair_table("rs", "r", "s", true)).unwrap();
        db.create_table(pair_table("uv", "u", "v", false)).unwrap();
        db.create_table(pair_table("ab", "a", "b", false)).unwrap();
        db.insert("xy", rows(&[(1, 0), (2, 1), (0, 2), (3, 3)])).unwrap();
        db.insert("rs", rows(&[(0, 0), (1, 0), (2, 0), (4, 4), (5, 4)])).unwrap();
        db.insert("uv", rows(&[(0, 1), (1, 1), (2, 2), (3, 2)])).unwrap();
        db.insert("ab", rows(&[(0, 1), (1, 2), (2, 3), (3, 4)])).unwrap();
        db
    }

    fn join_types(db: &Database, sql: &str) -> Vec<JoinType> {
        db.plan(sql).unwrap().physical.join_types()
    }

    fn query(db: &Database, sql: &str) -> Vec<Vec<Value>> {
        let result = db.query(sql).unwrap();
        assert_eq!(db.live_caches(), 0, "caches outlived {}", sql);
        result.rows
    }

    #[test]
    fn test_create_and_insert() {
        let db = database();
        assert_eq!(db.tables().len(), 4);
        assert!(db.table_exists("xy"));
        assert!(db.table_schema("zz").unwrap().is_none());
        assert_eq!(db.statistics("rs").unwrap().row_count, 5);

        let err = db.create_table(pair_table("xy", "x", "y", false)).unwrap_err();
        assert!(matches!(err, DatabaseError::Schema(SchemaError::TableExists(_))), "{}", err);
        assert!(db.insert("zz", rows(&[(1, 1)])).is_err());
    }

    #[test]
    fn test_left_outer_merge_null_extends() {
        let db = database();
        let sql = "select /*+ JOIN_ORDER(rs, xy) */ * from rs left outer join xy on y = s order by r, x";
        assert_eq!(join_types(&db, sql), vec![JoinType::LeftOuterMerge]);

        let result = db.query(sql).unwrap();
        assert_eq!(result.columns, vec!["r", "s", "x", "y"]);
        assert_eq!(
            result.rows,
            vec![
                vec![json!(0), json!(0), json!(1), json!(0)],
                vec![json!(1), json!(0), json!(1), json!(0)],
                vec![json!(2), json!(0), json!(1), json!(0)],
                vec![json!(4), json!(4), json!(null), json!(null)],
                vec![json!(5), json!(4), json!(null), json!(null)],
            ]
        );
        assert_eq!(db.live_caches(), 0);
    }

    #[test]
    fn test_left_outer_residual_keeps_left_rows() {
        let db = database();
        let rows = query(
            &db,
            "select r, x from rs left outer join xy on y = s and y + s = 0 order by r",
        );
        assert_eq!(
            rows,
            vec![
                vec![json!(0), json!(1)],
                vec![json!(1), json!(1)],
                vec![json!(2), json!(1)],
                vec![json!(4), json!(null)],
                vec![json!(5), json!(null)],
            ]
        );

        // Every key match fails the residual, every row still appears once.
        let rows = query(&db, "select r, x from rs left outer join xy on y = s and x > 1 order by r");
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|row| row[1].is_null()), "{:?}", rows);
    }

    #[test]
    fn test_scalar_not_equal_becomes_anti() {
        let db = database();
        let sql = "select * from xy where x != (select r from rs where r = 1) order by x";
        assert_eq!(join_types(&db, sql), vec![JoinType::Anti]);
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(2)],
                vec![json!(2), json!(1)],
                vec![json!(3), json!(3)],
            ]
        );

        // An empty scalar result compares as NULL.
        let sql = "select * from xy where x != (select r from rs where r = 100)";
        assert!(query(&db, sql).is_empty());
    }

    #[test]
    fn test_limit_blocks_unnesting() {
        let db = database();
        let sql = "select * from xy where y - 1 in (select u from uv order by u limit 1)";
        let types = join_types(&db, sql);
        assert_eq!(types, vec![JoinType::Hash]);
        assert!(!types.iter().any(|t| t.is_existence() || t.is_lookup()));
        assert_eq!(query(&db, sql), vec![vec![json!(2), json!(1)]]);

        let sql = "select * from xy where y - 1 in (select u from uv order by u limit 1 offset 1)";
        assert_eq!(join_types(&db, sql), vec![JoinType::Hash]);
        assert_eq!(query(&db, sql), vec![vec![json!(0), json!(2)]]);
    }

    #[test]
    fn test_grouped_subquery_joins_distinct_result() {
        let db = database();
        let sql = "select * from xy where y in (select max(u) from uv group by v) order by x";
        assert!(!join_types(&db, sql).iter().any(|t| t.is_existence()));
        assert_eq!(
            query(&db, sql),
            vec![vec![json!(2), json!(1)], vec![json!(3), json!(3)]]
        );
    }

    #[test]
    fn test_empty_merge_side() {
        let db = database();
        db.create_table(pair_table("pq", "p", "q", true)).unwrap();
        let sql = "select /*+ JOIN_ORDER(pq, xy) */ * from pq left outer join xy on y = q";
        assert_eq!(join_types(&db, sql), vec![JoinType::LeftOuterMerge]);
        assert!(query(&db, sql).is_empty());
    }

    #[test]
    fn test_empty_outer_skips_probes() {
        let db = database();
        db.create_table(pair_table("pq", "p", "q", false)).unwrap();
        db.insert("pq", Vec::new()).unwrap();
        let sql = "select /*+ JOIN_ORDER(pq, uv) */ * from pq inner join uv on p + 1 = u";
        assert_eq!(join_types(&db, sql), vec![JoinType::Lookup]);

        let (result, stats) = db.query_with_stats(sql).unwrap();
        assert!(result.is_empty());
        assert_eq!(stats.index_probes, 0);

        let sql = "select /*+ JOIN_ORDER(xy, uv) */ * from xy inner join uv on x + 1 = u";
        let (result, stats) = db.query_with_stats(sql).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(stats.index_probes, 4);
    }

    #[test]
    fn test_semi_and_anti_partition_left() {
        let db = database();
        let semi = "select * from xy where y - 1 in (select u from uv)";
        let anti = "select * from xy where y - 1 not in (select u from uv)";
        assert_eq!(join_types(&db, semi), vec![JoinType::SemiLookup]);
        assert_eq!(join_types(&db, anti), vec![JoinType::AntiLookup]);

        let semi_rows = db.query(semi).unwrap().sorted_rows();
        let anti_rows = db.query(anti).unwrap().sorted_rows();
        assert_eq!(
            semi_rows,
            vec![
                vec![json!(0), json!(2)],
                vec![json!(2), json!(1)],
                vec![json!(3), json!(3)],
            ]
        );
        assert_eq!(anti_rows, vec![vec![json!(1), json!(0)]]);

        let mut all = semi_rows;
        all.extend(anti_rows);
        all.sort_by(|a, b| crate::storage::compare_slices(a, b));
        assert_eq!(all, db.query("select * from xy").unwrap().sorted_rows());
    }

    #[test]
    fn test_anti_lookup_not_in() {
        let db = database();
        let sql = "select * from xy where y + 1 not in (select u from uv)";
        assert_eq!(join_types(&db, sql), vec![JoinType::AntiLookup]);
        assert_eq!(query(&db, sql), vec![vec![json!(3), json!(3)]]);
    }

    #[test]
    fn test_right_semi_lookup() {
        let db = database();
        let sql = "select * from xy where x in (select u from uv inner join ab on u = a and a = 2)";
        assert_eq!(join_types(&db, sql)[0], JoinType::RightSemiLookup);
        assert_eq!(query(&db, sql), vec![vec![json!(2), json!(1)]]);
    }

    #[test]
    fn test_exists_and_correlated_subqueries() {
        let db = database();
        let sql = "select x from xy where exists (select * from uv where u = x and v = 1) order by x";
        assert_eq!(query(&db, sql), vec![vec![json!(0)], vec![json!(1)]]);

        let sql = "select x from xy where not exists (select * from uv where u = x and v = 1) order by x";
        assert_eq!(query(&db, sql), vec![vec![json!(2)], vec![json!(3)]]);

        // Blocked and correlated: evaluated per outer row.
        let sql = "select x from xy where x in (select max(u) from uv where v = y + 1 group by v) order by x";
        assert_eq!(query(&db, sql), vec![vec![json!(1)]]);
    }

    #[test]
    fn test_or_of_equalities_concatenates_lookups() {
        let db = database();
        let sql = "select x, u from xy inner join uv on u = x or u = y order by x, u";
        assert_eq!(join_types(&db, sql), vec![JoinType::Lookup]);
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(0)],
                vec![json!(0), json!(2)],
                vec![json!(1), json!(0)],
                vec![json!(1), json!(1)],
                vec![json!(2), json!(1)],
                vec![json!(2), json!(2)],
                vec![json!(3), json!(3)],
            ]
        );
    }

    #[test]
    fn test_hints_per_scope() {
        let db = database();
        let plan = db
            .plan("select /*+ JOIN_ORDER(uv, xy) */ * from xy, uv where u = x")
            .unwrap();
        assert_eq!(plan.physical.join_order(), vec!["uv", "xy"]);

        let sql = "select x from xy where x in \
                   (select /*+ JOIN_ORDER(ab, uv) */ max(u) from uv, ab where u = a and v = y group by v)";
        let orders = db.plan(sql).unwrap().physical.scope_orders();
        assert!(orders.values().any(|o| o == &["ab", "uv"]), "{:?}", orders);
        assert_eq!(orders.get(&0), Some(&vec!["xy".to_string()]));

        let err = db
            .plan("select /*+ JOIN_ORDER(xy, zz) */ * from xy, uv")
            .unwrap_err();
        assert!(err.is_user_facing());
        assert!(
            matches!(err, DatabaseError::Plan(PlanError::Hint(HintError::UnknownRelation { .. }))),
            "{}",
            err
        );
        assert!(err.to_string().contains("zz"), "{}", err);
    }

    #[test]
    fn test_hinted_semi_before_its_dependency() {
        let db = database();
        let sql = "select /*+ JOIN_ORDER(b, c, a) */ 1 from xy a inner join xy b on a.x + 3 = b.x \
                   where exists (select 1 from uv c where c.u = a.x + 2)";
        let plan = db.plan(sql).unwrap();
        assert_eq!(plan.physical.scope_orders().get(&0), Some(&vec!["b".to_string(), "c".into(), "a".into()]));
        assert_eq!(query(&db, sql), vec![vec![json!(1)]]);

        let sql = "select /*+ JOIN_ORDER(a, c, b) */ 1 from xy a inner join xy b on a.x + 3 = b.x \
                   where exists (select 1 from uv c where c.u = a.x + 2)";
        assert_eq!(db.plan(sql).unwrap().physical.join_order(), vec!["a", "c", "b"]);
        assert_eq!(query(&db, sql), vec![vec![json!(1)]]);

        // Every relation placed ahead of the semi side still contributes rows.
        let hinted = "select /*+ JOIN_ORDER(b, c, a) */ a.x from xy a, xy b \
                      where exists (select 1 from uv c where c.u = a.x)";
        let plain = "select a.x from xy a, xy b where exists (select 1 from uv c where c.u = a.x)";
        assert_eq!(query(&db, hinted).len(), 16);
        assert_eq!(
            db.query(hinted).unwrap().sorted_rows(),
            db.query(plain).unwrap().sorted_rows()
        );
    }

    #[test]
    fn test_hint_names_unnested_subquery() {
        let db = database();
        let sql = "select /*+ JOIN_ORDER(b, applySubq0, a) */ 1 from xy a inner join xy b on a.x + 3 = b.x \
                   where a.x in (select u from uv c)";
        let plan = db.plan(sql).unwrap();
        assert_eq!(plan.physical.join_order(), vec!["b", "applySubq0", "a"]);
        assert_eq!(query(&db, sql), vec![vec![json!(1)]]);

        let sql = "select /*+ JOIN_ORDER(applySubq0, xy) */ x from xy where y - 1 in (select u from uv) order by x";
        assert_eq!(db.plan(sql).unwrap().physical.join_order(), vec!["applySubq0", "xy"]);
        assert_eq!(
            query(&db, sql),
            vec![vec![json!(0)], vec![json!(2)], vec![json!(3)]]
        );
    }

    #[test]
    fn test_hints_without_joins_are_checked() {
        let db = database();
        let err = db.plan("select /*+ JOIN_ORDER(xy, zz) */ * from xy").unwrap_err();
        assert!(
            matches!(err, DatabaseError::Plan(PlanError::Hint(HintError::UnknownRelation { .. }))),
            "{}",
            err
        );

        let err = db
            .plan("select * from xy where x in (select /*+ JOIN_ORDER(zz, qq) */ u from uv)")
            .unwrap_err();
        assert!(err.to_string().contains("zz"), "{}", err);

        let err = db
            .plan("select * from xy where exists (select /*+ JOIN_ORDER(uv, zz) */ 1 from uv where u = x)")
            .unwrap_err();
        assert!(err.is_user_facing(), "{}", err);

        assert!(db.plan("select /*+ JOIN_ORDER(xy) */ * from xy").is_ok());
    }

    #[test]
    fn test_short_join_syntax() {
        let db = database();
        let sql = "select /*+ JOIN_ORDER(rs, xy) */ * from rs join xy on y = r order by r, x";
        assert_eq!(join_types(&db, sql), vec![JoinType::Merge]);
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(0), json!(1), json!(0)],
                vec![json!(1), json!(0), json!(2), json!(1)],
                vec![json!(2), json!(0), json!(0), json!(2)],
            ]
        );

        let sql = "select /*+ JOIN_ORDER(rs, xy) */ * from rs left join xy on y + 2 = s and s - y = 2 order by r, x";
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(0), json!(null), json!(null)],
                vec![json!(1), json!(0), json!(null), json!(null)],
                vec![json!(2), json!(0), json!(null), json!(null)],
                vec![json!(4), json!(4), json!(0), json!(2)],
                vec![json!(5), json!(4), json!(0), json!(2)],
            ]
        );
    }

    #[test]
    fn test_cast_blocks_unnesting() {
        let db = database();
        let sql = "select * from xy where x != (select cast(r as signed) from rs where r = 1) order by x";
        assert_eq!(join_types(&db, sql), vec![JoinType::Anti]);
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(2)],
                vec![json!(2), json!(1)],
                vec![json!(3), json!(3)],
            ]
        );

        let sql = "select * from xy where y - 1 in (select cast(u as signed) from uv) order by x";
        assert_eq!(join_types(&db, sql), vec![JoinType::Hash]);
        assert_eq!(
            query(&db, sql),
            vec![
                vec![json!(0), json!(2)],
                vec![json!(2), json!(1)],
                vec![json!(3), json!(3)],
            ]
        );
    }

    #[test]
    fn test_lookup_into_left_input() {
        let db = database();
        let sql = "select u, a, y from uv inner join \
                   (select /*+ JOIN_ORDER(ab, xy) */ * from ab inner join xy on y = a) r on u = r.a order by u";
        assert_eq!(join_types(&db, sql), vec![JoinType::Lookup, JoinType::Merge]);
        assert_eq!(
            query(&db, sql),
            (0..4).map(|i| vec![json!(i), json!(i), json!(i)]).collect::<Vec<_>>()
        );

        let sql = "select x, u from xy inner join uv on u + 1 = x or u + 2 = x or u + 3 = x order by x, u";
        assert_eq!(join_types(&db, sql), vec![JoinType::Lookup]);
        assert_eq!(
            query(&db, sql),
            rows(&[(1, 0), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)])
        );

        // A hinted scope keeps its order and falls back to hashing.
        let sql = "select /*+ JOIN_ORDER(uv, r) */ u, a, y from uv inner join \
                   (select /*+ JOIN_ORDER(ab, xy) */ * from ab inner join xy on y = a) r on u = r.a";
        assert_eq!(join_types(&db, sql), vec![JoinType::Hash, JoinType::Merge]);
    }

    #[test]
    fn test_huge_estimates_do_not_overflow() {
        let db = database();
        db.set_row_estimate("xy", 10_000_000_000).unwrap();
        db.set_row_estimate("uv", 10_000_000_000).unwrap();
        let plan = db.plan("select * from xy, uv where x < u").unwrap();
        assert_eq!(plan.physical.join_types(), vec![JoinType::Inner]);
        assert!(plan.estimated_cost().is_finite());
        assert_eq!(query(&db, "select * from xy, uv where x < u").len(), 6);
    }

    /// Tables from the merge scenarios, with both join keys repeated.
    fn merge_database(xy: TableSchema, rs: TableSchema) -> Database {
        init_tracing();
        let db = Database::new();
        db.create_table(xy).unwrap();
        db.create_table(rs).unwrap();
        db.insert("xy", rows(&[(1, 0), (2, 1), (0, 8), (3, 7), (5, 4), (4, 0)])).unwrap();
        db.insert("rs", rows(&[(0, 0), (2, 3), (3, 0), (4, 8), (5, 4)])).unwrap();
        db.set_row_estimate("xy", 1000).unwrap();
        db.set_row_estimate("rs", 1000).unwrap();
        db
    }

    fn assert_merge_matches(db: &Database) {
        let sql = "select /*+ JOIN_ORDER(rs, xy) */ * from rs inner join xy on y = s order by r, x";
        assert_eq!(join_types(db, sql), vec![JoinType::Merge]);
        assert_eq!(
            query(db, sql),
            vec![
                vec![json!(0), json!(0), json!(1), json!(0)],
                vec![json!(0), json!(0), json!(4), json!(0)],
                vec![json!(3), json!(0), json!(1), json!(0)],
                vec![json!(3), json!(0), json!(4), json!(0)],
                vec![json!(4), json!(8), json!(0), json!(8)],
                vec![json!(5), json!(4), json!(5), json!(4)],
            ]
        );
    }

    #[test]
    fn test_merge_with_duplicate_keys() {
        let db = merge_database(pair_table("xy", "x", "y", true), pair_table("rs", "r", "s", true));
        assert_merge_matches(&db);
    }

    #[test]
    fn test_merge_over_composite_index() {
        let xy = SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer)
            .primary_key("x")
            .index("yx_idx", ["y", "x"])
            .build()
            .unwrap();
        let db = merge_database(xy, pair_table("rs", "r", "s", true));
        assert_merge_matches(&db);
        let text = db
            .explain("select /*+ JOIN_ORDER(rs, xy) */ * from rs inner join xy on y = s")
            .unwrap();
        assert!(text.contains("using yx_idx"), "{}", text);
    }

    #[test]
    fn test_merge_over_keyless_tables() {
        let xy = SchemaBuilder::new("xy")
            .add_column("x", DataType::Integer)
            .add_column("y", DataType::Integer)
            .index("yx_idx", ["y", "x"])
            .build()
            .unwrap();
        let rs = SchemaBuilder::new("rs")
            .add_column("r", DataType::Integer)
            .add_column("s", DataType::Integer)
            .index("s_idx", ["s"])
            .build()
            .unwrap();
        assert_merge_matches(&merge_database(xy, rs));
    }

    #[test]
    fn test_config_adds_index_and_overrides_statistics() {
        let db = database();
        let sql = "select * from xy where y in (select v from uv)";
        let before = join_types(&db, sql);
        let expected = db.query(sql).unwrap().sorted_rows();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let config = CatalogConfig {
            statistics: [("uv".to_string(), 50)].into_iter().collect(),
            indexes: vec![IndexConfig {
                table: "uv".into(),
                name: "v_idx".into(),
                columns: vec!["v".into()],
                unique: false,
            }],
        };
        config.save(&path).unwrap();
        db.apply_config_file(&path).unwrap();
        // Applying twice skips indexes that already exist.
        db.apply_config(&config).unwrap();

        assert_eq!(db.statistics("uv").unwrap().row_count, 50);
        let after = join_types(&db, sql);
        assert_eq!(after, vec![JoinType::SemiLookup]);
        assert_ne!(before, after);
        assert_eq!(db.query(sql).unwrap().sorted_rows(), expected);
        assert_eq!(
            expected,
            vec![vec![json!(0), json!(2)], vec![json!(2), json!(1)]]
        );
    }

    #[test]
    fn test_execution_errors_are_user_facing() {
        let db = database();
        let err = db.query("select x, (select u from uv) from xy").unwrap_err();
        assert!(matches!(err, DatabaseError::Execute(ExecuteError::ScalarSubqueryRows(_))), "{}", err);
        assert!(err.is_user_facing());
        assert_eq!(db.live_caches(), 0);

        let err = db.query("select x / 0 from xy").unwrap_err();
        assert!(err.is_user_facing(), "{}", err);
    }

    #[test]
    fn test_explain_and_config_file() {
        let db = database();
        let text = db.explain("select * from xy where x = 1").unwrap();
        assert!(text.contains("Logical Plan"), "{}", text);
        assert!(text.contains("IndexedTableAccess: xy using PRIMARY"), "{}", text);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, r#"{ "planner": { "enable_hash_join": false } }"#).unwrap();
        let config = DatabaseConfig::load(&path).unwrap();
        assert!(!config.planner.enable_hash_join);
        assert!(config.planner.enable_merge_join);

        let db2 = Database::with_config(config);
        db2.create_table(pair_table("xy", "x", "y", true)).unwrap();
        db2.create_table(pair_table("uv", "u", "v", false)).unwrap();
        let plan = db2
            .plan("select * from xy where y - 1 in (select u from uv order by 1 limit 1)")
            .unwrap();
        assert_eq!(plan.physical.join_types(), vec![JoinType::Inner]);
    }
}
