//! joinplan - join planning and subquery decorrelation for a small SQL engine
//!
//! SELECT statements are bound against a catalog of table schemas, index
//! descriptors and row-count statistics, then rewritten in whole-tree passes:
//! subquery predicates are unnested into semi, anti and inner joins where
//! that is safe, joins are ordered per scope (honoring `JOIN_ORDER` hints),
//! and each join edge gets a physical strategy (merge, lookup, hash or nested
//! loop). The resulting plan runs on an in-memory Volcano executor.
//!
//! # Example
//!
//! ```no_run
//! use joinplan::catalog::{DataType, SchemaBuilder};
//! use joinplan::db::Database;
//! use serde_json::json;
//!
//! let db = Database::new();
//! let xy = SchemaBuilder::new("xy")
//!     .add_column("x", DataType::Integer)
//!     .add_column("y", DataType::Integer)
//!     .primary_key("x")
//!     .index("y_idx", ["y"])
//!     .build()
//!     .unwrap();
//! db.create_table(xy).unwrap();
//! db.insert("xy", vec![vec![json!(1), json!(0)], vec![json!(2), json!(1)]]).unwrap();
//!
//! let rows = db.query("select x from xy where y = 1").unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

pub mod catalog;
pub mod db;
pub mod executor;
pub mod planner;
pub mod sql;
pub mod storage;
