//! High-level database API.
//!
//! [`Database`] ties the catalog, the stored tables, the planner and the
//! executor together behind one handle.

mod api;

pub use api::{Database, DatabaseConfig, DatabaseError, DatabaseResult};
