//! Purpose: Define the stable public Rust API boundary for tabula.
//! Exports: Core types plus `Database`, the name-keyed programmatic API.
//! Role: Public, additive-only surface consumed by the CLI and HTTP adapters.
//! Invariants: Every operation takes a table name and returns a tagged `Error` on failure.
//! Invariants: Name-to-table resolution happens only inside the catalog.

mod database;

pub use crate::core::backup::ExportFormat;
pub use crate::core::catalog::{Catalog, LoadReport};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Violation};
pub use crate::core::schema::{Schema, TypeTag, validate};
pub use crate::core::table::{Select, Table};
pub use crate::core::txn::TxnState;
pub use crate::core::value::{Filter, Record, Value};
pub use crate::table_paths::default_table_dir;
pub use database::{ApiResult, Database, TableInfo};
