//! Purpose: Name-keyed programmatic API over one table directory.
//! Exports: `Database`, `TableInfo`, `ApiResult`.
//! Role: The entry point adapters call; resolves names through the catalog and delegates.
//! Invariants: Tables must be created or loaded before row operations; nothing loads implicitly.
//! Invariants: Backup and export read committed state only.
#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};

use crate::core::backup::{self, ExportFormat};
use crate::core::catalog::{Catalog, LoadReport};
use crate::core::error::Error;
use crate::core::schema::Schema;
use crate::core::table::Table;
use crate::core::value::{Filter, Record};
use crate::table_paths::default_table_dir;

pub type ApiResult<T> = Result<T, Error>;

/// Summary of one loaded table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub path: PathBuf,
    pub schema: Option<Schema>,
    pub rows: usize,
    pub committed_rows: usize,
    pub in_transaction: bool,
    pub dirty: bool,
}

impl TableInfo {
    fn of(table: &Table) -> Self {
        Self {
            name: table.name().to_string(),
            path: table.path().to_path_buf(),
            schema: table.schema().cloned(),
            rows: table.len(),
            committed_rows: table.committed_rows().len(),
            in_transaction: table.in_transaction(),
            dirty: table.is_dirty(),
        }
    }
}

#[derive(Debug)]
pub struct Database {
    catalog: Catalog,
}

impl Database {
    pub fn open(table_dir: impl AsRef<Path>) -> ApiResult<Self> {
        Ok(Self {
            catalog: Catalog::open(table_dir)?,
        })
    }

    /// Opens `~/.tabula/tables`.
    pub fn open_default() -> ApiResult<Self> {
        Self::open(default_table_dir())
    }

    pub fn table_dir(&self) -> &Path {
        self.catalog.dir()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn create_table(&mut self, name: &str, schema: Option<Schema>) -> ApiResult<TableInfo> {
        let table = self.catalog.create_table(name, schema)?;
        Ok(TableInfo::of(table))
    }

    pub fn load_table(&mut self, name: &str) -> ApiResult<TableInfo> {
        let table = self.catalog.load_table(name)?;
        Ok(TableInfo::of(table))
    }

    /// Loads every table file in the directory, skipping files that fail.
    pub fn open_all(&mut self) -> ApiResult<LoadReport> {
        self.catalog.load_all()
    }

    pub fn drop_table(&mut self, name: &str) -> ApiResult<()> {
        self.catalog.drop_table(name)
    }

    /// Loaded table names, sorted.
    pub fn list_tables(&self) -> Vec<String> {
        self.catalog
            .table_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn stored_tables(&self) -> ApiResult<Vec<String>> {
        self.catalog.stored_tables()
    }

    pub fn table_info(&self, name: &str) -> ApiResult<TableInfo> {
        Ok(TableInfo::of(self.catalog.table(name)?))
    }

    pub fn insert(&mut self, table: &str, record: Record) -> ApiResult<()> {
        self.catalog.table_mut(table)?.insert(record)
    }

    pub fn insert_unique(&mut self, table: &str, record: Record, key_column: &str) -> ApiResult<()> {
        self.catalog.table_mut(table)?.insert_unique(record, key_column)
    }

    /// Matching rows, copied out. Use `catalog().table(name)?.select(..)` for
    /// a lazy scan.
    pub fn select(&self, table: &str, filter: &Filter) -> ApiResult<Vec<Record>> {
        Ok(self.catalog.table(table)?.select(filter).cloned().collect())
    }

    pub fn update(&mut self, table: &str, filter: &Filter, changes: &Record) -> ApiResult<usize> {
        self.catalog.table_mut(table)?.update(filter, changes)
    }

    pub fn delete(&mut self, table: &str, filter: &Filter) -> ApiResult<usize> {
        self.catalog.table_mut(table)?.delete(filter)
    }

    pub fn begin_transaction(&mut self, table: &str) -> ApiResult<()> {
        self.catalog.table_mut(table)?.begin()
    }

    pub fn commit(&mut self, table: &str) -> ApiResult<()> {
        self.catalog.table_mut(table)?.commit()
    }

    pub fn rollback(&mut self, table: &str) -> ApiResult<()> {
        self.catalog.table_mut(table)?.rollback()
    }

    pub fn backup(&self, table: &str) -> ApiResult<PathBuf> {
        backup::backup(self.catalog.table(table)?)
    }

    pub fn export(&self, table: &str, path: &Path, format: ExportFormat) -> ApiResult<usize> {
        backup::export(self.catalog.table(table)?, path, format)
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::core::error::ErrorKind;
    use crate::core::value::Record;

    #[test]
    fn row_operations_need_a_loaded_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = Database::open(dir.path()).expect("open");
        let err = db
            .insert("users", Record::new().with("id", 1))
            .expect_err("not loaded");
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        let err = db.begin_transaction("users").expect_err("not loaded");
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
    }

    #[test]
    fn info_tracks_transaction_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = Database::open(dir.path()).expect("open");
        db.create_table("t", None).expect("create");
        db.insert("t", Record::new().with("a", 1)).expect("insert");
        db.begin_transaction("t").expect("begin");
        db.insert("t", Record::new().with("a", 2)).expect("insert");

        let info = db.table_info("t").expect("info");
        assert_eq!(info.rows, 2);
        assert_eq!(info.committed_rows, 1);
        assert!(info.in_transaction);
        assert!(info.dirty);
        assert_eq!(db.list_tables(), vec!["t".to_string()]);
    }
}
