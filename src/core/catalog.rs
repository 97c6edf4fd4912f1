// Table catalog: name resolution, table lifecycle, and the directory lock.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::codec::{self, FileStore, TableStore};
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Schema;
use crate::core::table::Table;
use crate::table_paths::{TableNameResolveError, resolve_named_table_path, table_name_from_path};

const LOCK_FILE: &str = ".tabula.lock";

/// Outcome of [`Catalog::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Tables loaded by this call, sorted.
    pub loaded: Vec<String>,
    pub failed: Vec<Error>,
}

/// Owns every loaded table of one directory.
///
/// Holds an exclusive advisory lock on the directory for its whole lifetime,
/// so only one catalog (in any process) writes a directory at a time.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    tables: BTreeMap<String, Table>,
    _lock: DirLock,
}

impl Catalog {
    /// Opens (creating if needed) a table directory. No tables are loaded.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create table directory")
                .with_path(&dir)
                .with_source(err)
        })?;
        let lock = DirLock::acquire(&dir)?;
        Ok(Self {
            dir,
            tables: BTreeMap::new(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create_table(&mut self, name: &str, schema: Option<Schema>) -> Result<&mut Table, Error> {
        let path = self.resolve(name)?;
        if self.tables.contains_key(name) || path.exists() {
            return Err(Error::new(ErrorKind::TableAlreadyExists)
                .with_message(format!("table '{name}' already exists"))
                .with_table(name)
                .with_path(path));
        }
        let table = Table::create(name, schema, Box::new(FileStore::new(path)))?;
        Ok(self.tables.entry(name.to_string()).or_insert(table))
    }

    /// Loads a table from disk. A table that is already loaded is returned
    /// as is, including any open transaction.
    pub fn load_table(&mut self, name: &str) -> Result<&mut Table, Error> {
        let path = self.resolve(name)?;
        if !self.tables.contains_key(name) {
            let table = Table::open(name, Box::new(FileStore::new(path)))?;
            self.tables.insert(name.to_string(), table);
        }
        self.table_mut(name)
    }

    /// Loads every stored table that is not loaded yet.
    ///
    /// A table that fails to load is left on disk untouched and reported in
    /// [`LoadReport::failed`]; the remaining tables still load. Only a failure
    /// to list the directory is returned as an error.
    pub fn load_all(&mut self) -> Result<LoadReport, Error> {
        let mut report = LoadReport::default();
        for name in self.stored_tables()? {
            if self.tables.contains_key(&name) {
                continue;
            }
            match self.load_table(&name) {
                Ok(_) => report.loaded.push(name),
                Err(err) => report.failed.push(err.with_table(name)),
            }
        }
        Ok(report)
    }

    /// Forgets the table and deletes its durable file.
    pub fn drop_table(&mut self, name: &str) -> Result<(), Error> {
        let path = self.resolve(name)?;
        match self.tables.get(name) {
            Some(table) => table.remove_file()?,
            None if path.exists() => FileStore::new(&path).remove()?,
            None => return Err(not_found(name)),
        }
        self.tables.remove(name);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables.get(name).ok_or_else(|| not_found(name))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        self.tables.get_mut(name).ok_or_else(|| not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Names of loaded tables, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Names of every table file in the directory, sorted, loaded or not.
    pub fn stored_tables(&self) -> Result<Vec<String>, Error> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to read table directory")
                .with_path(&self.dir)
                .with_source(err)
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read table directory entry")
                    .with_path(&self.dir)
                    .with_source(err)
            })?;
            let path = entry.path();
            if codec::is_temp_file(&path) {
                continue;
            }
            if let Some(name) = table_name_from_path(&path) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, Error> {
        resolve_named_table_path(name, &self.dir)
            .map_err(|err| map_table_name_resolve_error(err, name))
    }
}

#[derive(Debug)]
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open directory lock")
                    .with_path(&path)
                    .with_source(err)
            })?;
        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("table directory is in use by another catalog")
                .with_hint("Stop the other tabula process (for example `tabula serve`) and retry.")
                .with_path(dir)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn not_found(name: &str) -> Error {
    Error::new(ErrorKind::TableNotFound)
        .with_message(format!("table '{name}' does not exist"))
        .with_table(name)
}

fn map_table_name_resolve_error(err: TableNameResolveError, name: &str) -> Error {
    let message = match err {
        TableNameResolveError::Empty => "table name must not be empty",
        TableNameResolveError::LeadingDot => "table name must not start with '.'",
        TableNameResolveError::ContainsPathSeparator => {
            "table name must not contain path separators"
        }
    };
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_table(name)
}

#[cfg(test)]
mod tests {
    use super::{Catalog, lock_error_kind};
    use crate::core::error::ErrorKind;
    use crate::core::schema::{Schema, TypeTag};
    use crate::core::value::Record;
    use std::fs;

    #[test]
    fn create_rejects_taken_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        catalog.create_table("users", None).expect("create");
        let err = catalog.create_table("users", None).expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::TableAlreadyExists);
    }

    #[test]
    fn create_rejects_names_already_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut catalog = Catalog::open(dir.path()).expect("open");
            catalog.create_table("users", None).expect("create");
        }
        let mut catalog = Catalog::open(dir.path()).expect("reopen");
        let err = catalog.create_table("users", None).expect_err("on disk");
        assert_eq!(err.kind(), ErrorKind::TableAlreadyExists);
    }

    #[test]
    fn load_after_restart_keeps_rows_and_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let schema = Schema::new().with("id", TypeTag::Integer);
        {
            let mut catalog = Catalog::open(dir.path()).expect("open");
            let table = catalog.create_table("users", Some(schema.clone())).expect("create");
            table.insert(Record::new().with("id", 1)).expect("insert");
        }
        let mut catalog = Catalog::open(dir.path()).expect("reopen");
        assert_eq!(
            catalog.table("users").expect_err("not loaded").kind(),
            ErrorKind::TableNotFound
        );
        let table = catalog.load_table("users").expect("load");
        assert_eq!(table.schema(), Some(&schema));
        assert_eq!(table.rows(), &[Record::new().with("id", 1)]);
    }

    #[test]
    fn load_reports_missing_and_corrupt_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        let err = catalog.load_table("ghost").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::TableNotFound);

        fs::write(dir.path().join("broken.tabula"), b"not json").expect("write");
        let err = catalog.load_table("broken").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(!catalog.contains("broken"));
    }

    #[test]
    fn drop_removes_memory_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        catalog.create_table("users", None).expect("create");
        let path = dir.path().join("users.tabula");
        assert!(path.exists());

        catalog.drop_table("users").expect("drop");
        assert!(!path.exists());
        assert!(!catalog.contains("users"));
        let err = catalog.drop_table("users").expect_err("gone");
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
    }

    #[test]
    fn drop_works_for_unloaded_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("old.tabula"), b"[]").expect("write");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        catalog.drop_table("old").expect("drop");
        assert!(!dir.path().join("old.tabula").exists());
    }

    #[test]
    fn listing_distinguishes_loaded_and_stored() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.tabula"), b"[]").expect("write");
        fs::write(dir.path().join("notes.txt"), b"x").expect("write");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        catalog.create_table("a", None).expect("create");

        assert_eq!(catalog.table_names(), vec!["a"]);
        assert_eq!(catalog.stored_tables().expect("stored"), vec!["a", "b"]);
        let report = catalog.load_all().expect("load all");
        assert_eq!(report.loaded, vec!["b"]);
        assert!(report.failed.is_empty());
        assert_eq!(catalog.table_names(), vec!["a", "b"]);
    }

    #[test]
    fn load_all_skips_unreadable_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a_good.tabula"), b"[]").expect("write");
        fs::write(dir.path().join("b_bad.tabula"), b"{\"rows\": [").expect("write");
        fs::write(dir.path().join("c_good.tabula"), br#"{"rows": [{"id": 1}]}"#).expect("write");
        let mut catalog = Catalog::open(dir.path()).expect("open");

        let report = catalog.load_all().expect("load all");
        assert_eq!(report.loaded, vec!["a_good", "c_good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind(), ErrorKind::Corrupt);
        assert_eq!(report.failed[0].table(), Some("b_bad"));
        assert_eq!(catalog.table_names(), vec!["a_good", "c_good"]);
        assert_eq!(fs::read(dir.path().join("b_bad.tabula")).expect("read"), b"{\"rows\": [");
    }

    #[test]
    fn bad_names_are_usage_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = Catalog::open(dir.path()).expect("open");
        let err = catalog.create_table("../escape", None).expect_err("separator");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn second_catalog_on_same_dir_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _first = Catalog::open(dir.path()).expect("open");
        let err = Catalog::open(dir.path()).expect_err("locked");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(lock_error_kind(&err), ErrorKind::Io);
    }
}
