// Durable table files: JSON encoding plus atomic write-temp-then-rename.
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{Schema, TypeTag};
use crate::core::value::Record;

const TEMP_PREFIX: &str = ".tabula-";
const TEMP_SUFFIX: &str = ".tmp";

/// Everything a table file holds: the optional schema and the ordered rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableFile {
    pub schema: Option<Schema>,
    pub rows: Vec<Record>,
}

#[derive(Serialize)]
struct DiskFileRef<'a> {
    schema: Option<BTreeMap<&'a str, TypeTag>>,
    strict: bool,
    rows: &'a [Record],
}

#[derive(Deserialize)]
struct DiskFile {
    // Entries that are null or name no known type leave the field untyped.
    #[serde(default)]
    schema: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    rows: Vec<Record>,
}

/// Where a table's committed state lives.
///
/// `save` must be all-or-nothing: after an error the previously saved state
/// is still what `load` returns.
pub trait TableStore: Send {
    fn path(&self) -> &Path;
    fn save(&self, schema: Option<&Schema>, rows: &[Record]) -> Result<(), Error>;
    fn load(&self) -> Result<TableFile, Error>;
    fn remove(&self) -> Result<(), Error>;
}

/// The default store: one JSON file per table.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableStore for FileStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, schema: Option<&Schema>, rows: &[Record]) -> Result<(), Error> {
        save(&self.path, schema, rows)
    }

    fn load(&self) -> Result<TableFile, Error> {
        load(&self.path)
    }

    fn remove(&self) -> Result<(), Error> {
        fs::remove_file(&self.path)
            .map_err(|err| io_error(err, &self.path, "failed to remove table file"))
    }
}

pub fn encode(schema: Option<&Schema>, rows: &[Record]) -> Result<Vec<u8>, Error> {
    let disk = DiskFileRef {
        schema: schema.map(|schema| schema.fields().collect()),
        strict: schema.is_some_and(Schema::is_strict),
        rows,
    };
    let mut bytes = serde_json::to_vec_pretty(&disk).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode table")
            .with_source(err)
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes a table file. Accepts the current object layout and the legacy
/// bare-array layout, whose schema is inferred from the first row.
pub fn decode(bytes: &[u8], path: &Path) -> Result<TableFile, Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| corrupt(path, err))?;
    match value {
        serde_json::Value::Object(_) => {
            let disk: DiskFile = serde_json::from_value(value).map_err(|err| corrupt(path, err))?;
            let schema = disk.schema.map(|fields| {
                let typed = fields
                    .into_iter()
                    .filter_map(|(name, tag)| {
                        let tag = tag.as_str()?.parse::<TypeTag>().ok()?;
                        Some((name, tag))
                    })
                    .collect();
                Schema::from_parts(typed, disk.strict)
            });
            Ok(TableFile {
                schema,
                rows: disk.rows,
            })
        }
        serde_json::Value::Array(_) => {
            let rows: Vec<Record> = serde_json::from_value(value).map_err(|err| corrupt(path, err))?;
            let schema = rows.first().map(Schema::infer);
            Ok(TableFile { schema, rows })
        }
        _ => Err(Error::new(ErrorKind::Corrupt)
            .with_message("unsupported table file layout")
            .with_path(path)),
    }
}

pub fn save(path: &Path, schema: Option<&Schema>, rows: &[Record]) -> Result<(), Error> {
    let bytes = encode(schema, rows)?;
    write_atomic(path, &bytes)
}

pub fn load(path: &Path) -> Result<TableFile, Error> {
    let bytes = fs::read(path).map_err(|err| io_error(err, path, "failed to read table file"))?;
    decode(&bytes, path)
}

/// Writes `bytes` to a temp file beside `path`, syncs it, and renames it over
/// `path`. A crash at any point leaves either the old or the new file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    write_atomic_with(path, bytes, sync_dir)
}

/// The rename is the commit point. Once it succeeds the new bytes are what
/// `load` returns, so a failed directory sync afterwards is not an error:
/// reporting one would make callers keep state the disk no longer holds.
fn write_atomic_with<S>(path: &Path, bytes: &[u8], sync: S) -> Result<(), Error>
where
    S: FnOnce(&Path) -> io::Result<()>,
{
    let temp = synced_temp_file(path, bytes)?;
    temp.persist(path)
        .map_err(|err| io_error(err.error, path, "failed to replace table file"))?;
    let _ = sync(parent_dir(path));
    Ok(())
}

/// A durable temp file in the same directory as `path`, holding `bytes`.
pub(crate) fn synced_temp_file(path: &Path, bytes: &[u8]) -> Result<NamedTempFile, Error> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent_dir(path))
        .map_err(|err| io_error(err, path, "failed to create temp file"))?;
    temp.write_all(bytes)
        .map_err(|err| io_error(err, path, "failed to write temp file"))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| io_error(err, path, "failed to sync temp file"))?;
    Ok(temp)
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn corrupt(path: &Path, err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message("table file failed to parse")
        .with_path(path)
        .with_source(err)
}

pub(crate) fn io_error(err: io::Error, path: &Path, message: &str) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::TableNotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}
