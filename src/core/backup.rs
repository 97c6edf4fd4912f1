// Read-only snapshots of a table's committed state: backups and flat exports.
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use crate::core::codec::{self, io_error};
use crate::core::error::{Error, ErrorKind};
use crate::core::table::Table;
use crate::core::value::Record;

const BACKUP_STAMP: &str = "[year][month][day][hour][minute][second]";
const MAX_BACKUP_ATTEMPTS: u32 = 1000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExportFormat {
    #[default]
    Csv,
    Tsv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
        }
    }

    fn delimiter(self) -> char {
        match self {
            ExportFormat::Csv => ',',
            ExportFormat::Tsv => '\t',
        }
    }

    fn escape(self, cell: &str) -> String {
        match self {
            ExportFormat::Csv => {
                if cell.contains([',', '"', '\n', '\r']) {
                    format!("\"{}\"", cell.replace('"', "\"\""))
                } else {
                    cell.to_string()
                }
            }
            ExportFormat::Tsv => cell
                .replace('\\', "\\\\")
                .replace('\t', "\\t")
                .replace('\n', "\\n")
                .replace('\r', "\\r"),
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "csv" => Ok(ExportFormat::Csv),
            "tsv" => Ok(ExportFormat::Tsv),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown export format '{other}'"))
                .with_hint("Use csv or tsv.")),
        }
    }
}

/// Copies the table's committed state to `<file>.backup.<UTC stamp>` beside
/// the table file. Never includes an open transaction's working copy.
pub fn backup(table: &Table) -> Result<PathBuf, Error> {
    backup_at(table, OffsetDateTime::now_utc())
}

/// Like [`backup`] with an explicit clock. When the stamped name is taken a
/// numeric suffix is appended; an existing file is never overwritten.
pub fn backup_at(table: &Table, now: OffsetDateTime) -> Result<PathBuf, Error> {
    let format = time::format_description::parse(BACKUP_STAMP).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid backup stamp format")
            .with_source(err)
    })?;
    let stamp = now.format(&format).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format backup stamp")
            .with_source(err)
    })?;
    let base = format!("{}.backup.{stamp}", table.path().display());
    let bytes = codec::encode(table.schema(), table.committed_rows())?;

    let mut temp = codec::synced_temp_file(table.path(), &bytes)?;

    for attempt in 0..MAX_BACKUP_ATTEMPTS {
        let candidate = if attempt == 0 {
            PathBuf::from(&base)
        } else {
            PathBuf::from(format!("{base}.{attempt}"))
        };
        match temp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => temp = err.file,
            Err(err) => {
                return Err(io_error(err.error, &candidate, "failed to write backup")
                    .with_table(table.name()));
            }
        }
    }
    Err(Error::new(ErrorKind::Io)
        .with_message("no free backup name")
        .with_path(base)
        .with_table(table.name()))
}

/// Writes the committed rows to `path` as flat tabular text; returns the
/// number of data rows written.
pub fn export(table: &Table, path: &Path, format: ExportFormat) -> Result<usize, Error> {
    let rows = table.committed_rows();
    let text = render(rows, format);
    codec::write_atomic(path, text.as_bytes()).map_err(|err| err.with_table(table.name()))?;
    Ok(rows.len())
}

/// Union of field names in order of first appearance.
pub fn columns(rows: &[Record]) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for row in rows {
        for (name, _) in row.fields() {
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

/// Renders a header row plus one line per record; missing fields are blank.
pub fn render(rows: &[Record], format: ExportFormat) -> String {
    let columns = columns(rows);
    let delimiter = format.delimiter().to_string();
    let mut out = String::new();
    if columns.is_empty() {
        return out;
    }
    let header: Vec<String> = columns.iter().map(|name| format.escape(name)).collect();
    out.push_str(&header.join(&delimiter));
    out.push('\n');
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|name| {
                row.get(name)
                    .map(|value| format.escape(&value.to_cell()))
                    .unwrap_or_default()
            })
            .collect();
        out.push_str(&cells.join(&delimiter));
        out.push('\n');
    }
    out
}
