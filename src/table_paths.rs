//! Purpose: Shared table-directory and table-name path resolution helpers.
//! Exports: `default_table_dir`, `resolve_named_table_path`, `TABLE_EXTENSION`.
//! Role: Keep CLI, server, and catalog path semantics aligned from one source.
//! Invariants: Default table directory remains `~/.tabula/tables`.
//! Invariants: Table names are non-empty, never start with `.`, and contain no path separators.

use std::path::{Path, PathBuf};

pub const TABLE_EXTENSION: &str = "tabula";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TableNameResolveError {
    Empty,
    LeadingDot,
    ContainsPathSeparator,
}

pub fn default_table_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".tabula").join("tables")
}

pub(crate) fn resolve_named_table_path(
    name: &str,
    table_dir: &Path,
) -> Result<PathBuf, TableNameResolveError> {
    if name.is_empty() {
        return Err(TableNameResolveError::Empty);
    }
    if name.starts_with('.') {
        return Err(TableNameResolveError::LeadingDot);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TableNameResolveError::ContainsPathSeparator);
    }
    Ok(table_dir.join(format!("{name}.{TABLE_EXTENSION}")))
}

/// Table name for a durable file, if `path` looks like one.
pub(crate) fn table_name_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}
