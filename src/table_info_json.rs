//! Purpose: Shared table/record JSON serializers for CLI and HTTP serving paths.
//! Exports: `table_info_json`, `rows_json`, `error_json`.
//! Role: Keep result and error envelope shapes consistent across entry points.
//! Invariants: Stable key names for table info payloads.
//! Invariants: Optional keys (`schema`, `hint`, `path`, `table`, `violation`) are omitted when absent.

use serde_json::{Map, Value, json};
use std::error::Error as StdError;

use tabula::api::{Error, ErrorKind, Record, TableInfo};

pub(crate) fn table_info_json(info: &TableInfo) -> Value {
    let mut map = Map::new();
    map.insert("name".to_string(), json!(info.name));
    map.insert("path".to_string(), json!(info.path.display().to_string()));
    if let Some(schema) = &info.schema {
        map.insert("schema".to_string(), schema.to_json());
        map.insert("strict".to_string(), json!(schema.is_strict()));
    }
    map.insert("rows".to_string(), json!(info.rows));
    map.insert("committed_rows".to_string(), json!(info.committed_rows));
    map.insert("in_transaction".to_string(), json!(info.in_transaction));
    map.insert("dirty".to_string(), json!(info.dirty));
    Value::Object(map)
}

pub(crate) fn rows_json(rows: &[Record]) -> Value {
    Value::Array(rows.iter().map(Record::to_json).collect())
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::TableNotFound => "table not found".to_string(),
        ErrorKind::TableAlreadyExists => "table already exists".to_string(),
        ErrorKind::SchemaViolation => "schema violation".to_string(),
        ErrorKind::DuplicateKey => "duplicate key".to_string(),
        ErrorKind::TransactionAlreadyOpen => "transaction already open".to_string(),
        ErrorKind::NoOpenTransaction => "no open transaction".to_string(),
        ErrorKind::CommitFailed => "commit failed".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

pub(crate) fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(violation) = err.violation() {
        inner.insert(
            "violation".to_string(),
            json!({
                "field": violation.field,
                "expected": violation.expected.map(|tag| tag.name()),
                "actual": violation.actual,
            }),
        );
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
