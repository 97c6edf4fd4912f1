use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::schema::TypeTag;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    TableNotFound,
    TableAlreadyExists,
    SchemaViolation,
    DuplicateKey,
    TransactionAlreadyOpen,
    NoOpenTransaction,
    CommitFailed,
    Busy,
    Permission,
    Corrupt,
    Io,
}

/// A present field whose runtime type disagrees with the declared type tag.
///
/// `expected` is `None` when the field is unknown to a strict schema.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Violation {
    pub field: String,
    pub expected: Option<TypeTag>,
    pub actual: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected {
            Some(expected) => write!(
                f,
                "field '{}' must be of type {}, got {}",
                self.field,
                expected.name(),
                self.actual
            ),
            None => write!(f, "field '{}' is not declared by the strict schema", self.field),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    table: Option<String>,
    violation: Option<Violation>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            table: None,
            violation: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn violation(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_violation(mut self, violation: Violation) -> Self {
        if self.message.is_none() {
            self.message = Some(violation.to_string());
        }
        self.violation = Some(violation);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Wraps a failed flush so the caller sees `CommitFailed` with the flush
    /// error preserved as the source.
    pub(crate) fn commit_failed(cause: Error) -> Self {
        let table = cause.table.clone();
        let path = cause.path.clone();
        let mut err = Error::new(ErrorKind::CommitFailed)
            .with_message("commit flush failed; transaction is still open")
            .with_hint("Retry the commit or roll the transaction back.");
        err.table = table;
        err.path = path;
        err.with_source(cause)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::TableNotFound => 3,
        ErrorKind::TableAlreadyExists => 4,
        ErrorKind::Busy => 5,
        ErrorKind::Permission => 6,
        ErrorKind::Corrupt => 7,
        ErrorKind::Io => 8,
        ErrorKind::SchemaViolation => 9,
        ErrorKind::DuplicateKey => 10,
        ErrorKind::TransactionAlreadyOpen => 11,
        ErrorKind::NoOpenTransaction => 12,
        ErrorKind::CommitFailed => 13,
    }
}
