// In-memory table: committed rows, optional schema, and the transaction overlay.
use std::fmt;
use std::path::Path;
use std::slice;

use crate::core::codec::{TableFile, TableStore};
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{self, Schema};
use crate::core::txn::{Transaction, TxnSlot, TxnState};
use crate::core::value::{Filter, Record, Value};

pub struct Table {
    name: String,
    schema: Option<Schema>,
    rows: Vec<Record>,
    txn: TxnSlot,
    store: Box<dyn TableStore>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("path", &self.store.path())
            .field("rows", &self.rows.len())
            .field("txn", &self.txn.state())
            .finish()
    }
}

/// Lazy scan over the visible rows that match a filter.
///
/// Clone it to restart the scan from the beginning.
#[derive(Clone, Debug)]
pub struct Select<'a> {
    rows: slice::Iter<'a, Record>,
    filter: &'a Filter,
}

impl<'a> Iterator for Select<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.rows.by_ref().find(|row| row.matches(filter))
    }
}

impl Table {
    /// Creates an empty table and writes its first durable file.
    pub fn create(
        name: impl Into<String>,
        schema: Option<Schema>,
        store: Box<dyn TableStore>,
    ) -> Result<Self, Error> {
        let name = name.into();
        store
            .save(schema.as_ref(), &[])
            .map_err(|err| err.with_table(name.clone()))?;
        Ok(Self {
            name,
            schema,
            rows: Vec::new(),
            txn: TxnSlot::default(),
            store,
        })
    }

    /// Loads a table from its store.
    pub fn open(name: impl Into<String>, store: Box<dyn TableStore>) -> Result<Self, Error> {
        let name = name.into();
        let TableFile { schema, rows } = store.load().map_err(|err| err.with_table(name.clone()))?;
        Ok(Self {
            name,
            schema,
            rows,
            txn: TxnSlot::default(),
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Rows visible to callers: the working copy while a transaction is open.
    pub fn rows(&self) -> &[Record] {
        match self.txn.current() {
            Some(txn) => txn.rows(),
            None => &self.rows,
        }
    }

    /// Rows as of the last successful flush, ignoring any open transaction.
    pub fn committed_rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    pub fn txn_state(&self) -> TxnState {
        self.txn.state()
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.state() == TxnState::Open
    }

    /// True while an open transaction holds unflushed mutations.
    pub fn is_dirty(&self) -> bool {
        self.txn.current().is_some_and(Transaction::is_dirty)
    }

    pub fn insert(&mut self, record: Record) -> Result<(), Error> {
        self.check(&record)?;
        self.mutate(|rows| {
            rows.push(record);
            Ok(((), true))
        })
    }

    /// Inserts `record` unless a visible row already holds the same non-null
    /// value in `key_column`.
    pub fn insert_unique(&mut self, record: Record, key_column: &str) -> Result<(), Error> {
        let key = match record.get(key_column) {
            Some(value) if !value.is_null() => value.clone(),
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("record has no value for key column '{key_column}'"))
                    .with_table(self.name.clone()));
            }
        };
        if self.rows().iter().any(|row| row.get(key_column) == Some(&key)) {
            return Err(Error::new(ErrorKind::DuplicateKey)
                .with_message(format!("duplicate entry for '{key_column}' = {key}"))
                .with_table(self.name.clone()));
        }
        self.insert(record)
    }

    pub fn select<'a>(&'a self, filter: &'a Filter) -> Select<'a> {
        Select {
            rows: self.rows().iter(),
            filter,
        }
    }

    /// Applies `changes` to every row matching `filter`. Every merged row is
    /// validated before any row changes; returns the number of rows updated.
    pub fn update(&mut self, filter: &Filter, changes: &Record) -> Result<usize, Error> {
        let mut merged = Vec::new();
        for (index, row) in self.rows().iter().enumerate() {
            if row.matches(filter) {
                let next = row.merged(changes);
                self.check(&next)?;
                merged.push((index, next));
            }
        }
        if merged.is_empty() {
            return Ok(0);
        }
        self.mutate(move |rows| {
            let count = merged.len();
            for (index, next) in merged {
                rows[index] = next;
            }
            Ok((count, true))
        })
    }

    /// Removes every row matching `filter`; returns the number removed.
    pub fn delete(&mut self, filter: &Filter) -> Result<usize, Error> {
        let matched = self.rows().iter().filter(|row| row.matches(filter)).count();
        if matched == 0 {
            return Ok(0);
        }
        self.mutate(|rows| {
            rows.retain(|row| !row.matches(filter));
            Ok((matched, true))
        })
    }

    pub fn begin(&mut self) -> Result<(), Error> {
        let name = &self.name;
        self.txn
            .begin(&self.rows)
            .map_err(|err| err.with_table(name.clone()))
    }

    /// Flushes the working copy and makes it the committed state. On a flush
    /// failure the transaction stays open and nothing committed changes.
    pub fn commit(&mut self) -> Result<(), Error> {
        let Self {
            name,
            schema,
            rows,
            txn,
            store,
        } = self;
        let committed = txn
            .commit(|working| store.save(schema.as_ref(), working))
            .map_err(|err| err.with_table(name.clone()))?;
        *rows = committed;
        Ok(())
    }

    /// Discards the working copy. Nothing is written.
    pub fn rollback(&mut self) -> Result<(), Error> {
        let name = &self.name;
        self.txn
            .rollback()
            .map(drop)
            .map_err(|err| err.with_table(name.clone()))
    }

    pub(crate) fn remove_file(&self) -> Result<(), Error> {
        self.store
            .remove()
            .map_err(|err| err.with_table(self.name.clone()))
    }

    fn check(&self, record: &Record) -> Result<(), Error> {
        // JSON has no spelling for NaN or infinities; they would reload as null.
        if let Some((field, _)) = record
            .fields()
            .find(|(_, value)| matches!(value, Value::Float(number) if !number.is_finite()))
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("field '{field}' holds a non-finite float"))
                .with_hint("Store NaN and infinities as strings or null.")
                .with_table(self.name.clone()));
        }
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        schema::validate(schema, record).map_err(|violation| {
            Error::new(ErrorKind::SchemaViolation)
                .with_violation(violation)
                .with_table(self.name.clone())
        })
    }

    /// Runs `op` against the working copy when a transaction is open.
    /// Otherwise runs it against a copy of the committed rows, flushes that
    /// copy, and only then swaps it in, so a failed flush changes nothing.
    fn mutate<T, F>(&mut self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Vec<Record>) -> Result<(T, bool), Error>,
    {
        if let Some(working) = self.txn.working_mut() {
            let (out, changed) = op(working)?;
            if changed {
                self.txn.mark_dirty();
            }
            return Ok(out);
        }

        let mut next = self.rows.clone();
        let (out, changed) = op(&mut next)?;
        if changed {
            self.store
                .save(self.schema.as_ref(), &next)
                .map_err(|err| err.with_table(self.name.clone()))?;
            self.rows = next;
        }
        Ok(out)
    }
}
