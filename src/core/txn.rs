// Per-table transaction state machine: Idle -> Open -> (commit | rollback) -> Idle.
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Record;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Idle,
    Open,
}

/// Working copy of a table's rows while a transaction is open.
#[derive(Clone, Debug)]
pub struct Transaction {
    working: Vec<Record>,
    dirty: bool,
}

impl Transaction {
    fn begin(committed: &[Record]) -> Self {
        Self {
            working: committed.to_vec(),
            dirty: false,
        }
    }

    pub fn rows(&self) -> &[Record] {
        &self.working
    }

    /// True once any mutation has touched the working copy.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Holds at most one open transaction for a table.
#[derive(Debug, Default)]
pub(crate) struct TxnSlot {
    open: Option<Transaction>,
}

impl TxnSlot {
    pub(crate) fn state(&self) -> TxnState {
        if self.open.is_some() {
            TxnState::Open
        } else {
            TxnState::Idle
        }
    }

    pub(crate) fn current(&self) -> Option<&Transaction> {
        self.open.as_ref()
    }

    pub(crate) fn working_mut(&mut self) -> Option<&mut Vec<Record>> {
        self.open.as_mut().map(|txn| &mut txn.working)
    }

    pub(crate) fn mark_dirty(&mut self) {
        if let Some(txn) = self.open.as_mut() {
            txn.dirty = true;
        }
    }

    pub(crate) fn begin(&mut self, committed: &[Record]) -> Result<(), Error> {
        if self.open.is_some() {
            return Err(Error::new(ErrorKind::TransactionAlreadyOpen)
                .with_message("a transaction is already open")
                .with_hint("Commit or roll back the open transaction first."));
        }
        self.open = Some(Transaction::begin(committed));
        Ok(())
    }

    /// Flushes the working copy with `flush` and, only if that succeeds,
    /// closes the transaction and hands the rows back as the new committed set.
    pub(crate) fn commit<F>(&mut self, flush: F) -> Result<Vec<Record>, Error>
    where
        F: FnOnce(&[Record]) -> Result<(), Error>,
    {
        let txn = self.open.as_ref().ok_or_else(no_open_transaction)?;
        flush(txn.rows()).map_err(Error::commit_failed)?;
        let txn = self.open.take().ok_or_else(no_open_transaction)?;
        Ok(txn.working)
    }

    pub(crate) fn rollback(&mut self) -> Result<Transaction, Error> {
        self.open.take().ok_or_else(no_open_transaction)
    }
}

fn no_open_transaction() -> Error {
    Error::new(ErrorKind::NoOpenTransaction)
        .with_message("no open transaction")
        .with_hint("Call begin before commit or rollback.")
}

#[cfg(test)]
mod tests {
    use super::{TxnSlot, TxnState};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::value::Record;

    fn rows() -> Vec<Record> {
        vec![Record::new().with("id", 1)]
    }

    #[test]
    fn begin_twice_is_rejected() {
        let mut slot = TxnSlot::default();
        slot.begin(&rows()).expect("begin");
        let err = slot.begin(&rows()).expect_err("nested");
        assert_eq!(err.kind(), ErrorKind::TransactionAlreadyOpen);
        assert_eq!(slot.state(), TxnState::Open);
    }

    #[test]
    fn commit_and_rollback_need_an_open_transaction() {
        let mut slot = TxnSlot::default();
        let err = slot.commit(|_| Ok(())).expect_err("commit");
        assert_eq!(err.kind(), ErrorKind::NoOpenTransaction);
        let err = slot.rollback().expect_err("rollback");
        assert_eq!(err.kind(), ErrorKind::NoOpenTransaction);
    }

    #[test]
    fn mutations_mark_dirty() {
        let mut slot = TxnSlot::default();
        slot.begin(&rows()).expect("begin");
        assert!(!slot.current().expect("open").is_dirty());
        slot.working_mut().expect("open").push(Record::new().with("id", 2));
        slot.mark_dirty();
        let txn = slot.current().expect("open");
        assert!(txn.is_dirty());
        assert_eq!(txn.rows().len(), 2);
    }

    #[test]
    fn failed_flush_keeps_transaction_open() {
        let mut slot = TxnSlot::default();
        slot.begin(&rows()).expect("begin");
        slot.working_mut().expect("open").clear();

        let err = slot
            .commit(|_| Err(Error::new(ErrorKind::Io).with_message("disk full")))
            .expect_err("flush failure");
        assert_eq!(err.kind(), ErrorKind::CommitFailed);
        assert_eq!(slot.state(), TxnState::Open);
        assert!(slot.current().expect("still open").rows().is_empty());

        let committed = slot.commit(|_| Ok(())).expect("retry");
        assert!(committed.is_empty());
        assert_eq!(slot.state(), TxnState::Idle);
    }

    #[test]
    fn rollback_returns_to_idle() {
        let mut slot = TxnSlot::default();
        slot.begin(&rows()).expect("begin");
        slot.rollback().expect("rollback");
        assert_eq!(slot.state(), TxnState::Idle);
        slot.begin(&rows()).expect("begin again");
    }
}
