//! Engine-wide error taxonomy.

use crate::page::PageId;
use crate::transaction::TransactionId;
use crate::TableId;
use std::fmt;
use std::io;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    /// The transaction must abort: it lost a lock race (timeout /
    /// suspected deadlock) or an I/O failure surfaced inside one of its
    /// operations. The caller is expected to run
    /// `transaction_complete(tid, false)`.
    TransactionAborted(TransactionId),
    /// Corrupt page or log bytes. Never silently replaced with defaults.
    Format(String),
    /// No clean page available to evict. Fatal to the requesting call.
    ResourceExhausted(String),
    /// The log contradicts itself (checkpoint pointer not at a checkpoint
    /// record, rollback target not a Begin record). Fatal to startup.
    RecoveryInconsistency(String),
    /// Contract violation: releasing a lock that was never granted.
    LockNotHeld(TransactionId, PageId),
    UnknownTable(TableId),
    /// Misuse of an otherwise healthy structure: inserting into a full
    /// page, a tuple-desc mismatch, a duplicate Begin record.
    InvalidOperation(String),
    Io(io::Error),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::TransactionAborted(tid) => {
                write!(f, "transaction {} aborted", tid.id())
            }
            DbError::Format(msg) => write!(f, "format error: {msg}"),
            DbError::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            DbError::RecoveryInconsistency(msg) => {
                write!(f, "recovery inconsistency: {msg}")
            }
            DbError::LockNotHeld(tid, pid) => write!(
                f,
                "transaction {} does not hold a lock on {:?}",
                tid.id(),
                pid
            ),
            DbError::UnknownTable(id) => write!(f, "unknown table {id}"),
            DbError::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            DbError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        DbError::Io(e)
    }
}
