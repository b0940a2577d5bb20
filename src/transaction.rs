//! Transaction identity and access permissions.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(0);

/// A process-unique identifier for one unit of work. Carries no state
/// beyond its monotonically assigned number; everything a transaction
/// "owns" (locks, dirty pages, log records) is keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    /// Rebuilds an identifier from its raw number. Used by the log reader;
    /// never hand one of these to a live transaction.
    pub fn from_raw(id: u64) -> Self {
        TransactionId(id)
    }
}

/// Requested access level when fetching a page from the buffer pool.
/// Maps onto the lock manager's shared/exclusive modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}
