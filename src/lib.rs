pub mod buffer_pool;

pub mod catalog;

pub mod engine;

pub mod error;

pub mod heap_file;

pub mod lock_manager;

pub mod page;

pub mod transaction;

pub mod tuple;

pub mod types;

pub mod wal;

/// Bytes per page unless an engine is configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages the buffer pool may hold.
pub const DEFAULT_POOL_CAPACITY: usize = 500;

pub type TableId = u32;

pub use engine::{Engine, EngineConfig};
pub use error::{DbError, DbResult};
pub use page::{HeapPage, PageId};
pub use transaction::{Permission, TransactionId};
pub use tuple::{Tuple, TupleDesc};

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("STRATA_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! strata_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}
