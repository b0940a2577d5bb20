//! The top-level handle tying catalog, buffer pool and log together.
//! Engines are plain values: a process can hold several, each over its
//! own data directory, which is how restart scenarios are tested.

use crate::buffer_pool::BufferPool;
use crate::catalog::Catalog;
use crate::error::DbResult;
use crate::heap_file::HeapFile;
use crate::transaction::TransactionId;
use crate::tuple::{Tuple, TupleDesc};
use crate::wal::LogFile;
use crate::{TableId, DEFAULT_PAGE_SIZE, DEFAULT_POOL_CAPACITY};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub page_size: usize,
    pub pool_capacity: usize,
}

impl EngineConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        EngineConfig {
            data_dir: data_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }
}

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    wal: Arc<LogFile>,
}

impl Engine {
    /// Opens (or creates) an engine over a data directory. Recovery is
    /// not run here: register the tables first, then call [`recover`].
    ///
    /// [`recover`]: Engine::recover
    pub fn open(config: EngineConfig) -> DbResult<Engine> {
        std::fs::create_dir_all(&config.data_dir)?;
        let catalog = Arc::new(Catalog::new());
        let pool = Arc::new(BufferPool::new(catalog.clone(), config.pool_capacity));
        let wal = Arc::new(LogFile::open(
            config.data_dir.join("engine.wal"),
            catalog.clone(),
            pool.clone(),
        )?);
        pool.attach_wal(&wal);
        Ok(Engine {
            config,
            catalog,
            pool,
            wal,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<LogFile> {
        &self.wal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates (or reopens) a table backed by `<name>.dat` in the data
    /// directory and registers it with the catalog.
    pub fn create_table(&self, name: &str, desc: TupleDesc) -> DbResult<TableId> {
        let id = self.catalog.next_table_id();
        let file = HeapFile::open(
            self.config.data_dir.join(format!("{name}.dat")),
            id,
            desc,
            self.config.page_size,
        )?;
        self.catalog.add_table(Arc::new(file), name);
        Ok(id)
    }

    /// Replays the log: undoes transactions without a commit record and
    /// reapplies those with one. Call once after table registration,
    /// before starting transactions.
    pub fn recover(&self) -> DbResult<()> {
        self.wal.recover()
    }

    /// Starts a transaction and writes its begin record.
    pub fn begin(&self) -> DbResult<TransactionId> {
        let tid = TransactionId::new();
        self.wal.log_begin(tid)?;
        Ok(tid)
    }

    /// Commits: forces the commit record to disk, flushes the
    /// transaction's pages and releases its locks.
    pub fn commit(&self, tid: TransactionId) -> DbResult<()> {
        self.wal.log_commit(tid)?;
        self.pool.transaction_complete(tid, true)
    }

    /// Aborts: rolls the transaction's pages back to their before
    /// images, then releases its locks.
    pub fn abort(&self, tid: TransactionId) -> DbResult<()> {
        self.wal.log_abort(tid)?;
        self.pool.transaction_complete(tid, false)
    }

    /// Takes a checkpoint and truncates the log prefix recovery can no
    /// longer need.
    pub fn checkpoint(&self) -> DbResult<()> {
        self.wal.checkpoint()
    }

    pub fn insert_tuple(&self, tid: TransactionId, table: TableId, t: Tuple) -> DbResult<()> {
        self.pool.insert_tuple(tid, table, t)
    }

    pub fn delete_tuple(&self, tid: TransactionId, t: &Tuple) -> DbResult<()> {
        self.pool.delete_tuple(tid, t)
    }
}
