//! The page cache. All page access goes through [`BufferPool::get_page`],
//! which acquires the page lock before touching the cache, so lock scope
//! and cache residency stay decoupled: a page may be evicted while locked
//! and re-read later without breaking two-phase locking.
//!
//! Lock ordering, outermost first: the flush gate, then any page's
//! read/write lock, then the log file's internal mutex, then the cache
//! map mutex. The cache mutex is never held across file I/O initiated by
//! a flush, and never while a page guard is being taken, except inside
//! `get_page` itself where the read happens under the map mutex so two
//! threads cannot load the same page twice.

use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::lock_manager::LockManager;
use crate::page::{HeapPage, PageId};
use crate::transaction::{Permission, TransactionId};
use crate::tuple::Tuple;
use crate::wal::LogFile;
use crate::TableId;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

pub type PageRef = Arc<RwLock<HeapPage>>;

struct Frame {
    page: PageRef,
    /// Access count, the eviction key: the least-touched clean page goes
    /// first.
    hits: u64,
}

pub struct BufferPool {
    capacity: usize,
    catalog: Arc<Catalog>,
    locks: LockManager,
    cache: Mutex<HashMap<PageId, Frame>>,
    /// Serializes transaction completion against checkpointing so a
    /// checkpoint never observes a half-flushed commit.
    flush_gate: Mutex<()>,
    /// Back-reference to the log, set once at engine wiring time. Weak,
    /// because the log holds a strong reference to the pool.
    wal: OnceLock<Weak<LogFile>>,
}

impl BufferPool {
    pub fn new(catalog: Arc<Catalog>, capacity: usize) -> Self {
        BufferPool {
            capacity,
            catalog,
            locks: LockManager::new(),
            cache: Mutex::new(HashMap::new()),
            flush_gate: Mutex::new(()),
            wal: OnceLock::new(),
        }
    }

    /// Wires the log file in after construction. Called exactly once.
    pub fn attach_wal(&self, wal: &Arc<LogFile>) {
        let _ = self.wal.set(Arc::downgrade(wal));
    }

    fn wal(&self) -> Option<Arc<LogFile>> {
        self.wal.get().and_then(Weak::upgrade)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn flush_gate(&self) -> MutexGuard<'_, ()> {
        self.flush_gate.lock()
    }

    /// Fetches a page on behalf of a transaction, blocking for the page
    /// lock first. Cache misses read through the catalog's table file,
    /// evicting the least-touched clean page when the pool is full.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permission,
    ) -> DbResult<PageRef> {
        self.locks.acquire(tid, pid, perm.into())?;

        let mut cache = self.cache.lock();
        if let Some(frame) = cache.get_mut(&pid) {
            frame.hits += 1;
            return Ok(frame.page.clone());
        }

        if cache.len() >= self.capacity {
            self.evict(&mut cache)?;
        }
        let file = self.catalog.table_file(pid.table_id)?;
        let page = Arc::new(RwLock::new(file.read_page(pid)?));
        cache.insert(
            pid,
            Frame {
                page: page.clone(),
                hits: 1,
            },
        );
        Ok(page)
    }

    /// Drops the least-touched clean page. Dirty pages are pinned until
    /// their transaction completes; if nothing clean remains the caller's
    /// request fails rather than flushing uncommitted data.
    fn evict(&self, cache: &mut HashMap<PageId, Frame>) -> DbResult<()> {
        let victim = cache
            .iter()
            .filter(|(_, frame)| frame.page.read().dirtied_by().is_none())
            .min_by_key(|(_, frame)| frame.hits)
            .map(|(pid, _)| *pid);
        match victim {
            Some(pid) => {
                crate::strata_debug_log!("[pool] evicting clean page {:?}", pid);
                cache.remove(&pid);
                Ok(())
            }
            None => Err(DbError::ResourceExhausted(
                "no clean page to evict".into(),
            )),
        }
    }

    /// Inserts a tuple into a table, logging an update record and marking
    /// every modified page dirty.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: TableId,
        t: Tuple,
    ) -> DbResult<()> {
        let file = self.catalog.table_file(table_id)?;
        let pages = file.insert_tuple(tid, t, self)?;
        self.note_dirtied(tid, &pages)
    }

    /// Deletes a tuple from the page its record id names.
    pub fn delete_tuple(&self, tid: TransactionId, t: &Tuple) -> DbResult<()> {
        let rid = t
            .record_id()
            .ok_or_else(|| DbError::InvalidOperation("tuple is not on any page".into()))?;
        let file = self.catalog.table_file(rid.pid.table_id)?;
        let pages = file.delete_tuple(tid, t, self)?;
        self.note_dirtied(tid, &pages)
    }

    /// Logs an update record per modified page, then marks it dirty and
    /// reinstalls it in the cache, overwriting any stale copy left by an
    /// earlier eviction.
    ///
    /// The record is assembled after the in-memory edit, since its after
    /// image is the edited page. Write-ahead still holds: the page is
    /// not dirty until its record has been appended, only dirty pages
    /// are flushed, and every flush forces the log first.
    fn note_dirtied(&self, tid: TransactionId, pages: &[PageRef]) -> DbResult<()> {
        for page in pages {
            let (pid, before, after) = {
                let guard = page.read();
                (guard.id(), guard.before_image().to_vec(), guard.encode())
            };
            if let Some(wal) = self.wal() {
                wal.log_update(tid, pid, &before, &after)?;
            }
            page.write().mark_dirty(Some(tid));
            let mut cache = self.cache.lock();
            match cache.get_mut(&pid) {
                Some(frame) if Arc::ptr_eq(&frame.page, page) => {}
                Some(frame) => {
                    frame.page = page.clone();
                    frame.hits += 1;
                }
                None => {
                    cache.insert(
                        pid,
                        Frame {
                            page: page.clone(),
                            hits: 1,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Writes one page to its table file if dirty. Forces the log first
    /// so the page's update record is durable before the page itself.
    /// Does not sync the table file; durability comes from the log.
    pub fn flush_page(&self, pid: PageId) -> DbResult<()> {
        let page = match self.cache.lock().get(&pid) {
            Some(frame) => frame.page.clone(),
            None => return Ok(()),
        };
        let mut guard = page.write();
        if guard.dirtied_by().is_none() {
            return Ok(());
        }
        if let Some(wal) = self.wal() {
            wal.force()?;
        }
        let file = self.catalog.table_file(pid.table_id)?;
        file.write_page(&guard)?;
        guard.mark_dirty(None);
        // The flushed bytes are the new rollback baseline.
        guard.set_before_image();
        Ok(())
    }

    /// Flushes every dirty page in the pool. Checkpoint support only;
    /// never part of normal eviction.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        let pids: Vec<PageId> = self.cache.lock().keys().copied().collect();
        for pid in pids {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    /// Flushes the pages a particular transaction dirtied.
    pub fn flush_pages(&self, tid: TransactionId) -> DbResult<()> {
        for pid in self.pages_dirtied_by(tid) {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    fn pages_dirtied_by(&self, tid: TransactionId) -> Vec<PageId> {
        self.cache
            .lock()
            .iter()
            .filter(|(_, frame)| frame.page.read().dirtied_by() == Some(tid))
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Drops a page from the cache without writing it. Rollback uses this
    /// after restoring the on-disk image, so the next access re-reads it.
    pub fn discard_page(&self, pid: PageId) {
        self.cache.lock().remove(&pid);
    }

    /// Releases one page lock before the transaction completes. Breaks
    /// two-phase locking; only safe on pages the transaction inspected
    /// but did not modify.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) -> DbResult<()> {
        self.locks.release(tid, pid)
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds(tid, pid)
    }

    /// Finishes a transaction at the pool level: on commit its dirty
    /// pages are flushed, on abort they are re-read from disk, and in
    /// both cases all its locks are released. Log records are the
    /// caller's responsibility and must be written first.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> DbResult<()> {
        let _gate = self.flush_gate.lock();
        if commit {
            self.flush_pages(tid)?;
        } else {
            for pid in self.pages_dirtied_by(tid) {
                let file = self.catalog.table_file(pid.table_id)?;
                let fresh = Arc::new(RwLock::new(file.read_page(pid)?));
                if let Some(frame) = self.cache.lock().get_mut(&pid) {
                    frame.page = fresh;
                }
            }
        }
        self.locks.release_all(tid);
        Ok(())
    }
}
