//! Heap files: one table stored as a flat sequence of fixed-size pages,
//! page number = byte offset / page size, no file-level header.

use crate::buffer_pool::{BufferPool, PageRef};
use crate::error::{DbError, DbResult};
use crate::page::{HeapPage, PageId};
use crate::transaction::{Permission, TransactionId};
use crate::tuple::{Tuple, TupleDesc};
use crate::TableId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct HeapFile {
    table_id: TableId,
    desc: TupleDesc,
    page_size: usize,
    file: Mutex<File>,
    path: PathBuf,
}

impl HeapFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        table_id: TableId,
        desc: TupleDesc,
        page_size: usize,
    ) -> DbResult<HeapFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(HeapFile {
            table_id,
            desc,
            page_size,
            file: Mutex::new(file),
            path,
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> DbResult<u32> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok((len / self.page_size as u64) as u32)
    }

    /// Reads and decodes one page. The page must exist in the file.
    pub fn read_page(&self, pid: PageId) -> DbResult<HeapPage> {
        if pid.table_id != self.table_id {
            return Err(DbError::InvalidOperation(format!(
                "page {pid:?} does not belong to table {}",
                self.table_id
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            let len = file.metadata()?.len();
            let offset = pid.page_no as u64 * self.page_size as u64;
            if offset + self.page_size as u64 > len {
                return Err(DbError::InvalidOperation(format!(
                    "page {} is beyond the end of table {}",
                    pid.page_no, self.table_id
                )));
            }
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        HeapPage::decode(pid, self.desc.clone(), &buf)
    }

    /// Writes a decoded page back to its slot in the file.
    pub fn write_page(&self, page: &HeapPage) -> DbResult<()> {
        self.write_page_bytes(page.id().page_no, &page.encode())
    }

    /// Writes raw page bytes at a page slot. Used by recovery, which
    /// installs before/after images without decoding them.
    pub fn write_page_bytes(&self, page_no: u32, data: &[u8]) -> DbResult<()> {
        if data.len() != self.page_size {
            return Err(DbError::InvalidOperation(format!(
                "page image is {} bytes, table {} uses {}-byte pages",
                data.len(),
                self.table_id,
                self.page_size
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Appends one empty page and returns its page number. Atomic with
    /// respect to concurrent appends on the same file.
    fn append_empty_page(&self) -> DbResult<u32> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_no = (len / self.page_size as u64) as u32;
        let empty = HeapPage::empty(
            PageId::new(self.table_id, page_no),
            self.desc.clone(),
            self.page_size,
        );
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&empty.encode())?;
        Ok(page_no)
    }

    /// Inserts the tuple into the first page with a free slot, growing
    /// the file by one empty page when every existing page is full.
    /// Returns the pages the operation modified.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        t: Tuple,
        pool: &BufferPool,
    ) -> DbResult<Vec<PageRef>> {
        loop {
            for page_no in 0..self.num_pages()? {
                let pid = PageId::new(self.table_id, page_no);
                let page = pool.get_page(tid, pid, Permission::ReadWrite)?;
                let (inserted, ours) = {
                    let mut guard = page.write();
                    if guard.free_slot_count() > 0 {
                        guard.insert_tuple(t.clone())?;
                        (true, true)
                    } else {
                        (false, guard.dirtied_by() == Some(tid))
                    }
                };
                if inserted {
                    return Ok(vec![page]);
                }
                // Full page we only probed: give the write lock back so
                // other transactions are not serialized behind the scan.
                // Pages this transaction already dirtied keep their lock.
                if !ours {
                    pool.release_page(tid, pid)?;
                }
            }
            // Every page is full: grow the file and try again. The loop
            // guards against another transaction filling the new page
            // between the append and our lock acquisition.
            let page_no = self.append_empty_page()?;
            let pid = PageId::new(self.table_id, page_no);
            let page = pool.get_page(tid, pid, Permission::ReadWrite)?;
            let inserted = {
                let mut guard = page.write();
                if guard.free_slot_count() > 0 {
                    guard.insert_tuple(t.clone())?;
                    true
                } else {
                    false
                }
            };
            if inserted {
                return Ok(vec![page]);
            }
        }
    }

    /// Removes the tuple from the page its record id names. Returns the
    /// pages the operation modified.
    pub fn delete_tuple(
        &self,
        tid: TransactionId,
        t: &Tuple,
        pool: &BufferPool,
    ) -> DbResult<Vec<PageRef>> {
        let rid = t
            .record_id()
            .ok_or_else(|| DbError::InvalidOperation("tuple is not on any page".into()))?;
        if rid.pid.table_id != self.table_id {
            return Err(DbError::InvalidOperation(format!(
                "tuple at {rid:?} does not belong to table {}",
                self.table_id
            )));
        }
        let page = pool.get_page(tid, rid.pid, Permission::ReadWrite)?;
        page.write().delete_tuple(t)?;
        Ok(vec![page])
    }

    /// Iterates every record in the file, page by page, fetching pages
    /// through the buffer pool under shared locks.
    pub fn scan<'a>(&'a self, tid: TransactionId, pool: &'a BufferPool) -> HeapFileScan<'a> {
        HeapFileScan {
            file: self,
            pool,
            tid,
            next_page: 0,
            buffered: VecDeque::new(),
        }
    }
}

pub struct HeapFileScan<'a> {
    file: &'a HeapFile,
    pool: &'a BufferPool,
    tid: TransactionId,
    next_page: u32,
    buffered: VecDeque<Tuple>,
}

impl Iterator for HeapFileScan<'_> {
    type Item = DbResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(t) = self.buffered.pop_front() {
                return Some(Ok(t));
            }
            let num_pages = match self.file.num_pages() {
                Ok(n) => n,
                Err(e) => return Some(Err(e)),
            };
            if self.next_page >= num_pages {
                return None;
            }
            let pid = PageId::new(self.file.table_id, self.next_page);
            self.next_page += 1;
            match self.pool.get_page(self.tid, pid, Permission::ReadOnly) {
                Ok(page) => {
                    let guard = page.read();
                    self.buffered.extend(guard.iter().cloned());
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
