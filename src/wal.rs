//! The write-ahead log: undo/redo recovery, rollback, checkpointing and
//! truncation over a single append-only file.
//!
//! File layout: an 8-byte header holding the offset of the most recent
//! checkpoint record (`u64::MAX` when none), then a sequence of records.
//! Each record is `[u32 kind][u64 tid][payload][u64 start-offset]`; the
//! trailing offset is the record's own start, so a reader positioned at a
//! record's end can step backwards without an index. Update payloads are
//! a before image then an after image of one page; checkpoint payloads
//! list the active transactions with the offsets of their begin records.
//!
//! Update records are appended without syncing. The log is forced on
//! commit and before any page flush, which is the whole write-ahead
//! discipline: a page never reaches its table file ahead of its log
//! records.

use crate::buffer_pool::BufferPool;
use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::page::{PageCategory, PageId};
use crate::transaction::TransactionId;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Header value meaning "no checkpoint has been taken".
const NO_CHECKPOINT: u64 = u64::MAX;
/// Transaction field of records that belong to no transaction.
const NO_TID: u64 = u64::MAX;
/// Bytes before the first record: the checkpoint pointer.
const HEADER_LEN: u64 = 8;

/// Tag for a serialized page image.
const PAGE_CLASS_HEAP: u8 = 1;
/// Tag for a serialized page identifier.
const ID_CLASS_PAGE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Abort,
    Commit,
    Update,
    Begin,
    Checkpoint,
}

impl RecordKind {
    fn tag(self) -> u32 {
        match self {
            RecordKind::Abort => 1,
            RecordKind::Commit => 2,
            RecordKind::Update => 3,
            RecordKind::Begin => 4,
            RecordKind::Checkpoint => 5,
        }
    }

    fn from_tag(tag: u32) -> DbResult<RecordKind> {
        match tag {
            1 => Ok(RecordKind::Abort),
            2 => Ok(RecordKind::Commit),
            3 => Ok(RecordKind::Update),
            4 => Ok(RecordKind::Begin),
            5 => Ok(RecordKind::Checkpoint),
            other => Err(DbError::Format(format!("unknown log record tag {other}"))),
        }
    }
}

struct LogInner {
    file: File,
    /// File length; the start offset of the next record.
    current_offset: u64,
    /// Offset of the begin record of every live transaction.
    first_record: HashMap<u64, u64>,
    total_records: usize,
}

impl LogInner {
    fn append(&mut self, kind: RecordKind, tid: u64, payload: &[u8]) -> DbResult<u64> {
        let start = self.current_offset;
        let mut buf = BytesMut::with_capacity(20 + payload.len());
        buf.put_u32(kind.tag());
        buf.put_u64(tid);
        buf.put_slice(payload);
        buf.put_u64(start);
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&buf)?;
        self.current_offset = start + buf.len() as u64;
        self.total_records += 1;
        Ok(start)
    }

    fn force(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

pub struct LogFile {
    path: PathBuf,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    inner: Mutex<LogInner>,
}

impl LogFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        catalog: Arc<Catalog>,
        pool: Arc<BufferPool>,
    ) -> DbResult<LogFile> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if len < HEADER_LEN {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&NO_CHECKPOINT.to_be_bytes())?;
            len = HEADER_LEN;
        }
        Ok(LogFile {
            path,
            catalog,
            pool,
            inner: Mutex::new(LogInner {
                file,
                current_offset: len,
                first_record: HashMap::new(),
                total_records: 0,
            }),
        })
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().total_records
    }

    /// Records the start of a transaction. Every later record of the
    /// transaction is found by scanning forward from here.
    pub fn log_begin(&self, tid: TransactionId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.first_record.contains_key(&tid.id()) {
            return Err(DbError::InvalidOperation(format!(
                "transaction {} already has a begin record",
                tid.id()
            )));
        }
        let start = inner.append(RecordKind::Begin, tid.id(), &[])?;
        inner.first_record.insert(tid.id(), start);
        Ok(())
    }

    /// Appends an update record carrying before and after images of one
    /// page. Not forced; commit or a page flush will force it.
    pub fn log_update(
        &self,
        tid: TransactionId,
        pid: PageId,
        before: &[u8],
        after: &[u8],
    ) -> DbResult<()> {
        let mut payload = BytesMut::with_capacity(2 * (before.len() + 32));
        put_page_image(&mut payload, pid, before);
        put_page_image(&mut payload, pid, after);
        let mut inner = self.inner.lock();
        inner.append(RecordKind::Update, tid.id(), &payload)?;
        Ok(())
    }

    /// Appends a commit record and forces the log. Once this returns the
    /// transaction is durable regardless of which pages have been flushed.
    pub fn log_commit(&self, tid: TransactionId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        inner.append(RecordKind::Commit, tid.id(), &[])?;
        inner.force()?;
        inner.first_record.remove(&tid.id());
        Ok(())
    }

    /// Rolls the transaction's pages back to their before images, then
    /// appends an abort record and forces the log.
    pub fn log_abort(&self, tid: TransactionId) -> DbResult<()> {
        let _gate = self.pool.flush_gate();
        let mut inner = self.inner.lock();
        self.rollback_locked(&mut inner, tid)?;
        inner.append(RecordKind::Abort, tid.id(), &[])?;
        inner.force()?;
        inner.first_record.remove(&tid.id());
        Ok(())
    }

    /// Restores the before image of every page the transaction updated,
    /// earliest image per page winning, and discards its cached copies.
    /// The transaction's locks are untouched; completion handles those.
    pub fn rollback(&self, tid: TransactionId) -> DbResult<()> {
        let _gate = self.pool.flush_gate();
        let mut inner = self.inner.lock();
        self.rollback_locked(&mut inner, tid)
    }

    fn rollback_locked(&self, inner: &mut LogInner, tid: TransactionId) -> DbResult<()> {
        let raw = tid.id();
        let first = *inner.first_record.get(&raw).ok_or_else(|| {
            DbError::InvalidOperation(format!("transaction {raw} has no begin record"))
        })?;
        inner.file.seek(SeekFrom::Start(first))?;
        let kind = RecordKind::from_tag(read_u32(&mut inner.file)?)?;
        if kind != RecordKind::Begin {
            return Err(DbError::RecoveryInconsistency(format!(
                "offset {first} does not hold a begin record"
            )));
        }
        let rec_tid = read_u64(&mut inner.file)?;
        if rec_tid != raw {
            return Err(DbError::RecoveryInconsistency(format!(
                "begin record at offset {first} belongs to transaction {rec_tid}, not {raw}"
            )));
        }
        read_u64(&mut inner.file)?; // trailing start offset

        // Forward scan: the first update per page carries the image from
        // before the transaction touched it.
        let mut restored: HashSet<PageId> = HashSet::new();
        loop {
            let kind = match try_read_tag(&mut inner.file)? {
                Some(kind) => kind,
                None => break,
            };
            let rec_tid = read_u64(&mut inner.file)?;
            match kind {
                RecordKind::Update => {
                    let (pid, before) = read_page_image(&mut inner.file)?;
                    read_page_image(&mut inner.file)?; // after image
                    if rec_tid == raw && restored.insert(pid) {
                        crate::strata_debug_log!("[wal] rolling back {:?} for tid {}", pid, raw);
                        let file = self.catalog.table_file(pid.table_id)?;
                        file.write_page_bytes(pid.page_no, &before)?;
                        self.pool.discard_page(pid);
                    }
                }
                RecordKind::Checkpoint => skip_checkpoint_payload(&mut inner.file)?,
                _ => {}
            }
            read_u64(&mut inner.file)?; // trailing start offset
        }
        Ok(())
    }

    /// Flushes the log and every dirty page, then appends a checkpoint
    /// record listing the live transactions, updates the header pointer
    /// and truncates the prefix no recovery could need.
    pub fn checkpoint(&self) -> DbResult<()> {
        let _gate = self.pool.flush_gate();
        self.inner.lock().force()?;
        // The pool forces the log itself before each write, so the log
        // mutex must be free here.
        self.pool.flush_all_pages()?;

        let mut inner = self.inner.lock();
        let active: Vec<(u64, u64)> = inner
            .first_record
            .iter()
            .map(|(tid, first)| (*tid, *first))
            .collect();
        let mut payload = BytesMut::with_capacity(4 + active.len() * 16);
        payload.put_u32(active.len() as u32);
        for (tid, first) in &active {
            payload.put_u64(*tid);
            payload.put_u64(*first);
        }
        let cp_start = inner.append(RecordKind::Checkpoint, NO_TID, &payload)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&cp_start.to_be_bytes())?;
        inner.force()?;
        self.truncate_locked(&mut inner)
    }

    /// Drops every record before the oldest one the latest checkpoint can
    /// still need: the earliest begin record among its live transactions.
    /// The survivors are rewritten with rebased offsets.
    pub fn truncate(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        self.truncate_locked(&mut inner)
    }

    fn truncate_locked(&self, inner: &mut LogInner) -> DbResult<()> {
        inner.file.seek(SeekFrom::Start(0))?;
        let cp = read_u64(&mut inner.file)?;
        if cp == NO_CHECKPOINT {
            return Ok(());
        }
        inner.file.seek(SeekFrom::Start(cp))?;
        let kind = RecordKind::from_tag(read_u32(&mut inner.file)?)?;
        if kind != RecordKind::Checkpoint {
            return Err(DbError::RecoveryInconsistency(format!(
                "checkpoint pointer {cp} does not name a checkpoint record"
            )));
        }
        read_u64(&mut inner.file)?; // NO_TID
        let count = read_u32(&mut inner.file)?;
        let mut keep_from = cp;
        for _ in 0..count {
            read_u64(&mut inner.file)?; // tid
            let first = read_u64(&mut inner.file)?;
            keep_from = keep_from.min(first);
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&(cp - keep_from + HEADER_LEN).to_be_bytes())?;

        inner.file.seek(SeekFrom::Start(keep_from))?;
        let mut new_offset = HEADER_LEN;
        let mut rebased: HashMap<u64, u64> = HashMap::new();
        loop {
            let kind = match try_read_tag(&mut inner.file)? {
                Some(kind) => kind,
                None => break,
            };
            let tid = read_u64(&mut inner.file)?;
            let mut payload = BytesMut::new();
            match kind {
                RecordKind::Update => {
                    let (pid, before) = read_page_image(&mut inner.file)?;
                    let (_, after) = read_page_image(&mut inner.file)?;
                    put_page_image(&mut payload, pid, &before);
                    put_page_image(&mut payload, pid, &after);
                }
                RecordKind::Checkpoint => {
                    let count = read_u32(&mut inner.file)?;
                    payload.put_u32(count);
                    for _ in 0..count {
                        let t = read_u64(&mut inner.file)?;
                        let first = read_u64(&mut inner.file)?;
                        payload.put_u64(t);
                        payload.put_u64(first - keep_from + HEADER_LEN);
                    }
                }
                _ => {}
            }
            read_u64(&mut inner.file)?; // old start offset
            if kind == RecordKind::Begin {
                rebased.insert(tid, new_offset);
            }
            let mut buf = BytesMut::with_capacity(20 + payload.len());
            buf.put_u32(kind.tag());
            buf.put_u64(tid);
            buf.put_slice(&payload);
            buf.put_u64(new_offset);
            tmp.write_all(&buf)?;
            new_offset += buf.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.current_offset = file.metadata()?.len();
        inner.file = file;
        for (tid, first) in inner.first_record.iter_mut() {
            if let Some(new_first) = rebased.get(tid) {
                *first = *new_first;
            }
        }
        crate::strata_debug_log!(
            "[wal] truncated, kept {} bytes",
            inner.current_offset - HEADER_LEN
        );
        Ok(())
    }

    /// Replays the log after a crash: transactions without a commit
    /// record lose, transactions with one win. Losers' pages revert to
    /// their before images; winners' updates are reapplied from their
    /// after images. Run once at startup, after tables are registered.
    /// Ends with a checkpoint, so the replayed records are retired
    /// rather than left in the log.
    pub fn recover(&self) -> DbResult<()> {
        {
            let _gate = self.pool.flush_gate();
            let mut inner = self.inner.lock();
            self.recover_locked(&mut inner)?;
        }
        // Transaction ids restart at zero in a new process. Truncating
        // here keeps a stale begin or update record from ever being
        // attributed to a later transaction that reuses the number.
        self.checkpoint()
    }

    fn recover_locked(&self, inner: &mut LogInner) -> DbResult<()> {

        inner.file.seek(SeekFrom::Start(0))?;
        let cp = read_u64(&mut inner.file)?;
        let mut losers: HashMap<u64, u64> = HashMap::new();
        if cp != NO_CHECKPOINT {
            inner.file.seek(SeekFrom::Start(cp))?;
            let kind = RecordKind::from_tag(read_u32(&mut inner.file)?)?;
            if kind != RecordKind::Checkpoint {
                return Err(DbError::RecoveryInconsistency(format!(
                    "checkpoint pointer {cp} does not name a checkpoint record"
                )));
            }
            read_u64(&mut inner.file)?; // NO_TID
            let count = read_u32(&mut inner.file)?;
            for _ in 0..count {
                let tid = read_u64(&mut inner.file)?;
                let first = read_u64(&mut inner.file)?;
                losers.insert(tid, first);
            }
            read_u64(&mut inner.file)?; // trailing start offset
        }

        // Scan the tail (the whole log when no checkpoint exists) keeping
        // the loser set current. A commit clears its transaction; an
        // abort does not, so an already-rolled-back transaction is rolled
        // back again (idempotent) rather than redone.
        loop {
            let kind = match try_read_tag(&mut inner.file)? {
                Some(kind) => kind,
                None => break,
            };
            let tid = read_u64(&mut inner.file)?;
            match kind {
                RecordKind::Update => {
                    read_page_image(&mut inner.file)?;
                    read_page_image(&mut inner.file)?;
                }
                RecordKind::Checkpoint => skip_checkpoint_payload(&mut inner.file)?,
                _ => {}
            }
            let start = read_u64(&mut inner.file)?;
            match kind {
                RecordKind::Begin => {
                    losers.insert(tid, start);
                }
                RecordKind::Commit => {
                    losers.remove(&tid);
                }
                _ => {}
            }
        }

        crate::strata_debug_log!("[wal] recovery found {} loser(s)", losers.len());
        inner.first_record = losers.clone();
        for &tid in losers.keys() {
            self.rollback_locked(&mut *inner, TransactionId::from_raw(tid))?;
        }
        inner.first_record.clear();

        // Redo pass: reapply every update of a committed transaction.
        inner.file.seek(SeekFrom::Start(HEADER_LEN))?;
        loop {
            let kind = match try_read_tag(&mut inner.file)? {
                Some(kind) => kind,
                None => break,
            };
            let tid = read_u64(&mut inner.file)?;
            match kind {
                RecordKind::Update => {
                    read_page_image(&mut inner.file)?;
                    let (pid, after) = read_page_image(&mut inner.file)?;
                    if !losers.contains_key(&tid) {
                        let file = self.catalog.table_file(pid.table_id)?;
                        file.write_page_bytes(pid.page_no, &after)?;
                        self.pool.discard_page(pid);
                    }
                }
                RecordKind::Checkpoint => skip_checkpoint_payload(&mut inner.file)?,
                _ => {}
            }
            read_u64(&mut inner.file)?;
        }
        Ok(())
    }

    /// Syncs the log to stable storage.
    pub fn force(&self) -> DbResult<()> {
        self.inner.lock().force()
    }
}

/// Serializes a page image as a tagged page identifier followed by the
/// length-prefixed raw bytes. The tags keep the format closed: a reader
/// rejects classes it does not know instead of guessing.
fn put_page_image(buf: &mut BytesMut, pid: PageId, data: &[u8]) {
    buf.put_u8(PAGE_CLASS_HEAP);
    buf.put_u8(ID_CLASS_PAGE);
    buf.put_u32(3); // id fields: table, page number, category
    buf.put_u32(pid.table_id);
    buf.put_u32(pid.page_no);
    buf.put_u32(category_tag(pid.category));
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn read_page_image(file: &mut File) -> DbResult<(PageId, Vec<u8>)> {
    let page_class = read_u8(file)?;
    if page_class != PAGE_CLASS_HEAP {
        return Err(DbError::Format(format!(
            "unknown page class tag {page_class}"
        )));
    }
    let id_class = read_u8(file)?;
    if id_class != ID_CLASS_PAGE {
        return Err(DbError::Format(format!(
            "unknown page id class tag {id_class}"
        )));
    }
    let fields = read_u32(file)?;
    if fields != 3 {
        return Err(DbError::Format(format!(
            "page id carries {fields} fields, expected 3"
        )));
    }
    let table_id = read_u32(file)?;
    let page_no = read_u32(file)?;
    let category = category_from_tag(read_u32(file)?)?;
    let len = read_u32(file)? as usize;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).map_err(truncated)?;
    Ok((PageId::with_category(table_id, page_no, category), data))
}

fn skip_checkpoint_payload(file: &mut File) -> DbResult<()> {
    let count = read_u32(file)?;
    for _ in 0..count {
        read_u64(file)?;
        read_u64(file)?;
    }
    Ok(())
}

fn category_tag(category: PageCategory) -> u32 {
    match category {
        PageCategory::Heap => 0,
        PageCategory::Index => 1,
    }
}

fn category_from_tag(tag: u32) -> DbResult<PageCategory> {
    match tag {
        0 => Ok(PageCategory::Heap),
        1 => Ok(PageCategory::Index),
        other => Err(DbError::Format(format!("unknown page category tag {other}"))),
    }
}

/// Reads a record tag, or None on a clean end of file. An EOF inside a
/// record body is a format error, not a clean end.
fn try_read_tag(file: &mut File) -> DbResult<Option<RecordKind>> {
    let mut buf = [0u8; 4];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(Some(RecordKind::from_tag(u32::from_be_bytes(buf))?)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_u8(file: &mut File) -> DbResult<u8> {
    let mut buf = [0u8; 1];
    file.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf[0])
}

fn read_u32(file: &mut File) -> DbResult<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(file: &mut File) -> DbResult<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_be_bytes(buf))
}

fn truncated(e: std::io::Error) -> DbError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DbError::Format("log record is truncated".into())
    } else {
        DbError::Io(e)
    }
}
