//! The on-disk page layout and its codec.
//!
//! A page is `[header bitmap][slots * record bytes][zero padding]`. The
//! bitmap holds one bit per slot (bit set = slot occupied); the slot count
//! is derived from the page size and the record width so that bitmap and
//! records together never exceed the page.

use crate::error::{DbError, DbResult};
use crate::transaction::TransactionId;
use crate::tuple::{RecordId, Tuple, TupleDesc};
use crate::TableId;
use bytes::BytesMut;

/// Distinguishes heap pages from index pages sharing a lock table and
/// cache. The core engine only creates `Heap` pages; index structures
/// layered on top tag theirs `Index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCategory {
    Heap,
    Index,
}

/// Identifies one page of one table. The sole key into the page cache and
/// the lock table; equality and hashing are by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: TableId,
    pub page_no: u32,
    pub category: PageCategory,
}

impl PageId {
    pub fn new(table_id: TableId, page_no: u32) -> Self {
        PageId {
            table_id,
            page_no,
            category: PageCategory::Heap,
        }
    }

    pub fn with_category(table_id: TableId, page_no: u32, category: PageCategory) -> Self {
        PageId {
            table_id,
            page_no,
            category,
        }
    }
}

/// Number of record slots on a page:
/// `floor(page_size * 8 / (record_width * 8 + 1))`.
pub fn slots_per_page(page_size: usize, record_width: usize) -> usize {
    (page_size * 8) / (record_width * 8 + 1)
}

/// Number of bitmap bytes at the front of a page: `ceil(slots / 8)`.
pub fn header_size(num_slots: usize) -> usize {
    num_slots.div_ceil(8)
}

/// One fixed-size page of a heap file, decoded into its bitmap and
/// records. Carries its own dirtied-by transaction and the byte snapshot
/// taken at load (or last flush) that undo logging is built from.
#[derive(Debug, Clone)]
pub struct HeapPage {
    pid: PageId,
    desc: TupleDesc,
    page_size: usize,
    num_slots: usize,
    header: Vec<u8>,
    tuples: Vec<Option<Tuple>>,
    dirtied_by: Option<TransactionId>,
    before_image: Vec<u8>,
}

impl HeapPage {
    /// Decodes a page from its on-disk bytes. Fails with a format error if
    /// an occupied slot's record cannot be parsed.
    pub fn decode(pid: PageId, desc: TupleDesc, data: &[u8]) -> DbResult<HeapPage> {
        let page_size = data.len();
        let width = desc.byte_len();
        let num_slots = slots_per_page(page_size, width);
        let header_len = header_size(num_slots);
        if header_len + num_slots * width > page_size {
            return Err(DbError::Format(format!(
                "page of {page_size} bytes cannot hold {num_slots} slots of {width} bytes"
            )));
        }

        let header = data[..header_len].to_vec();
        let mut tuples = Vec::with_capacity(num_slots);
        let mut cursor = &data[header_len..];
        for slot in 0..num_slots {
            if bit(&header, slot) {
                let mut t = Tuple::parse(&desc, &mut cursor)?;
                t.set_record_id(Some(RecordId::new(pid, slot)));
                tuples.push(Some(t));
            } else {
                // Unused slots still occupy their width on disk.
                cursor = &cursor[width..];
                tuples.push(None);
            }
        }

        let mut page = HeapPage {
            pid,
            desc,
            page_size,
            num_slots,
            header,
            tuples,
            dirtied_by: None,
            before_image: Vec::new(),
        };
        page.before_image = page.encode();
        Ok(page)
    }

    /// A fresh all-empty page, as written when a heap file grows.
    pub fn empty(pid: PageId, desc: TupleDesc, page_size: usize) -> HeapPage {
        let zeroes = vec![0u8; page_size];
        // An all-zero buffer always decodes: every slot is unused.
        HeapPage::decode(pid, desc, &zeroes).expect("empty page must decode")
    }

    /// Serializes the page back to exactly `page_size` bytes. Inverse of
    /// `decode`: decoding the result yields an identical bitmap and
    /// record set.
    pub fn encode(&self) -> Vec<u8> {
        let width = self.desc.byte_len();
        let mut buf = BytesMut::with_capacity(self.page_size);
        buf.extend_from_slice(&self.header);
        for slot in 0..self.num_slots {
            match &self.tuples[slot] {
                Some(t) => t.serialize(&mut buf),
                None => buf.extend_from_slice(&vec![0u8; width]),
            }
        }
        buf.resize(self.page_size, 0);
        buf.to_vec()
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        bit(&self.header, slot)
    }

    pub fn free_slot_count(&self) -> usize {
        (0..self.num_slots)
            .filter(|&s| !self.is_slot_used(s))
            .count()
    }

    /// Places the tuple in the first unused slot (linear scan from slot 0)
    /// and stamps its record id.
    pub fn insert_tuple(&mut self, mut t: Tuple) -> DbResult<RecordId> {
        if t.desc() != &self.desc {
            return Err(DbError::InvalidOperation(
                "tuple schema does not match page schema".into(),
            ));
        }
        let slot = (0..self.num_slots)
            .find(|&s| !self.is_slot_used(s))
            .ok_or_else(|| DbError::InvalidOperation("page is full".into()))?;
        let rid = RecordId::new(self.pid, slot);
        t.set_record_id(Some(rid));
        set_bit(&mut self.header, slot, true);
        self.tuples[slot] = Some(t);
        Ok(rid)
    }

    /// Clears the tuple's slot. The tuple must carry a record id naming
    /// this page and an occupied slot.
    pub fn delete_tuple(&mut self, t: &Tuple) -> DbResult<()> {
        let rid = t
            .record_id()
            .ok_or_else(|| DbError::InvalidOperation("tuple is not on any page".into()))?;
        if rid.pid != self.pid || rid.slot >= self.num_slots || !self.is_slot_used(rid.slot) {
            return Err(DbError::InvalidOperation(format!(
                "tuple at {rid:?} is not on page {:?}",
                self.pid
            )));
        }
        set_bit(&mut self.header, rid.slot, false);
        self.tuples[rid.slot] = None;
        Ok(())
    }

    /// Iterates the records in occupied slots, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter().filter_map(|t| t.as_ref())
    }

    /// The transaction that last dirtied this page, or None if clean.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirtied_by
    }

    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirtied_by = tid;
    }

    /// Byte snapshot from load / last flush; the undo side of an update
    /// log record.
    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Re-snapshots the current content. Called after a flush so later
    /// transactions undo to the state just made durable.
    pub fn set_before_image(&mut self) {
        self.before_image = self.encode();
    }
}

fn bit(header: &[u8], i: usize) -> bool {
    header[i / 8] & (1 << (i % 8)) != 0
}

fn set_bit(header: &mut [u8], i: usize, value: bool) {
    if value {
        header[i / 8] |= 1 << (i % 8);
    } else {
        header[i / 8] &= !(1 << (i % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Field, FieldType};

    const PAGE_SIZE: usize = 256;

    fn desc() -> TupleDesc {
        TupleDesc::unnamed(vec![FieldType::Int, FieldType::Int])
    }

    fn tuple(a: i32, b: i32) -> Tuple {
        let mut t = Tuple::new(desc());
        t.set_field(0, Field::Int(a)).unwrap();
        t.set_field(1, Field::Int(b)).unwrap();
        t
    }

    #[test]
    fn test_slot_arithmetic() {
        // 256 bytes, 8-byte records: 2048 bits / 65 bits per slot = 31.
        assert_eq!(slots_per_page(PAGE_SIZE, 8), 31);
        assert_eq!(header_size(31), 4);
        // Bitmap plus records must fit.
        assert!(4 + 31 * 8 <= PAGE_SIZE);
    }

    #[test]
    fn test_empty_page_has_all_slots_free() {
        let page = HeapPage::empty(PageId::new(1, 0), desc(), PAGE_SIZE);
        assert_eq!(page.free_slot_count(), page.num_slots());
        assert_eq!(page.iter().count(), 0);
    }

    #[test]
    fn test_insert_fills_first_free_slot() {
        let mut page = HeapPage::empty(PageId::new(1, 0), desc(), PAGE_SIZE);
        let r0 = page.insert_tuple(tuple(1, 2)).unwrap();
        let r1 = page.insert_tuple(tuple(3, 4)).unwrap();
        assert_eq!(r0.slot, 0);
        assert_eq!(r1.slot, 1);

        // Free slot 0; the next insert reuses it.
        let t0 = page.iter().next().unwrap().clone();
        page.delete_tuple(&t0).unwrap();
        let r2 = page.insert_tuple(tuple(5, 6)).unwrap();
        assert_eq!(r2.slot, 0);
    }

    #[test]
    fn test_insert_into_full_page_fails() {
        let mut page = HeapPage::empty(PageId::new(1, 0), desc(), PAGE_SIZE);
        for i in 0..page.num_slots() {
            page.insert_tuple(tuple(i as i32, 0)).unwrap();
        }
        assert!(page.insert_tuple(tuple(99, 99)).is_err());
    }

    #[test]
    fn test_delete_requires_matching_page_and_occupied_slot() {
        let mut page = HeapPage::empty(PageId::new(1, 0), desc(), PAGE_SIZE);
        let mut stray = tuple(1, 1);
        stray.set_record_id(Some(RecordId::new(PageId::new(2, 0), 0)));
        assert!(page.delete_tuple(&stray).is_err());

        let mut unplaced = tuple(1, 1);
        unplaced.set_record_id(Some(RecordId::new(PageId::new(1, 0), 3)));
        assert!(page.delete_tuple(&unplaced).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pid = PageId::new(7, 3);
        let mut page = HeapPage::empty(pid, desc(), PAGE_SIZE);
        page.insert_tuple(tuple(10, 20)).unwrap();
        page.insert_tuple(tuple(30, 40)).unwrap();
        let t = page.iter().next().unwrap().clone();
        page.delete_tuple(&t).unwrap();

        let bytes = page.encode();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let reread = HeapPage::decode(pid, desc(), &bytes).unwrap();
        assert_eq!(reread.header, page.header);
        let own: Vec<_> = page.iter().collect();
        let theirs: Vec<_> = reread.iter().collect();
        assert_eq!(own, theirs);
        // And the round trip is stable.
        assert_eq!(reread.encode(), bytes);
    }

    #[test]
    fn test_decode_rejects_corrupt_record() {
        let d = TupleDesc::unnamed(vec![FieldType::Str]);
        let page_size = 512;
        let mut page = HeapPage::empty(PageId::new(1, 0), d.clone(), page_size);
        let mut t = Tuple::new(d.clone());
        t.set_field(0, Field::Str("ok".into())).unwrap();
        page.insert_tuple(t).unwrap();
        let mut bytes = page.encode();
        // Blow up the stored string length of slot 0.
        let header_len = header_size(page.num_slots());
        bytes[header_len..header_len + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            HeapPage::decode(PageId::new(1, 0), d, &bytes),
            Err(DbError::Format(_))
        ));
    }

    #[test]
    fn test_before_image_tracks_flushes_not_edits() {
        let mut page = HeapPage::empty(PageId::new(1, 0), desc(), PAGE_SIZE);
        let pristine = page.before_image().to_vec();
        page.insert_tuple(tuple(1, 2)).unwrap();
        assert_eq!(page.before_image(), &pristine[..]);
        page.set_before_image();
        assert_eq!(page.before_image(), &page.encode()[..]);
    }
}
