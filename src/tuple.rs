//! Records and their schemas.

use crate::error::{DbError, DbResult};
use crate::page::PageId;
use crate::types::{Field, FieldType};
use bytes::BufMut;
use std::fmt;

/// One (type, optional name) entry of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdItem {
    pub field_type: FieldType,
    pub name: Option<String>,
}

/// Ordered description of a record's fields. Equality compares types and
/// names positionally; two tables with identical shapes share a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    items: Vec<TdItem>,
}

impl TupleDesc {
    pub fn new(types: Vec<FieldType>, names: Vec<Option<String>>) -> Self {
        assert_eq!(types.len(), names.len());
        let items = types
            .into_iter()
            .zip(names)
            .map(|(field_type, name)| TdItem { field_type, name })
            .collect();
        TupleDesc { items }
    }

    pub fn unnamed(types: Vec<FieldType>) -> Self {
        let names = vec![None; types.len()];
        TupleDesc::new(types, names)
    }

    pub fn num_fields(&self) -> usize {
        self.items.len()
    }

    pub fn field_type(&self, i: usize) -> FieldType {
        self.items[i].field_type
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.items[i].name.as_deref()
    }

    /// Index of the first field with the given name.
    pub fn index_for_field_name(&self, name: &str) -> DbResult<usize> {
        self.items
            .iter()
            .position(|item| item.name.as_deref() == Some(name))
            .ok_or_else(|| DbError::InvalidOperation(format!("no field named {name}")))
    }

    /// Total byte width of one record under this schema.
    pub fn byte_len(&self) -> usize {
        self.items.iter().map(|item| item.field_type.byte_len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TdItem> {
        self.items.iter()
    }

    /// Concatenation of two schemas, first all of `a`'s fields then `b`'s.
    pub fn merge(a: &TupleDesc, b: &TupleDesc) -> TupleDesc {
        let mut items = a.items.clone();
        items.extend(b.items.iter().cloned());
        TupleDesc { items }
    }
}

impl fmt::Display for TupleDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{:?}({})",
                item.field_type,
                item.name.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Where a record lives: a page plus a slot index within it. Assigned when
/// the record is placed on a page, cleared when it leaves one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub pid: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(pid: PageId, slot: usize) -> Self {
        RecordId { pid, slot }
    }
}

/// One record: a sequence of field values conforming to a `TupleDesc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    desc: TupleDesc,
    fields: Vec<Field>,
    record_id: Option<RecordId>,
}

impl Tuple {
    /// A new tuple with every field zeroed out for its type.
    pub fn new(desc: TupleDesc) -> Self {
        let fields = desc
            .iter()
            .map(|item| match item.field_type {
                FieldType::Int => Field::Int(0),
                FieldType::Str => Field::Str(String::new()),
            })
            .collect();
        Tuple {
            desc,
            fields,
            record_id: None,
        }
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn set_field(&mut self, i: usize, f: Field) -> DbResult<()> {
        if f.field_type() != self.desc.field_type(i) {
            return Err(DbError::InvalidOperation(format!(
                "field {i} expects {:?}, got {:?}",
                self.desc.field_type(i),
                f.field_type()
            )));
        }
        self.fields[i] = f;
        Ok(())
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Appends the fixed-width encoding of every field to `buf`.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        for f in &self.fields {
            f.serialize(buf);
        }
    }

    /// Type-directed parse of one record from the front of `buf`.
    pub fn parse(desc: &TupleDesc, buf: &mut &[u8]) -> DbResult<Tuple> {
        let mut t = Tuple::new(desc.clone());
        for i in 0..desc.num_fields() {
            t.fields[i] = desc.field_type(i).parse(buf)?;
        }
        Ok(t)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}
