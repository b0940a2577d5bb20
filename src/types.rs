//! Field types and values. Every type has a fixed on-disk width so that
//! records (and therefore page slots) are fixed-size.

use crate::error::{DbError, DbResult};
use bytes::{Buf, BufMut};
use std::fmt;

/// Maximum number of data bytes in a string field. Strings are stored as
/// a 4-byte length followed by exactly this many bytes (zero padded).
pub const STRING_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Str,
}

impl FieldType {
    /// On-disk width of a value of this type.
    pub fn byte_len(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Str => 4 + STRING_LEN,
        }
    }

    /// Type-directed parse of one field from the front of `buf`.
    pub fn parse(&self, buf: &mut &[u8]) -> DbResult<Field> {
        if buf.remaining() < self.byte_len() {
            return Err(DbError::Format(format!(
                "truncated field: need {} bytes, have {}",
                self.byte_len(),
                buf.remaining()
            )));
        }
        match self {
            FieldType::Int => Ok(Field::Int(buf.get_i32())),
            FieldType::Str => {
                let len = buf.get_u32() as usize;
                if len > STRING_LEN {
                    return Err(DbError::Format(format!(
                        "string length {len} exceeds maximum {STRING_LEN}"
                    )));
                }
                let mut raw = vec![0u8; STRING_LEN];
                buf.copy_to_slice(&mut raw);
                raw.truncate(len);
                let s = String::from_utf8(raw)
                    .map_err(|_| DbError::Format("string field is not utf-8".into()))?;
                Ok(Field::Str(s))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Int(i32),
    Str(String),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Str(_) => FieldType::Str,
        }
    }

    /// Appends the fixed-width encoding of this value to `buf`.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Field::Int(v) => buf.put_i32(*v),
            Field::Str(s) => {
                let data = s.as_bytes();
                debug_assert!(data.len() <= STRING_LEN);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
                buf.put_bytes(0, STRING_LEN - data.len());
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{v}"),
            Field::Str(s) => write!(f, "{s}"),
        }
    }
}
