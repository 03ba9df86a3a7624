//! Fixed-layout binary codec.
//!
//! A frame is described by a schema: an ordered list of [`FieldKind`]s. Values
//! are written back to back with no padding or alignment. Integers are
//! big-endian and `Var` fields carry a 4-byte big-endian length prefix.

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One byte.
    Byte,
    /// Two bytes, big-endian.
    Short,
    /// Four bytes, big-endian.
    Int,
    /// Four-byte big-endian length prefix followed by that many bytes.
    Var,
    /// Exactly `n` bytes.
    Fixed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Byte(u8),
    Short(u16),
    Int(u32),
    Bytes(Vec<u8>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("field {index}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("field {index}: value does not match field kind {kind:?}")]
    KindMismatch { index: usize, kind: FieldKind },
    #[error("schema has {expected} fields but {actual} values were supplied")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("field {index}: need {needed} bytes at offset {offset}, only {remaining} remain")]
    TruncatedInput {
        index: usize,
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("{0} unread bytes after the last field")]
    TrailingBytes(usize),
    #[error("field {index}: variable field of {len} bytes exceeds the length prefix")]
    TooLarge { index: usize, len: usize },
}

impl Value {
    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_short(&self) -> Option<u16> {
        match self {
            Value::Short(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(bytes: [u8; N]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

/// Size in bytes that `values` will occupy once encoded against `schema`.
fn encoded_len(schema: &[FieldKind], values: &[Value]) -> usize {
    schema
        .iter()
        .zip(values)
        .map(|(kind, value)| match (kind, value) {
            (FieldKind::Byte, _) => 1,
            (FieldKind::Short, _) => 2,
            (FieldKind::Int, _) => 4,
            (FieldKind::Var, Value::Bytes(bytes)) => 4 + bytes.len(),
            (FieldKind::Fixed(n), _) => *n,
            (FieldKind::Var, _) => 4,
        })
        .sum()
}

pub fn encode(schema: &[FieldKind], values: &[Value]) -> Result<Vec<u8>, WireError> {
    if schema.len() != values.len() {
        return Err(WireError::ArityMismatch {
            expected: schema.len(),
            actual: values.len(),
        });
    }

    let mut out = Vec::with_capacity(encoded_len(schema, values));
    for (index, (kind, value)) in schema.iter().zip(values).enumerate() {
        match (kind, value) {
            (FieldKind::Byte, Value::Byte(b)) => out.push(*b),
            (FieldKind::Short, Value::Short(s)) => out.extend_from_slice(&s.to_be_bytes()),
            (FieldKind::Int, Value::Int(i)) => out.extend_from_slice(&i.to_be_bytes()),
            (FieldKind::Var, Value::Bytes(bytes)) => {
                let len = u32::try_from(bytes.len()).map_err(|_| WireError::TooLarge {
                    index,
                    len: bytes.len(),
                })?;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(bytes);
            }
            (FieldKind::Fixed(n), Value::Bytes(bytes)) => {
                if bytes.len() != *n {
                    return Err(WireError::SizeMismatch {
                        index,
                        expected: *n,
                        actual: bytes.len(),
                    });
                }
                out.extend_from_slice(bytes);
            }
            (kind, _) => return Err(WireError::KindMismatch { index, kind: *kind }),
        }
    }
    Ok(out)
}

/// Decodes a complete frame. Unread bytes after the last field are an error.
pub fn decode(schema: &[FieldKind], bytes: &[u8]) -> Result<Vec<Value>, WireError> {
    let (values, consumed) = decode_prefix(schema, bytes).inspect_err(|err| {
        trace!(target = "wire", len = bytes.len(), error = %err, "rejected frame");
    })?;
    if consumed != bytes.len() {
        trace!(target = "wire", len = bytes.len(), consumed, "rejected frame with trailing bytes");
        return Err(WireError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(values)
}

/// Decodes `schema` from the front of `bytes`, returning the values and the
/// number of bytes consumed.
pub fn decode_prefix(schema: &[FieldKind], bytes: &[u8]) -> Result<(Vec<Value>, usize), WireError> {
    let mut cursor = Cursor { bytes, offset: 0 };
    let mut values = Vec::with_capacity(schema.len());
    for (index, kind) in schema.iter().enumerate() {
        let value = match kind {
            FieldKind::Byte => Value::Byte(cursor.take(index, 1)?[0]),
            FieldKind::Short => {
                let raw = cursor.take(index, 2)?;
                Value::Short(u16::from_be_bytes([raw[0], raw[1]]))
            }
            FieldKind::Int => Value::Int(cursor.read_u32(index)?),
            FieldKind::Var => {
                let len = cursor.read_u32(index)? as usize;
                Value::Bytes(cursor.take(index, len)?.to_vec())
            }
            FieldKind::Fixed(n) => Value::Bytes(cursor.take(index, *n)?.to_vec()),
        };
        values.push(value);
    }
    Ok((values, cursor.offset))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, index: usize, needed: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.bytes.len() - self.offset;
        if needed > remaining {
            return Err(WireError::TruncatedInput {
                index,
                offset: self.offset,
                needed,
                remaining,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn read_u32(&mut self, index: usize) -> Result<u32, WireError> {
        let raw = self.take(index, 4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}
