//! Dimension key types and their byte-comparable codec.
//!
//! Every key type encodes to a fixed number of bytes such that unsigned
//! bytewise comparison of the encodings matches the natural ordering of the
//! values: unsigned integers big-endian, signed integers big-endian with the
//! sign bit flipped, fixed strings zero-padded to their declared length.

use crate::{EnumOutOfRangeSnafu, Error, Result, StringTooLongSnafu, TypeMismatchSnafu, Value};
use snafu::ensure;

/// The type of one dimension column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Days since the unix epoch.
    Date,
    /// Enumeration with a declared member count, stored by ordinal.
    Enum {
        /// Number of declared members; ordinals are `0..cardinality`.
        cardinality: u16,
    },
    /// String occupying exactly `len` bytes, shorter values zero-padded.
    FixedStr {
        /// Encoded width in bytes.
        len: usize,
    },
}

impl KeyType {
    /// Width of this type's encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::Enum { .. } => 2,
            Self::I32 | Self::U32 | Self::Date => 4,
            Self::I64 | Self::U64 => 8,
            Self::FixedStr { len } => *len,
        }
    }

    /// A short name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::Date => "date",
            Self::Enum { .. } => "enum",
            Self::FixedStr { .. } => "str",
        }
    }

    /// Checks that `value` inhabits this type.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match (self, value) {
            (Self::I8, Value::I8(_))
            | (Self::I16, Value::I16(_))
            | (Self::I32, Value::I32(_))
            | (Self::I64, Value::I64(_))
            | (Self::U8, Value::U8(_))
            | (Self::U16, Value::U16(_))
            | (Self::U32, Value::U32(_))
            | (Self::U64, Value::U64(_))
            | (Self::Date, Value::Date(_)) => Ok(()),
            (Self::Enum { cardinality }, Value::Enum(ordinal)) => {
                ensure!(
                    ordinal < cardinality,
                    EnumOutOfRangeSnafu {
                        ordinal: *ordinal,
                        cardinality: *cardinality
                    }
                );
                Ok(())
            }
            (Self::FixedStr { len }, Value::Str(s)) => {
                ensure!(
                    s.len() <= *len,
                    StringTooLongSnafu {
                        len: s.len(),
                        max: *len
                    }
                );
                Ok(())
            }
            (expected, got) => TypeMismatchSnafu {
                expected: expected.name(),
                got: got.type_name(),
            }
            .fail(),
        }
    }

    /// Appends the order-preserving encoding of `value` to `out`.
    pub fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        self.validate(value)?;
        match (self, value) {
            (Self::I8, Value::I8(v)) => out.push((*v as u8) ^ 0x80),
            (Self::I16, Value::I16(v)) => {
                out.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes())
            }
            (Self::I32, Value::I32(v)) => {
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
            }
            (Self::I64, Value::I64(v)) => {
                out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes())
            }
            (Self::U8, Value::U8(v)) => out.push(*v),
            (Self::U16, Value::U16(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Self::U32, Value::U32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Self::U64, Value::U64(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Self::Date, Value::Date(v)) => {
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
            }
            (Self::Enum { .. }, Value::Enum(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Self::FixedStr { len }, Value::Str(s)) => {
                out.extend_from_slice(s.as_bytes());
                out.extend(std::iter::repeat(0).take(len - s.len()));
            }
            _ => unreachable!("validated above"),
        }
        Ok(())
    }

    /// Decodes one value from the front of `bytes`.
    ///
    /// `bytes` must hold at least [`encoded_len`](Self::encoded_len) bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let want = self.encoded_len();
        ensure!(
            bytes.len() >= want,
            crate::TruncatedSnafu {
                want,
                got: bytes.len()
            }
        );
        let bytes = &bytes[..want];
        let value = match self {
            Self::I8 => Value::I8((bytes[0] ^ 0x80) as i8),
            Self::I16 => {
                Value::I16((u16::from_be_bytes(bytes.try_into().unwrap()) ^ 0x8000) as i16)
            }
            Self::I32 => {
                Value::I32((u32::from_be_bytes(bytes.try_into().unwrap()) ^ 0x8000_0000) as i32)
            }
            Self::I64 => Value::I64(
                (u64::from_be_bytes(bytes.try_into().unwrap()) ^ 0x8000_0000_0000_0000) as i64,
            ),
            Self::U8 => Value::U8(bytes[0]),
            Self::U16 => Value::U16(u16::from_be_bytes(bytes.try_into().unwrap())),
            Self::U32 => Value::U32(u32::from_be_bytes(bytes.try_into().unwrap())),
            Self::U64 => Value::U64(u64::from_be_bytes(bytes.try_into().unwrap())),
            Self::Date => {
                Value::Date((u32::from_be_bytes(bytes.try_into().unwrap()) ^ 0x8000_0000) as i32)
            }
            Self::Enum { .. } => Value::Enum(u16::from_be_bytes(bytes.try_into().unwrap())),
            Self::FixedStr { .. } => {
                let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                let s = std::str::from_utf8(&bytes[..end]).map_err(|_| Error::InvalidUtf8)?;
                Value::Str(s.to_string())
            }
        };
        Ok(value)
    }

    /// The next value after `value` in this type's order, or `None` at the
    /// top of the domain. Defined for the enumerable types only; fixed
    /// strings return `None`.
    pub fn successor(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::I8, Value::I8(v)) => v.checked_add(1).map(Value::I8),
            (Self::I16, Value::I16(v)) => v.checked_add(1).map(Value::I16),
            (Self::I32, Value::I32(v)) => v.checked_add(1).map(Value::I32),
            (Self::I64, Value::I64(v)) => v.checked_add(1).map(Value::I64),
            (Self::U8, Value::U8(v)) => v.checked_add(1).map(Value::U8),
            (Self::U16, Value::U16(v)) => v.checked_add(1).map(Value::U16),
            (Self::U32, Value::U32(v)) => v.checked_add(1).map(Value::U32),
            (Self::U64, Value::U64(v)) => v.checked_add(1).map(Value::U64),
            (Self::Date, Value::Date(v)) => v.checked_add(1).map(Value::Date),
            (Self::Enum { cardinality }, Value::Enum(v)) => {
                let next = v.checked_add(1)?;
                (next < *cardinality).then(|| Value::Enum(next))
            }
            _ => None,
        }
    }

    /// Smallest value of the domain.
    pub fn min_value(&self) -> Value {
        match self {
            Self::I8 => Value::I8(i8::MIN),
            Self::I16 => Value::I16(i16::MIN),
            Self::I32 => Value::I32(i32::MIN),
            Self::I64 => Value::I64(i64::MIN),
            Self::U8 => Value::U8(0),
            Self::U16 => Value::U16(0),
            Self::U32 => Value::U32(0),
            Self::U64 => Value::U64(0),
            Self::Date => Value::Date(i32::MIN),
            Self::Enum { .. } => Value::Enum(0),
            Self::FixedStr { .. } => Value::Str(String::new()),
        }
    }

    /// Base-2 logarithm of the domain size, the planner's cost unit.
    pub fn domain_size_log2(&self) -> f64 {
        match self {
            Self::I8 | Self::U8 => 8.0,
            Self::I16 | Self::U16 => 16.0,
            Self::I32 | Self::U32 | Self::Date => 32.0,
            Self::I64 | Self::U64 => 64.0,
            Self::Enum { cardinality } => f64::from((*cardinality).max(1)).log2(),
            Self::FixedStr { len } => ((*len).min(8) * 8) as f64,
        }
    }
}
