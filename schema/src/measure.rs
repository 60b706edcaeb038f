//! Measure column types: the accumulator domain and the on-disk codec.
//!
//! The combine semantics (init/accumulate/reduce) live in the `reduce`
//! crate; this module only fixes what a measure's values *are* and how they
//! serialize.

use crate::{hll::HllSketch, key::KeyType, Error, Result, TruncatedSnafu, TypeMismatchSnafu, Value};
use snafu::ensure;
use std::collections::BTreeSet;

/// Numeric domain of `sum`/`min`/`max` measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 64-bit float.
    F64,
}

impl NumType {
    /// A short name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F64 => "f64",
        }
    }
}

/// The type of one measure column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureKind {
    /// Running sum of the input values.
    Sum(NumType),
    /// Minimum input value.
    Min(NumType),
    /// Maximum input value.
    Max(NumType),
    /// Number of contributing rows; the input value is ignored.
    Count,
    /// Exact set union of scalar inputs.
    SetUnion(KeyType),
    /// Approximate distinct count of hashed inputs.
    Hll {
        /// Sketch precision, `2^precision` registers.
        precision: u8,
    },
}

/// An accumulator value for one measure column.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureValue {
    /// `sum`/`min`/`max` over signed integers.
    I64(i64),
    /// `sum`/`min`/`max` over unsigned integers, and `count`.
    U64(u64),
    /// `sum`/`min`/`max` over floats.
    F64(f64),
    /// `set_union` accumulator, ordered for deterministic chunk bytes.
    Set(BTreeSet<Value>),
    /// `hyperloglog` accumulator.
    Hll(HllSketch),
}

impl MeasureValue {
    /// A short name for the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::I64(_) => "i64",
            Self::U64(_) => "u64",
            Self::F64(_) => "f64",
            Self::Set(_) => "set",
            Self::Hll(_) => "hll",
        }
    }
}

impl MeasureKind {
    fn num_type(&self) -> Option<NumType> {
        match self {
            Self::Sum(t) | Self::Min(t) | Self::Max(t) => Some(*t),
            _ => None,
        }
    }

    /// Checks that a raw ingest value is acceptable input for this measure.
    ///
    /// `count` ignores its input entirely and `hyperloglog` hashes anything,
    /// so both accept every scalar.
    pub fn validate_raw(&self, value: &Value) -> Result<()> {
        match self {
            Self::Count | Self::Hll { .. } => Ok(()),
            Self::SetUnion(element) => element.validate(value),
            Self::Sum(t) | Self::Min(t) | Self::Max(t) => match (t, value) {
                (NumType::I64, Value::I64(_))
                | (NumType::U64, Value::U64(_))
                | (NumType::F64, Value::F64(_)) => Ok(()),
                (t, got) => TypeMismatchSnafu {
                    expected: t.name(),
                    got: got.type_name(),
                }
                .fail(),
            },
        }
    }

    /// Checks that an accumulator belongs to this measure.
    pub fn validate_acc(&self, acc: &MeasureValue) -> Result<()> {
        let ok = match (self, acc) {
            (Self::Count, MeasureValue::U64(_)) => true,
            (Self::SetUnion(_), MeasureValue::Set(_)) => true,
            (Self::Hll { precision }, MeasureValue::Hll(sketch)) => {
                sketch.precision() == *precision
            }
            _ => match (self.num_type(), acc) {
                (Some(NumType::I64), MeasureValue::I64(_))
                | (Some(NumType::U64), MeasureValue::U64(_))
                | (Some(NumType::F64), MeasureValue::F64(_)) => true,
                _ => false,
            },
        };
        ensure!(
            ok,
            TypeMismatchSnafu {
                expected: self.acc_type_name(),
                got: acc.type_name()
            }
        );
        Ok(())
    }

    fn acc_type_name(&self) -> &'static str {
        match self {
            Self::Count => "u64",
            Self::SetUnion(_) => "set",
            Self::Hll { .. } => "hll",
            Self::Sum(t) | Self::Min(t) | Self::Max(t) => t.name(),
        }
    }

    /// Appends the encoding of `acc` to `out`.
    pub fn encode_acc(&self, acc: &MeasureValue, out: &mut Vec<u8>) -> Result<()> {
        self.validate_acc(acc)?;
        match acc {
            MeasureValue::I64(v) => out.extend_from_slice(&v.to_be_bytes()),
            MeasureValue::U64(v) => out.extend_from_slice(&v.to_be_bytes()),
            MeasureValue::F64(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            MeasureValue::Set(set) => {
                let element = match self {
                    Self::SetUnion(element) => element,
                    _ => unreachable!("validated above"),
                };
                out.extend_from_slice(&u32::try_from(set.len()).expect("set too large").to_be_bytes());
                for value in set {
                    element.encode(value, out)?;
                }
            }
            MeasureValue::Hll(sketch) => {
                out.push(sketch.precision());
                out.extend_from_slice(sketch.registers());
            }
        }
        Ok(())
    }

    /// Decodes one accumulator from the front of `bytes`, returning it and
    /// the number of bytes consumed.
    pub fn decode_acc(&self, bytes: &[u8]) -> Result<(MeasureValue, usize)> {
        let fixed8 = || -> Result<[u8; 8]> {
            ensure!(
                bytes.len() >= 8,
                TruncatedSnafu {
                    want: 8_usize,
                    got: bytes.len()
                }
            );
            Ok(bytes[..8].try_into().unwrap())
        };

        match self {
            Self::Count => Ok((MeasureValue::U64(u64::from_be_bytes(fixed8()?)), 8)),
            Self::Sum(t) | Self::Min(t) | Self::Max(t) => {
                let raw = fixed8()?;
                let value = match t {
                    NumType::I64 => MeasureValue::I64(i64::from_be_bytes(raw)),
                    NumType::U64 => MeasureValue::U64(u64::from_be_bytes(raw)),
                    NumType::F64 => MeasureValue::F64(f64::from_bits(u64::from_be_bytes(raw))),
                };
                Ok((value, 8))
            }
            Self::SetUnion(element) => {
                ensure!(
                    bytes.len() >= 4,
                    TruncatedSnafu {
                        want: 4_usize,
                        got: bytes.len()
                    }
                );
                let count = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
                let width = element.encoded_len();
                let total = 4 + count * width;
                ensure!(
                    bytes.len() >= total,
                    TruncatedSnafu {
                        want: total,
                        got: bytes.len()
                    }
                );
                let mut set = BTreeSet::new();
                for i in 0..count {
                    set.insert(element.decode(&bytes[4 + i * width..])?);
                }
                Ok((MeasureValue::Set(set), total))
            }
            Self::Hll { precision } => {
                ensure!(
                    !bytes.is_empty(),
                    TruncatedSnafu {
                        want: 1_usize,
                        got: 0_usize
                    }
                );
                let stored = bytes[0];
                ensure!(
                    stored == *precision,
                    TypeMismatchSnafu {
                        expected: "hll",
                        got: "hll(other precision)"
                    }
                );
                let registers = 1_usize << stored;
                let total = 1 + registers;
                ensure!(
                    bytes.len() >= total,
                    TruncatedSnafu {
                        want: total,
                        got: bytes.len()
                    }
                );
                let sketch = HllSketch::from_parts(stored, bytes[1..total].to_vec());
                Ok((MeasureValue::Hll(sketch), total))
            }
        }
    }
}

impl std::fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sum(t) => write!(f, "sum<{}>", t.name()),
            Self::Min(t) => write!(f, "min<{}>", t.name()),
            Self::Max(t) => write!(f, "max<{}>", t.name()),
            Self::Count => write!(f, "count"),
            Self::SetUnion(element) => write!(f, "set_union<{}>", element.name()),
            Self::Hll { precision } => write!(f, "hyperloglog({})", precision),
        }
    }
}
