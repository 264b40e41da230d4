//! Scalar values stored in block metadata and dictionaries, plus their generic tagged encoding.
//!
//! The encoding is a one-byte tag followed by a fixed-width or length-prefixed payload:
//!
//! | tag | kind    | payload                         |
//! |-----|---------|---------------------------------|
//! | 0   | `Null`  | none                            |
//! | 1   | `Int`   | `i64`                           |
//! | 2   | `Float` | `f64` bits                      |
//! | 3   | `Str`   | `len: u32` + UTF-8 bytes        |
//! | 4   | `Date`  | `i64` epoch milliseconds        |
//!
//! All integers are little-endian.

use crate::error::{MvError, MvResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_DATE: u8 = 4;

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Numeric view of the value. Dates map to their millisecond timestamp.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) | Value::Date(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Null | Value::Str(_) => None,
        }
    }

    /// Integer view of the value. Floats are rounded to the nearest integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::Date(v) => Some(*v),
            Value::Float(v) if v.is_finite() => Some(v.round() as i64),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Date(_) => 2,
            Value::Str(_) => 3,
        }
    }

    /// Total order used by dictionaries and min/max statistics.
    ///
    /// `Null` sorts first, then numbers (integers and floats compare numerically), then dates,
    /// then strings.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.as_ref().cmp(b.as_ref()),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = OrderedFloat(self.as_f64().unwrap_or_default());
                let b = OrderedFloat(other.as_f64().unwrap_or_default());
                a.cmp(&b)
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Encoded size in bytes, matching [`write_value`].
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Int(_) | Value::Float(_) | Value::Date(_) => 9,
            Value::Str(s) => 5 + s.len(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Date(ms) => write!(f, "@{ms}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<Arc<str>> for Value {
    fn from(v: Arc<str>) -> Self {
        Value::Str(v)
    }
}

pub fn write_value<W: Write + ?Sized>(out: &mut W, value: &Value) -> io::Result<()> {
    match value {
        Value::Null => out.write_u8(TAG_NULL),
        Value::Int(v) => {
            out.write_u8(TAG_INT)?;
            out.write_i64::<LittleEndian>(*v)
        }
        Value::Float(v) => {
            out.write_u8(TAG_FLOAT)?;
            out.write_u64::<LittleEndian>(v.to_bits())
        }
        Value::Str(s) => {
            let len = u32::try_from(s.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "string value exceeds u32::MAX bytes")
            })?;
            out.write_u8(TAG_STR)?;
            out.write_u32::<LittleEndian>(len)?;
            out.write_all(s.as_bytes())
        }
        Value::Date(ms) => {
            out.write_u8(TAG_DATE)?;
            out.write_i64::<LittleEndian>(*ms)
        }
    }
}

pub fn read_value<R: Read + ?Sized>(input: &mut R) -> MvResult<Value> {
    let tag = input.read_u8()?;
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_INT => Value::Int(input.read_i64::<LittleEndian>()?),
        TAG_FLOAT => Value::Float(f64::from_bits(input.read_u64::<LittleEndian>()?)),
        TAG_STR => {
            let len = input.read_u32::<LittleEndian>()? as u64;
            // Read through `take` so a corrupt length cannot force a huge up-front allocation.
            let mut bytes = Vec::new();
            input.take(len).read_to_end(&mut bytes)?;
            if bytes.len() as u64 != len {
                return Err(MvError::corrupt(format!(
                    "string value truncated: expected {len} bytes, got {}",
                    bytes.len()
                )));
            }
            let s = String::from_utf8(bytes)
                .map_err(|err| MvError::corrupt(format!("string value is not UTF-8: {err}")))?;
            Value::Str(Arc::from(s))
        }
        TAG_DATE => Value::Date(input.read_i64::<LittleEndian>()?),
        other => return Err(MvError::UnknownValueTag(other)),
    };
    Ok(value)
}
