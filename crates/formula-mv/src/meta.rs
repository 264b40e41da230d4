//! Block header: row count plus one [`ColumnInfo`] record per column.
//!
//! Layout (little-endian):
//!
//! ```text
//! row_count:i32  column_count:i32
//! repeated column_count times:
//!     min:value  max:value  has_dictionary:u8  [dictionary]  is_number:u8
//! ```
//!
//! `value` is the tagged encoding from [`crate::value`]; `dictionary` is `count:u32` followed by
//! that many encoded values.

use crate::dictionary::Dictionary;
use crate::error::{MvError, MvResult};
use crate::value::{read_value, write_value, Value};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnInfo {
    pub min: Value,
    pub max: Value,
    pub dictionary: Option<Arc<Dictionary>>,
    pub is_number: bool,
}

impl ColumnInfo {
    pub fn new(min: Value, max: Value, is_number: bool) -> Self {
        Self {
            min,
            max,
            dictionary: None,
            is_number,
        }
    }

    pub fn with_dictionary(mut self, dictionary: Arc<Dictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Dictionaries may be attached after the block is materialized.
    pub fn attach_dictionary(&mut self, dictionary: Arc<Dictionary>) {
        self.dictionary = Some(dictionary);
    }

    /// Copy including a private copy of the dictionary, for callers that need to mutate a view
    /// without touching the shared metadata.
    pub fn deep_clone(&self) -> Self {
        Self {
            min: self.min.clone(),
            max: self.max.clone(),
            dictionary: self
                .dictionary
                .as_ref()
                .map(|dict| Arc::new(Dictionary::clone(dict))),
            is_number: self.is_number,
        }
    }

    fn has_range(&self) -> bool {
        !self.min.is_null() && !self.max.is_null()
    }

    /// Whether `value` may occur in the column, judged from min/max alone.
    pub fn may_contain(&self, value: &Value) -> bool {
        !self.has_range() || (&self.min <= value && value <= &self.max)
    }

    /// Whether the inclusive range `[lo, hi]` intersects the column's min/max.
    pub fn overlaps(&self, lo: &Value, hi: &Value) -> bool {
        !self.has_range() || (lo <= &self.max && &self.min <= hi)
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        write_value(out, &self.min)?;
        write_value(out, &self.max)?;
        match &self.dictionary {
            Some(dict) => {
                out.write_u8(1)?;
                dict.write_to(out)?;
            }
            None => out.write_u8(0)?,
        }
        out.write_u8(u8::from(self.is_number))
    }

    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> MvResult<Self> {
        let min = read_value(input)?;
        let max = read_value(input)?;
        let dictionary = match input.read_u8()? {
            0 => None,
            1 => Some(Arc::new(Dictionary::read_from(input)?)),
            other => return Err(MvError::corrupt(format!("bad dictionary flag {other}"))),
        };
        let is_number = read_flag(input, "is_number")?;
        Ok(Self {
            min,
            max,
            dictionary,
            is_number,
        })
    }
}

fn read_flag<R: Read + ?Sized>(input: &mut R, what: &str) -> MvResult<bool> {
    match input.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(MvError::corrupt(format!("bad {what} flag {other}"))),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockMeta {
    pub row_count: usize,
    pub columns: Vec<ColumnInfo>,
}

impl BlockMeta {
    pub fn new(row_count: usize, columns: Vec<ColumnInfo>) -> Self {
        Self { row_count, columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> MvResult<&ColumnInfo> {
        self.columns.get(idx).ok_or(MvError::ColumnOutOfRange {
            column: idx,
            columns: self.columns.len(),
        })
    }

    /// Copy with every column deep-cloned.
    pub fn deep_clone(&self) -> Self {
        Self {
            row_count: self.row_count,
            columns: self.columns.iter().map(ColumnInfo::deep_clone).collect(),
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> MvResult<()> {
        out.write_i32::<LittleEndian>(to_i32(self.row_count, "row count")?)?;
        out.write_i32::<LittleEndian>(to_i32(self.columns.len(), "column count")?)?;
        for info in &self.columns {
            info.write_to(out)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> MvResult<Self> {
        let row_count = from_i32(input.read_i32::<LittleEndian>()?, "row count")?;
        let column_count = from_i32(input.read_i32::<LittleEndian>()?, "column count")?;
        let mut columns = Vec::with_capacity(column_count.min(1024));
        for _ in 0..column_count {
            columns.push(ColumnInfo::read_from(input)?);
        }
        Ok(Self { row_count, columns })
    }

    pub fn to_bytes(&self) -> MvResult<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Parse a header that must span `bytes` exactly.
    pub fn from_bytes(bytes: &[u8]) -> MvResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let meta = Self::read_from(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(MvError::corrupt(format!(
                "{} trailing bytes after block header",
                bytes.len() - consumed
            )));
        }
        Ok(meta)
    }
}

fn to_i32(value: usize, what: &str) -> MvResult<i32> {
    i32::try_from(value).map_err(|_| MvError::corrupt(format!("{what} {value} exceeds i32")))
}

fn from_i32(value: i32, what: &str) -> MvResult<usize> {
    usize::try_from(value).map_err(|_| MvError::corrupt(format!("negative {what} {value}")))
}
