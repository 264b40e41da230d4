use crate::error::{MvError, MvResult};
use crate::value::{read_value, write_value, Value};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Dense code assignment for the distinct values of a dimension column.
///
/// Values are kept sorted, so code order matches [`Value::total_cmp`] order and grouping keys made
/// of codes sort the same way the underlying values do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    values: Vec<Value>,
}

impl Dictionary {
    /// Build from arbitrary values; duplicates are collapsed.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let mut values: Vec<Value> = values.into_iter().collect();
        values.sort();
        values.dedup();
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn code_of(&self, value: &Value) -> Option<u32> {
        self.values.binary_search(value).ok().map(|idx| idx as u32)
    }

    pub fn value_of(&self, code: u32) -> Option<&Value> {
        self.values.get(code as usize)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.values.len() as u32)?;
        for value in &self.values {
            write_value(out, value)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> MvResult<Self> {
        let count = input.read_u32::<LittleEndian>()? as usize;
        let mut values = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            values.push(read_value(input)?);
        }
        if values.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MvError::corrupt("dictionary values are not strictly sorted"));
        }
        Ok(Self { values })
    }
}
