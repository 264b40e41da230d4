//! Per-row column storage for blocks.
//!
//! Every column is a [`BitPackedBuffer`] of unsigned codes:
//! - dimension columns store dictionary codes, packed to the width of the dictionary;
//! - measure columns store range-quantized integers (see [`Quantization`]).
//!
//! Each column carries its own header (kind, range and bit width), so it can be opened from a
//! byte offset without consulting the block header. The packed payload is paged in lazily on
//! the first read or write.

use crate::bitpacking::{bits_required, packed_byte_len, BitPackedBuffer};
use crate::channel::Channel;
use crate::error::{MvError, MvResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

const KIND_DIMENSION: u8 = 0xD0;

/// `kind:u8, min:i64, max:i64, bit_width:u8, len:u32`
pub const MEASURE_HEADER_LEN: u64 = 22;
/// `kind:u8, cardinality:u32, bit_width:u8, len:u32`
pub const DIMENSION_HEADER_LEN: u64 = 10;

/// Quantization granularity of an integer measure column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Quantization {
    /// Millisecond dates bucketed to 30 minutes (keeps non-hour-aligned time zones exact).
    Date,
    /// Millisecond time-of-day bucketed to 1 second.
    Time,
    /// Millisecond timestamps bucketed to 1 second, stored unsigned over the full range rather
    /// than relative to the column minimum.
    Timestamp,
    /// Plain integers, stored relative to the column minimum.
    Integer,
}

impl Quantization {
    pub fn factor(self) -> i64 {
        match self {
            Quantization::Date => 30 * 60 * 1000,
            Quantization::Time | Quantization::Timestamp => 1000,
            Quantization::Integer => 1,
        }
    }

    pub fn is_range_relative(self) -> bool {
        !matches!(self, Quantization::Timestamp)
    }

    fn tag(self) -> u8 {
        match self {
            Quantization::Date => 1,
            Quantization::Time => 2,
            Quantization::Timestamp => 3,
            Quantization::Integer => 4,
        }
    }

    fn from_tag(tag: u8) -> MvResult<Self> {
        Ok(match tag {
            1 => Quantization::Date,
            2 => Quantization::Time,
            3 => Quantization::Timestamp,
            4 => Quantization::Integer,
            other => return Err(MvError::corrupt(format!("unknown column kind {other:#04x}"))),
        })
    }
}

/// Divide rounding to the nearest integer (halves round up).
fn round_div(value: i128, factor: i128) -> i128 {
    let q = value.div_euclid(factor);
    let r = value.rem_euclid(factor);
    if r * 2 >= factor {
        q + 1
    } else {
        q
    }
}

/// Location of a column's packed payload inside a channel.
#[derive(Clone, Debug)]
struct PageRef {
    channel: Arc<dyn Channel>,
    offset: u64,
    byte_len: usize,
}

impl PageRef {
    fn load(&self, width: u8, len: usize) -> MvResult<BitPackedBuffer> {
        let mut reader = self.channel.reader()?;
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = vec![0u8; self.byte_len];
        reader.read_exact(&mut bytes)?;
        BitPackedBuffer::from_bytes(width, len, &bytes)
    }
}

/// Packed codes that are either resident or waiting to be paged in from a channel.
#[derive(Debug)]
struct PagedCodes {
    width: u8,
    len: usize,
    resident: Option<BitPackedBuffer>,
    dirty: bool,
    source: Option<PageRef>,
}

impl PagedCodes {
    fn fresh(width: u8, len: usize) -> Self {
        Self {
            width,
            len,
            resident: Some(BitPackedBuffer::zeroed(width, len)),
            dirty: true,
            source: None,
        }
    }

    fn paged(width: u8, len: usize, source: PageRef) -> Self {
        Self {
            width,
            len,
            resident: None,
            dirty: false,
            source: Some(source),
        }
    }

    fn buffer(&mut self) -> MvResult<&mut BitPackedBuffer> {
        if self.resident.is_none() {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| MvError::corrupt("column has neither data nor a backing page"))?;
            log::debug!(
                "paging in {} bytes of column data from {} at offset {}",
                source.byte_len,
                source.channel.name(),
                source.offset
            );
            self.resident = Some(source.load(self.width, self.len)?);
        }
        self.resident
            .as_mut()
            .ok_or_else(|| MvError::corrupt("column payload missing after page-in"))
    }

    fn get(&mut self, row: usize) -> MvResult<u64> {
        Ok(self.buffer()?.get(row))
    }

    fn set(&mut self, row: usize, code: u64) -> MvResult<()> {
        self.buffer()?.set(row, code);
        self.dirty = true;
        Ok(())
    }

    fn is_resident(&self) -> bool {
        self.resident.is_some()
    }

    fn release(&mut self) -> bool {
        if self.source.is_some() && !self.dirty && self.resident.is_some() {
            self.resident = None;
            return true;
        }
        false
    }

    fn write_payload<W: Write + ?Sized>(&mut self, out: &mut W) -> MvResult<()> {
        let bytes = self.buffer()?.to_bytes();
        out.write_all(&bytes)?;
        Ok(())
    }
}

fn check_row(row: usize, len: usize) -> MvResult<()> {
    if row >= len {
        return Err(MvError::corrupt(format!("row {row} out of range for column of {len} rows")));
    }
    Ok(())
}

/// Integer measure column holding `round((value - base) / FACTOR)` codes in a bit-packed buffer.
///
/// `base` is the column minimum for range-relative kinds and `0` for [`Quantization::Timestamp`],
/// so the minimum of a range-relative column always decodes exactly.
#[derive(Debug)]
pub struct QuantizedColumn {
    quantization: Quantization,
    min: i64,
    max: i64,
    base: i64,
    top: u64,
    codes: PagedCodes,
}

impl QuantizedColumn {
    /// Fresh zero-filled column for values in `[min, max]`.
    ///
    /// Writing values outside the declared range is a caller error.
    pub fn new(quantization: Quantization, min: i64, max: i64, len: usize) -> MvResult<Self> {
        let (base, top) = Self::layout(quantization, min, max)?;
        Ok(Self {
            quantization,
            min,
            max,
            base,
            top,
            codes: PagedCodes::fresh(bits_required(top), len),
        })
    }

    /// Returns `(base, top code)`. The top code is `ceil((max - base) / FACTOR)`, so `max` always
    /// has a code of its own and decodes exactly.
    fn layout(quantization: Quantization, min: i64, max: i64) -> MvResult<(i64, u64)> {
        if min > max || (!quantization.is_range_relative() && min < 0) {
            return Err(MvError::InvalidRange { min, max });
        }
        let base = if quantization.is_range_relative() {
            min
        } else {
            0
        };
        let span = i128::from(max) - i128::from(base);
        let factor = i128::from(quantization.factor());
        let top = u64::try_from((span + factor - 1) / factor)
            .map_err(|_| MvError::InvalidRange { min, max })?;
        Ok((base, top))
    }

    /// Open a column whose header starts at `offset`; the payload is read on first access.
    pub fn open(channel: Arc<dyn Channel>, offset: u64) -> MvResult<Self> {
        let mut reader = channel.reader()?;
        reader.seek(SeekFrom::Start(offset))?;
        let quantization = Quantization::from_tag(reader.read_u8()?)?;
        let min = reader.read_i64::<LittleEndian>()?;
        let max = reader.read_i64::<LittleEndian>()?;
        let width = reader.read_u8()?;
        let len = reader.read_u32::<LittleEndian>()? as usize;
        drop(reader);

        let (base, top) = Self::layout(quantization, min, max)?;
        let expected_width = bits_required(top);
        if width != expected_width {
            return Err(MvError::corrupt(format!(
                "column header declares {width} bits, range requires {expected_width}"
            )));
        }
        let source = PageRef {
            channel,
            offset: offset + MEASURE_HEADER_LEN,
            byte_len: packed_byte_len(width, len),
        };
        Ok(Self {
            quantization,
            min,
            max,
            base,
            top,
            codes: PagedCodes::paged(width, len, source),
        })
    }

    pub fn quantization(&self) -> Quantization {
        self.quantization
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn bit_width(&self) -> u8 {
        self.codes.width
    }

    pub fn len(&self) -> usize {
        self.codes.len
    }

    pub fn is_empty(&self) -> bool {
        self.codes.len == 0
    }

    pub fn is_resident(&self) -> bool {
        self.codes.is_resident()
    }

    pub fn encode(&self, value: i64) -> u64 {
        debug_assert!(
            (self.min..=self.max).contains(&value),
            "value {value} outside column range [{}, {}]",
            self.min,
            self.max
        );
        if value >= self.max {
            return self.top;
        }
        let offset = i128::from(value) - i128::from(self.base);
        let code = round_div(offset, i128::from(self.quantization.factor()));
        code.clamp(0, i128::from(self.top)) as u64
    }

    /// Decoded values are clamped to `[min, max]`; the last bucket may round past `max`.
    pub fn decode(&self, code: u64) -> i64 {
        let factor = i128::from(self.quantization.factor());
        let raw = i128::from(self.base) + i128::from(code) * factor;
        raw.clamp(i128::from(self.min), i128::from(self.max)) as i64
    }

    pub fn get(&mut self, row: usize) -> MvResult<i64> {
        check_row(row, self.codes.len)?;
        let code = self.codes.get(row)?;
        Ok(self.decode(code))
    }

    pub fn set(&mut self, row: usize, value: i64) -> MvResult<()> {
        check_row(row, self.codes.len)?;
        let code = self.encode(value);
        self.codes.set(row, code)
    }

    /// Drop the resident payload if it can be paged in again; returns whether it was dropped.
    pub fn close(&mut self) -> bool {
        self.codes.release()
    }

    pub fn encoded_len(&self) -> u64 {
        MEASURE_HEADER_LEN + packed_byte_len(self.codes.width, self.codes.len) as u64
    }

    pub fn store<W: Write + ?Sized>(&mut self, out: &mut W) -> MvResult<u64> {
        out.write_u8(self.quantization.tag())?;
        out.write_i64::<LittleEndian>(self.min)?;
        out.write_i64::<LittleEndian>(self.max)?;
        out.write_u8(self.codes.width)?;
        out.write_u32::<LittleEndian>(len_u32(self.codes.len)?)?;
        self.codes.write_payload(out)?;
        Ok(self.encoded_len())
    }
}

fn len_u32(len: usize) -> MvResult<u32> {
    u32::try_from(len).map_err(|_| MvError::corrupt(format!("column of {len} rows exceeds u32")))
}

/// Dimension column holding dictionary codes.
#[derive(Debug)]
pub struct DimensionColumn {
    cardinality: u32,
    codes: PagedCodes,
}

impl DimensionColumn {
    pub fn new(cardinality: u32, len: usize) -> Self {
        Self {
            cardinality,
            codes: PagedCodes::fresh(Self::width_for(cardinality), len),
        }
    }

    fn width_for(cardinality: u32) -> u8 {
        bits_required(u64::from(cardinality.saturating_sub(1)))
    }

    pub fn open(channel: Arc<dyn Channel>, offset: u64) -> MvResult<Self> {
        let mut reader = channel.reader()?;
        reader.seek(SeekFrom::Start(offset))?;
        let kind = reader.read_u8()?;
        if kind != KIND_DIMENSION {
            return Err(MvError::corrupt(format!(
                "expected dimension column at offset {offset}, found kind {kind:#04x}"
            )));
        }
        let cardinality = reader.read_u32::<LittleEndian>()?;
        let width = reader.read_u8()?;
        let len = reader.read_u32::<LittleEndian>()? as usize;
        drop(reader);

        if width != Self::width_for(cardinality) {
            return Err(MvError::corrupt(format!(
                "dimension column declares {width} bits for cardinality {cardinality}"
            )));
        }
        let source = PageRef {
            channel,
            offset: offset + DIMENSION_HEADER_LEN,
            byte_len: packed_byte_len(width, len),
        };
        Ok(Self {
            cardinality,
            codes: PagedCodes::paged(width, len, source),
        })
    }

    pub fn cardinality(&self) -> u32 {
        self.cardinality
    }

    pub fn bit_width(&self) -> u8 {
        self.codes.width
    }

    pub fn len(&self) -> usize {
        self.codes.len
    }

    pub fn is_empty(&self) -> bool {
        self.codes.len == 0
    }

    pub fn is_resident(&self) -> bool {
        self.codes.is_resident()
    }

    pub fn get(&mut self, row: usize) -> MvResult<u32> {
        check_row(row, self.codes.len)?;
        Ok(self.codes.get(row)? as u32)
    }

    pub fn set(&mut self, row: usize, code: u32) -> MvResult<()> {
        check_row(row, self.codes.len)?;
        debug_assert!(code < self.cardinality.max(1), "code {code} outside dictionary");
        self.codes.set(row, u64::from(code))
    }

    pub fn close(&mut self) -> bool {
        self.codes.release()
    }

    pub fn encoded_len(&self) -> u64 {
        DIMENSION_HEADER_LEN + packed_byte_len(self.codes.width, self.codes.len) as u64
    }

    pub fn store<W: Write + ?Sized>(&mut self, out: &mut W) -> MvResult<u64> {
        out.write_u8(KIND_DIMENSION)?;
        out.write_u32::<LittleEndian>(self.cardinality)?;
        out.write_u8(self.codes.width)?;
        out.write_u32::<LittleEndian>(len_u32(self.codes.len)?)?;
        self.codes.write_payload(out)?;
        Ok(self.encoded_len())
    }
}

#[derive(Debug)]
pub enum Column {
    Dimension(DimensionColumn),
    Measure(QuantizedColumn),
}

impl Column {
    /// Open whichever column kind starts at `offset`.
    pub fn open(channel: Arc<dyn Channel>, offset: u64) -> MvResult<Self> {
        let kind = {
            let mut reader = channel.reader()?;
            reader.seek(SeekFrom::Start(offset))?;
            reader.read_u8()?
        };
        if kind == KIND_DIMENSION {
            DimensionColumn::open(channel, offset).map(Column::Dimension)
        } else {
            QuantizedColumn::open(channel, offset).map(Column::Measure)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Dimension(c) => c.len(),
            Column::Measure(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bit_width(&self) -> u8 {
        match self {
            Column::Dimension(c) => c.bit_width(),
            Column::Measure(c) => c.bit_width(),
        }
    }

    pub fn close(&mut self) -> bool {
        match self {
            Column::Dimension(c) => c.close(),
            Column::Measure(c) => c.close(),
        }
    }

    pub fn encoded_len(&self) -> u64 {
        match self {
            Column::Dimension(c) => c.encoded_len(),
            Column::Measure(c) => c.encoded_len(),
        }
    }

    pub fn store<W: Write + ?Sized>(&mut self, out: &mut W) -> MvResult<u64> {
        match self {
            Column::Dimension(c) => c.store(out),
            Column::Measure(c) => c.store(out),
        }
    }
}
