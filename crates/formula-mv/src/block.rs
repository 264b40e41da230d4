use crate::channel::Channel;
use crate::column::{Column, DimensionColumn, Quantization, QuantizedColumn};
use crate::dictionary::Dictionary;
use crate::error::{MvError, MvResult};
use crate::meta::{BlockMeta, ColumnInfo};
use crate::row::RawRow;
use crate::value::Value;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnSpec {
    /// Dictionary-encoded grouping column.
    Dimension,
    /// Quantized integer measure.
    Measure(Quantization),
}

/// Immutable unit of columnar storage.
///
/// On disk a block is its [`BlockMeta`] header, a directory of `column_count` little-endian `u64`
/// column offsets, then the column bodies in order.
#[derive(Debug)]
pub struct Block {
    meta: BlockMeta,
    columns: Vec<Column>,
}

impl Block {
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn row_count(&self) -> usize {
        self.meta.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Attach a dictionary to a column after materialization.
    pub fn attach_dictionary(&mut self, col: usize, dictionary: Arc<Dictionary>) -> MvResult<()> {
        let columns = self.meta.columns.len();
        let info = self
            .meta
            .columns
            .get_mut(col)
            .ok_or(MvError::ColumnOutOfRange { column: col, columns })?;
        info.attach_dictionary(dictionary);
        Ok(())
    }

    fn column_mut(&mut self, col: usize) -> MvResult<&mut Column> {
        let columns = self.columns.len();
        self.columns
            .get_mut(col)
            .ok_or(MvError::ColumnOutOfRange { column: col, columns })
    }

    pub fn dimension_code(&mut self, row: usize, col: usize) -> MvResult<u32> {
        match self.column_mut(col)? {
            Column::Dimension(c) => c.get(row),
            Column::Measure(_) => Err(MvError::Unsupported("dimension code of a measure column")),
        }
    }

    pub fn measure_value(&mut self, row: usize, col: usize) -> MvResult<i64> {
        match self.column_mut(col)? {
            Column::Measure(c) => c.get(row),
            Column::Dimension(_) => Err(MvError::Unsupported("measure value of a dimension column")),
        }
    }

    /// Decoded cell value.
    pub fn value(&mut self, row: usize, col: usize) -> MvResult<Value> {
        let dictionary = self.meta.column(col)?.dictionary.clone();
        match self.column_mut(col)? {
            Column::Dimension(c) => {
                let code = c.get(row)?;
                let dict = dictionary.ok_or_else(|| {
                    MvError::corrupt(format!("dimension column {col} has no dictionary"))
                })?;
                dict.value_of(code)
                    .cloned()
                    .ok_or_else(|| MvError::corrupt(format!("code {code} outside dictionary")))
            }
            Column::Measure(c) => {
                let quantization = c.quantization();
                Ok(measure_value(quantization, c.get(row)?))
            }
        }
    }

    /// Decode rows into grouping keys (dimension codes) and measure values.
    ///
    /// Keys from different blocks are only comparable when their dimension columns share a
    /// dictionary (see [`BlockBuilder::with_dictionary`]).
    pub fn raw_rows(&mut self, dimensions: &[usize], measures: &[usize]) -> MvResult<Vec<RawRow>> {
        let mut rows = Vec::with_capacity(self.row_count());
        for row in 0..self.row_count() {
            let key = dimensions
                .iter()
                .map(|&col| self.dimension_code(row, col))
                .collect::<MvResult<Vec<_>>>()?;
            let values = measures
                .iter()
                .map(|&col| self.measure_value(row, col).map(|v| v as f64))
                .collect::<MvResult<Vec<_>>>()?;
            rows.push(RawRow::new(key, values));
        }
        Ok(rows)
    }

    /// Release resident column payloads that can be paged in again.
    pub fn close(&mut self) {
        for column in &mut self.columns {
            column.close();
        }
    }

    /// Write the block from offset zero and cut off anything a previous, larger block left behind.
    pub fn write_to(&mut self, channel: &dyn Channel) -> MvResult<()> {
        let header = self.meta.to_bytes()?;
        let directory_len = 8 * self.columns.len() as u64;
        let mut offset = header.len() as u64 + directory_len;

        let mut out = channel.writer()?;
        out.write_all(&header)?;
        for column in &self.columns {
            out.write_u64::<LittleEndian>(offset)?;
            offset += column.encoded_len();
        }
        for column in &mut self.columns {
            column.store(&mut out)?;
        }
        out.flush()?;
        drop(out);
        channel.truncate(offset)?;
        log::debug!(
            "wrote block of {} rows x {} columns ({offset} bytes) to {}",
            self.meta.row_count,
            self.columns.len(),
            channel.name()
        );
        Ok(())
    }

    /// Open a block; column payloads stay on disk until first touched.
    pub fn open(channel: Arc<dyn Channel>) -> MvResult<Self> {
        let (meta, offsets) = {
            let mut input = channel.reader()?;
            let meta = BlockMeta::read_from(&mut input)?;
            let mut offsets = Vec::with_capacity(meta.column_count());
            for _ in 0..meta.column_count() {
                offsets.push(input.read_u64::<LittleEndian>()?);
            }
            (meta, offsets)
        };

        let mut columns = Vec::with_capacity(offsets.len());
        for (idx, offset) in offsets.into_iter().enumerate() {
            let column = Column::open(channel.clone(), offset)?;
            if column.len() != meta.row_count {
                return Err(MvError::corrupt(format!(
                    "column {idx} has {} rows, block header says {}",
                    column.len(),
                    meta.row_count
                )));
            }
            if matches!(column, Column::Dimension(_)) && meta.columns[idx].dictionary.is_none() {
                return Err(MvError::corrupt(format!("dimension column {idx} has no dictionary")));
            }
            columns.push(column);
        }
        Ok(Self { meta, columns })
    }
}

fn measure_value(quantization: Quantization, raw: i64) -> Value {
    match quantization {
        Quantization::Date | Quantization::Timestamp => Value::Date(raw),
        Quantization::Time | Quantization::Integer => Value::Int(raw),
    }
}

/// Row-at-a-time builder that materializes a [`Block`].
pub struct BlockBuilder {
    specs: Vec<ColumnSpec>,
    shared_dictionaries: HashMap<usize, Arc<Dictionary>>,
    values: Vec<Vec<Value>>,
    rows: usize,
}

impl BlockBuilder {
    pub fn new(specs: Vec<ColumnSpec>) -> Self {
        let values = specs.iter().map(|_| Vec::new()).collect();
        Self {
            specs,
            shared_dictionaries: HashMap::new(),
            values,
            rows: 0,
        }
    }

    /// Encode dimension column `col` against an existing dictionary instead of building one, so
    /// codes line up across blocks.
    pub fn with_dictionary(mut self, col: usize, dictionary: Arc<Dictionary>) -> Self {
        self.shared_dictionaries.insert(col, dictionary);
        self
    }

    pub fn append_row(&mut self, row: &[Value]) -> MvResult<()> {
        if row.len() != self.specs.len() {
            return Err(MvError::SchemaMismatch {
                expected: self.specs.len(),
                actual: row.len(),
            });
        }
        for (col, value) in row.iter().enumerate() {
            if let ColumnSpec::Measure(_) = self.specs[col] {
                if value.as_i64().is_none() {
                    return Err(MvError::Unsupported("non-numeric value in a measure column"));
                }
            }
            self.values[col].push(value.clone());
        }
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> MvResult<Block> {
        let mut infos = Vec::with_capacity(self.specs.len());
        let mut columns = Vec::with_capacity(self.specs.len());

        for (col, (spec, values)) in self.specs.iter().zip(self.values).enumerate() {
            match *spec {
                ColumnSpec::Dimension => {
                    let dict = match self.shared_dictionaries.get(&col) {
                        Some(dict) => dict.clone(),
                        None => Arc::new(Dictionary::from_values(values.iter().cloned())),
                    };
                    let mut column = DimensionColumn::new(dict.len() as u32, self.rows);
                    let mut min: Option<&Value> = None;
                    let mut max: Option<&Value> = None;
                    let mut is_number = true;
                    for (row, value) in values.iter().enumerate() {
                        let code = dict.code_of(value).ok_or_else(|| MvError::NotInDictionary {
                            column: col,
                            value: value.to_string(),
                        })?;
                        column.set(row, code)?;
                        if !value.is_null() {
                            is_number &= value.is_number();
                            min = Some(min.map_or(value, |m| m.min(value)));
                            max = Some(max.map_or(value, |m| m.max(value)));
                        }
                    }
                    let info = ColumnInfo::new(
                        min.cloned().unwrap_or_default(),
                        max.cloned().unwrap_or_default(),
                        is_number && min.is_some(),
                    )
                    .with_dictionary(dict);
                    infos.push(info);
                    columns.push(Column::Dimension(column));
                }
                ColumnSpec::Measure(quantization) => {
                    let ints: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
                    let min = ints.iter().copied().min().unwrap_or(0);
                    let max = ints.iter().copied().max().unwrap_or(0);
                    let mut column = QuantizedColumn::new(quantization, min, max, self.rows)?;
                    for (row, v) in ints.iter().enumerate() {
                        column.set(row, *v)?;
                    }
                    infos.push(ColumnInfo::new(
                        measure_value(quantization, min),
                        measure_value(quantization, max),
                        true,
                    ));
                    columns.push(Column::Measure(column));
                }
            }
        }

        Ok(Block {
            meta: BlockMeta::new(self.rows, infos),
            columns,
        })
    }
}
