//! Aggregation primitives fed by [`crate::dispatch::FormulaDispatch`].
//!
//! [`Formula`] is the seam for externally supplied aggregations; the built-ins below cover the
//! common BI measures. Every formula can serialize its accumulated state so rows holding it can
//! be spilled to disk and restored.

use crate::error::MvResult;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};

/// Measure values for one row, as seen by a formula.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FormulaInput<'a> {
    Scalar(f64),
    Vector(&'a [f64]),
}

impl FormulaInput<'_> {
    pub fn as_slice(&self) -> &[f64] {
        match self {
            FormulaInput::Scalar(v) => std::slice::from_ref(v),
            FormulaInput::Vector(values) => values,
        }
    }
}

pub trait Formula: fmt::Debug + Send {
    /// Number of measure values consumed per row.
    fn arity(&self) -> usize {
        1
    }

    fn add_value(&mut self, input: FormulaInput<'_>);

    /// Aggregated value, or `None` when nothing contributed (a blank result).
    fn result(&self) -> Option<f64>;

    /// Independent copy carrying the same accumulated state.
    fn try_clone(&self) -> MvResult<Box<dyn Formula>>;

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()>;

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()>;
}

fn write_opt(out: &mut dyn Write, value: Option<f64>) -> io::Result<()> {
    match value {
        Some(v) => {
            out.write_u8(1)?;
            out.write_f64::<LittleEndian>(v)
        }
        None => out.write_u8(0),
    }
}

fn read_opt(input: &mut dyn Read) -> io::Result<Option<f64>> {
    Ok(match input.read_u8()? {
        0 => None,
        _ => Some(input.read_f64::<LittleEndian>()?),
    })
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sum {
    sum: Option<f64>,
}

impl Sum {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for Sum {
    fn add_value(&mut self, input: FormulaInput<'_>) {
        let total: f64 = input.as_slice().iter().sum();
        self.sum = Some(self.sum.unwrap_or(0.0) + total);
    }

    fn result(&self) -> Option<f64> {
        self.sum
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        write_opt(out, self.sum)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.sum = read_opt(input)?;
        Ok(())
    }
}

/// Counts contributing rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Count {
    count: u64,
}

impl Count {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for Count {
    fn add_value(&mut self, _input: FormulaInput<'_>) {
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        Some(self.count as f64)
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.count)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.count = input.read_u64::<LittleEndian>()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Average {
    sum: f64,
    count: u64,
}

impl Average {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for Average {
    fn add_value(&mut self, input: FormulaInput<'_>) {
        for v in input.as_slice() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_f64::<LittleEndian>(self.sum)?;
        out.write_u64::<LittleEndian>(self.count)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.sum = input.read_f64::<LittleEndian>()?;
        self.count = input.read_u64::<LittleEndian>()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Min {
    min: Option<f64>,
}

impl Min {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for Min {
    fn add_value(&mut self, input: FormulaInput<'_>) {
        for &v in input.as_slice() {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
        }
    }

    fn result(&self) -> Option<f64> {
        self.min
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        write_opt(out, self.min)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.min = read_opt(input)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Max {
    max: Option<f64>,
}

impl Max {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for Max {
    fn add_value(&mut self, input: FormulaInput<'_>) {
        for &v in input.as_slice() {
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn result(&self) -> Option<f64> {
        self.max
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        write_opt(out, self.max)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.max = read_opt(input)?;
        Ok(())
    }
}

/// `sum(value * weight) / sum(weight)` over `[value, weight]` pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightedAverage {
    weighted_sum: f64,
    weight_sum: f64,
}

impl WeightedAverage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formula for WeightedAverage {
    fn arity(&self) -> usize {
        2
    }

    fn add_value(&mut self, input: FormulaInput<'_>) {
        if let [value, weight] = input.as_slice() {
            self.weighted_sum += value * weight;
            self.weight_sum += weight;
        }
    }

    fn result(&self) -> Option<f64> {
        (self.weight_sum != 0.0).then(|| self.weighted_sum / self.weight_sum)
    }

    fn try_clone(&self) -> MvResult<Box<dyn Formula>> {
        Ok(Box::new(self.clone()))
    }

    fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_f64::<LittleEndian>(self.weighted_sum)?;
        out.write_f64::<LittleEndian>(self.weight_sum)
    }

    fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.weighted_sum = input.read_f64::<LittleEndian>()?;
        self.weight_sum = input.read_f64::<LittleEndian>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn feed(formula: &mut dyn Formula, values: &[f64]) {
        for &v in values {
            formula.add_value(FormulaInput::Scalar(v));
        }
    }

    #[test]
    fn builtins_aggregate_scalars() {
        let values = [4.0, -1.0, 9.0];
        let mut sum = Sum::new();
        let mut count = Count::new();
        let mut avg = Average::new();
        let mut min = Min::new();
        let mut max = Max::new();
        assert_eq!(sum.result(), None);
        assert_eq!(avg.result(), None);
        for f in [
            &mut sum as &mut dyn Formula,
            &mut count,
            &mut avg,
            &mut min,
            &mut max,
        ] {
            feed(f, &values);
        }
        assert_eq!(sum.result(), Some(12.0));
        assert_eq!(count.result(), Some(3.0));
        assert_eq!(avg.result(), Some(4.0));
        assert_eq!(min.result(), Some(-1.0));
        assert_eq!(max.result(), Some(9.0));
    }

    #[test]
    fn weighted_average_uses_pairs() {
        let mut f = WeightedAverage::new();
        assert_eq!(f.arity(), 2);
        f.add_value(FormulaInput::Vector(&[10.0, 1.0]));
        f.add_value(FormulaInput::Vector(&[20.0, 3.0]));
        assert_eq!(f.result(), Some(17.5));
    }

    #[test]
    fn state_survives_serialization() {
        let mut avg = Average::new();
        feed(&mut avg, &[1.0, 2.0]);
        let mut buf = Vec::new();
        avg.write_state(&mut buf).unwrap();

        let mut restored = Average::new();
        restored.read_state(&mut Cursor::new(buf)).unwrap();
        assert_eq!(restored, avg);

        let mut min = Min::new();
        let mut buf = Vec::new();
        min.write_state(&mut buf).unwrap();
        min.add_value(FormulaInput::Scalar(3.0));
        min.read_state(&mut Cursor::new(buf)).unwrap();
        assert_eq!(min.result(), None);
    }
}
