use crate::error::{MvError, MvResult};
use crate::formula::{Formula, FormulaInput};
use std::io::{self, Read, Write};

/// Feeds a row's measure values into one aggregation primitive.
///
/// The variant is picked by how many measure columns the formula reads: `Single` reads one fixed
/// index with no temporary allocation, `Multi` gathers its columns into a buffer reused across
/// rows.
#[derive(Debug)]
pub enum FormulaDispatch {
    Single {
        column: usize,
        formula: Box<dyn Formula>,
    },
    Multi {
        columns: Vec<usize>,
        buffer: Vec<f64>,
        formula: Box<dyn Formula>,
    },
}

impl FormulaDispatch {
    pub fn single(column: usize, formula: Box<dyn Formula>) -> MvResult<Self> {
        if formula.arity() > 1 {
            return Err(MvError::FormulaArity {
                expected: formula.arity(),
                actual: 1,
            });
        }
        Ok(FormulaDispatch::Single { column, formula })
    }

    pub fn multi(columns: Vec<usize>, formula: Box<dyn Formula>) -> MvResult<Self> {
        let arity = formula.arity();
        if columns.is_empty() || (arity > 1 && columns.len() != arity) {
            return Err(MvError::FormulaArity {
                expected: arity,
                actual: columns.len(),
            });
        }
        Ok(FormulaDispatch::Multi {
            buffer: Vec::with_capacity(columns.len()),
            columns,
            formula,
        })
    }

    /// `Single` for one column, `Multi` otherwise.
    pub fn for_columns(columns: Vec<usize>, formula: Box<dyn Formula>) -> MvResult<Self> {
        match columns.as_slice() {
            [column] if formula.arity() <= 1 => Self::single(*column, formula),
            _ => Self::multi(columns, formula),
        }
    }

    pub fn add_value(&mut self, measures: &[f64]) -> MvResult<()> {
        match self {
            FormulaDispatch::Single { column, formula } => {
                let v = measure_at(measures, *column)?;
                formula.add_value(FormulaInput::Scalar(v));
            }
            FormulaDispatch::Multi {
                columns,
                buffer,
                formula,
            } => {
                buffer.clear();
                for &column in columns.iter() {
                    buffer.push(measure_at(measures, column)?);
                }
                formula.add_value(FormulaInput::Vector(buffer.as_slice()));
            }
        }
        Ok(())
    }

    pub fn is_member_column(&self, idx: usize) -> bool {
        match self {
            FormulaDispatch::Single { column, .. } => *column == idx,
            FormulaDispatch::Multi { columns, .. } => columns.contains(&idx),
        }
    }

    pub fn formula(&self) -> &dyn Formula {
        match self {
            FormulaDispatch::Single { formula, .. } | FormulaDispatch::Multi { formula, .. } => {
                formula.as_ref()
            }
        }
    }

    pub fn result(&self) -> Option<f64> {
        self.formula().result()
    }

    /// Copy with independent formula state, so a template can seed many groups.
    ///
    /// A formula that cannot be cloned fails the copy; sharing state between groups would
    /// silently mix their aggregates.
    pub fn deep_clone(&self) -> MvResult<Self> {
        let formula = self.formula().try_clone().map_err(|err| {
            log::warn!("formula {:?} could not be cloned: {err}", self.formula());
            match err {
                MvError::FormulaClone(_) => err,
                other => MvError::FormulaClone(other.to_string()),
            }
        })?;
        Ok(match self {
            FormulaDispatch::Single { column, .. } => FormulaDispatch::Single {
                column: *column,
                formula,
            },
            FormulaDispatch::Multi { columns, .. } => FormulaDispatch::Multi {
                columns: columns.clone(),
                buffer: Vec::with_capacity(columns.len()),
                formula,
            },
        })
    }

    pub(crate) fn write_state(&self, out: &mut dyn Write) -> io::Result<()> {
        self.formula().write_state(out)
    }

    pub(crate) fn read_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        match self {
            FormulaDispatch::Single { formula, .. } | FormulaDispatch::Multi { formula, .. } => {
                formula.read_state(input)
            }
        }
    }
}

fn measure_at(measures: &[f64], column: usize) -> MvResult<f64> {
    measures
        .get(column)
        .copied()
        .ok_or(MvError::ColumnOutOfRange {
            column,
            columns: measures.len(),
        })
}
