use crate::dispatch::FormulaDispatch;
use crate::error::{MvError, MvResult};
use std::cmp::Ordering;

/// Ordered dimension codes identifying one group.
pub type GroupKey = Vec<u32>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Per-query ordering of grouping keys: one direction per key column.
///
/// Keys compare column by column; a key that is a strict prefix of another sorts first. Columns
/// past the end of `directions` sort ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyOrder {
    directions: Vec<SortDirection>,
}

impl KeyOrder {
    pub fn new(directions: Vec<SortDirection>) -> Self {
        Self { directions }
    }

    pub fn ascending(columns: usize) -> Self {
        Self::new(vec![SortDirection::Ascending; columns])
    }

    pub fn compare(&self, a: &[u32], b: &[u32]) -> Ordering {
        for (idx, (x, y)) in a.iter().zip(b).enumerate() {
            let ord = match self.directions.get(idx).copied().unwrap_or_default() {
                SortDirection::Ascending => x.cmp(y),
                SortDirection::Descending => y.cmp(x),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.len().cmp(&b.len())
    }
}

/// One row of a sub-block: dimension codes plus raw measure values.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRow {
    pub key: GroupKey,
    pub measures: Vec<f64>,
}

impl RawRow {
    pub fn new(key: GroupKey, measures: Vec<f64>) -> Self {
        Self { key, measures }
    }
}

/// An aggregated group: its key and one accumulator per formula.
#[derive(Debug)]
pub struct Row {
    pub key: GroupKey,
    pub aggregates: Vec<FormulaDispatch>,
}

impl Row {
    /// Start a new group seeded from a single raw row.
    pub fn reset(raw: &RawRow, templates: &[FormulaDispatch]) -> MvResult<Self> {
        let mut aggregates = Vec::with_capacity(templates.len());
        for template in templates {
            let mut aggregate = template.deep_clone()?;
            aggregate.add_value(&raw.measures)?;
            aggregates.push(aggregate);
        }
        Ok(Self {
            key: raw.key.clone(),
            aggregates,
        })
    }

    /// Fold another raw row with the same key into this group.
    pub fn fold(&mut self, raw: &RawRow) -> MvResult<()> {
        debug_assert_eq!(self.key, raw.key, "fold requires identical keys");
        for aggregate in &mut self.aggregates {
            aggregate.add_value(&raw.measures)?;
        }
        Ok(())
    }

    pub fn try_clone(&self) -> MvResult<Self> {
        let aggregates = self
            .aggregates
            .iter()
            .map(FormulaDispatch::deep_clone)
            .collect::<MvResult<Vec<_>>>()?;
        Ok(Self {
            key: self.key.clone(),
            aggregates,
        })
    }

    pub fn results(&self) -> Vec<Option<f64>> {
        self.aggregates.iter().map(FormulaDispatch::result).collect()
    }
}

/// One partition's rows, strictly sorted by a [`KeyOrder`] with at most one row per key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubBlock {
    rows: Vec<RawRow>,
}

impl SubBlock {
    /// Wrap rows that are already sorted; out-of-order or repeated keys are rejected.
    pub fn new(rows: Vec<RawRow>, order: &KeyOrder) -> MvResult<Self> {
        for (idx, pair) in rows.windows(2).enumerate() {
            match order.compare(&pair[0].key, &pair[1].key) {
                Ordering::Less => {}
                Ordering::Equal => return Err(MvError::DuplicateKey { index: idx + 1 }),
                Ordering::Greater => return Err(MvError::NotSorted { index: idx + 1 }),
            }
        }
        Ok(Self { rows })
    }

    pub fn from_unsorted(mut rows: Vec<RawRow>, order: &KeyOrder) -> MvResult<Self> {
        rows.sort_by(|a, b| order.compare(&a.key, &b.key));
        Self::new(rows, order)
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
