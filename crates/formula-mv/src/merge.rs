//! Incremental merge of sorted sub-blocks into a running result.
//!
//! [`GroupMerger`] folds each sub-block into an aggregated, strictly sorted result with one row
//! per key. [`DetailMerger`] streams raw rows straight into a [`RowSink`] up to a row cap.
//! Both poll a [`CancelFlag`] every [`CANCEL_CHECK_INTERVAL`] rows.

use crate::dispatch::FormulaDispatch;
use crate::error::{MvError, MvResult};
use crate::row::{GroupKey, KeyOrder, RawRow, Row, SubBlock};
use crate::spill::{RowCodec, SpillOptions, SpillVec};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Rows processed between two polls of the cancel flag.
pub const CANCEL_CHECK_INTERVAL: usize = 256;

/// Shared "query cancelled" signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Paging of the running result.
    pub spill: SpillOptions,
    /// Row cap of detail merges (default: unlimited).
    pub max_detail_rows: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            spill: SpillOptions::default(),
            max_detail_rows: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The sub-block's rows were merged.
    Merged,
    /// Nothing to do: the sub-block was empty, or a detail merge already hit its cap.
    Empty,
    /// The cancel flag was raised. A grouped merge leaves its running result unchanged; a
    /// detail merge keeps whatever rows of the step already reached the sink (at most
    /// [`CANCEL_CHECK_INTERVAL`] of them).
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Sub-blocks merged to completion.
    pub steps: u64,
    pub rows_folded: u64,
    pub rows_reset: u64,
    pub rows_copied: u64,
    pub cancelled_steps: u64,
}

/// Final output row of a grouped merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub key: GroupKey,
    pub values: Vec<Option<f64>>,
}

/// Consumer of finalized rows.
pub trait RowSink<T> {
    fn append(&mut self, row: T) -> MvResult<()>;

    /// No rows may be appended afterwards.
    fn seal(&mut self) -> MvResult<()>;

    fn is_sealed(&self) -> bool;
}

/// In-memory [`RowSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct VecSink<T> {
    rows: Vec<T>,
    sealed: bool,
}

impl<T> Default for VecSink<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            sealed: false,
        }
    }
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }
}

impl<T> RowSink<T> for VecSink<T> {
    fn append(&mut self, row: T) -> MvResult<()> {
        if self.sealed {
            return Err(MvError::Sealed);
        }
        self.rows.push(row);
        Ok(())
    }

    fn seal(&mut self) -> MvResult<()> {
        self.sealed = true;
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.sealed
    }
}

pub trait Merger {
    fn add_sub_block(&mut self, sub_block: &SubBlock) -> MvResult<MergeOutcome>;

    /// Seal the output. Only the first call has an effect.
    fn complete(&mut self) -> MvResult<()>;

    fn row_count(&self) -> usize;

    fn is_complete(&self) -> bool;
}

/// Grouping merge: maintains one aggregated row per distinct key, sorted by a [`KeyOrder`].
///
/// Each step merge-joins the current result with the incoming sub-block into a fresh generation.
/// Rows of the current generation are copied, never mutated, so a cancelled step leaves the
/// current result exactly as it was. The superseded generation is disposed right after the swap.
#[derive(Debug)]
pub struct GroupMerger {
    templates: Vec<FormulaDispatch>,
    order: KeyOrder,
    options: MergeOptions,
    cancel: CancelFlag,
    current: SpillVec<RowCodec>,
    complete: bool,
    stats: MergeStats,
}

impl GroupMerger {
    pub fn new(
        templates: Vec<FormulaDispatch>,
        order: KeyOrder,
        options: MergeOptions,
        cancel: CancelFlag,
    ) -> MvResult<Self> {
        let mut current = SpillVec::new(RowCodec::new(&templates)?, options.spill.clone());
        current.seal()?;
        Ok(Self {
            templates,
            order,
            options,
            cancel,
            current,
            complete: false,
            stats: MergeStats::default(),
        })
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Pages of the current result that live on disk.
    pub fn spilled_pages(&self) -> usize {
        self.current.spilled_pages()
    }

    /// Snapshot of the row at `idx` in the current result.
    pub fn row(&mut self, idx: usize) -> MvResult<Option<ResultRow>> {
        Ok(self.current.get(idx)?.map(|row| ResultRow {
            key: row.key.clone(),
            values: row.results(),
        }))
    }

    /// Complete the merge, then append every result row to `sink` in order and seal it.
    pub fn emit<S: RowSink<ResultRow>>(&mut self, sink: &mut S) -> MvResult<()> {
        self.complete()?;
        for idx in 0..self.current.len() {
            let row = self
                .row(idx)?
                .ok_or_else(|| MvError::corrupt(format!("result row {idx} missing")))?;
            sink.append(row)?;
        }
        sink.seal()
    }

    /// Into `next`; `Ok(false)` when cancelled part-way.
    fn merge_into(&mut self, rows: &[RawRow], next: &mut SpillVec<RowCodec>) -> MvResult<bool> {
        let total = self.current.len();
        let mut stats = MergeStats::default();
        let (mut i, mut j) = (0, 0);
        let mut processed = 0usize;

        while i < total || j < rows.len() {
            if processed % CANCEL_CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                return Ok(false);
            }
            processed += 1;

            let left = if i < total {
                self.current.get(i)?
            } else {
                None
            };
            match (left, rows.get(j)) {
                (Some(row), Some(raw)) => match self.order.compare(&row.key, &raw.key) {
                    Ordering::Equal => {
                        let mut merged = row.try_clone()?;
                        merged.fold(raw)?;
                        next.push(merged)?;
                        stats.rows_folded += 1;
                        i += 1;
                        j += 1;
                    }
                    Ordering::Less => {
                        next.push(row.try_clone()?)?;
                        stats.rows_copied += 1;
                        i += 1;
                    }
                    Ordering::Greater => {
                        next.push(Row::reset(raw, &self.templates)?)?;
                        stats.rows_reset += 1;
                        j += 1;
                    }
                },
                (Some(row), None) => {
                    next.push(row.try_clone()?)?;
                    stats.rows_copied += 1;
                    i += 1;
                }
                (None, Some(raw)) => {
                    next.push(Row::reset(raw, &self.templates)?)?;
                    stats.rows_reset += 1;
                    j += 1;
                }
                (None, None) => {
                    return Err(MvError::corrupt(format!("result row {i} missing")));
                }
            }
        }

        self.stats.rows_folded += stats.rows_folded;
        self.stats.rows_copied += stats.rows_copied;
        self.stats.rows_reset += stats.rows_reset;
        Ok(true)
    }
}

impl Merger for GroupMerger {
    fn add_sub_block(&mut self, sub_block: &SubBlock) -> MvResult<MergeOutcome> {
        if self.complete {
            return Err(MvError::Sealed);
        }
        if sub_block.is_empty() {
            return Ok(MergeOutcome::Empty);
        }

        let mut next = SpillVec::new(RowCodec::new(&self.templates)?, self.options.spill.clone());
        if !self.merge_into(sub_block.rows(), &mut next)? {
            next.dispose();
            self.stats.cancelled_steps += 1;
            log::debug!(
                "merge step cancelled; keeping {} rows from the previous step",
                self.current.len()
            );
            return Ok(MergeOutcome::Cancelled);
        }
        next.seal()?;

        let previous = std::mem::replace(&mut self.current, next);
        previous.dispose();
        self.stats.steps += 1;
        log::debug!(
            "merged sub-block of {} rows; result now {} rows ({} pages spilled)",
            sub_block.len(),
            self.current.len(),
            self.current.spilled_pages()
        );
        Ok(MergeOutcome::Merged)
    }

    fn complete(&mut self) -> MvResult<()> {
        if self.complete {
            return Ok(());
        }
        self.current.seal()?;
        self.complete = true;
        Ok(())
    }

    fn row_count(&self) -> usize {
        self.current.len()
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Non-aggregating merge: rows go to the sink verbatim, in arrival order, up to a row cap.
///
/// Keys are never read, so rows may repeat a key or carry none at all. Use [`Self::add_rows`]
/// for such input; [`Merger::add_sub_block`] takes the same path for already validated input.
#[derive(Debug)]
pub struct DetailMerger<S: RowSink<RawRow>> {
    sink: S,
    max_rows: usize,
    emitted: usize,
    cancel: CancelFlag,
    complete: bool,
    stats: MergeStats,
}

impl<S: RowSink<RawRow>> DetailMerger<S> {
    pub fn new(sink: S, options: &MergeOptions, cancel: CancelFlag) -> Self {
        Self {
            sink,
            max_rows: options.max_detail_rows,
            emitted: 0,
            cancel,
            complete: false,
            stats: MergeStats::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Rows are streamed into the sink and not retained, so they cannot be looked up.
    pub fn row(&self, _idx: usize) -> MvResult<RawRow> {
        Err(MvError::Unsupported("row lookup on a detail merge"))
    }

    /// Stream `rows` into the sink in order, up to the remaining row budget.
    ///
    /// Cancellation is checked every [`CANCEL_CHECK_INTERVAL`] rows; rows appended before the
    /// check that observed it stay in the sink.
    pub fn add_rows(&mut self, rows: &[RawRow]) -> MvResult<MergeOutcome> {
        if self.complete {
            return Err(MvError::Sealed);
        }
        if rows.is_empty() || self.sink.is_sealed() {
            return Ok(MergeOutcome::Empty);
        }

        let budget = self.max_rows - self.emitted;
        for (processed, raw) in rows.iter().enumerate() {
            if processed % CANCEL_CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                self.stats.cancelled_steps += 1;
                log::debug!("detail merge cancelled after {} rows", self.emitted);
                return Ok(MergeOutcome::Cancelled);
            }
            if processed == budget {
                break;
            }
            self.sink.append(raw.clone())?;
            self.emitted += 1;
            self.stats.rows_copied += 1;
        }

        if self.emitted >= self.max_rows {
            log::debug!("detail merge reached its cap of {} rows", self.max_rows);
            self.sink.seal()?;
        }
        self.stats.steps += 1;
        Ok(MergeOutcome::Merged)
    }
}

impl<S: RowSink<RawRow>> Merger for DetailMerger<S> {
    fn add_sub_block(&mut self, sub_block: &SubBlock) -> MvResult<MergeOutcome> {
        self.add_rows(sub_block.rows())
    }

    fn complete(&mut self) -> MvResult<()> {
        if self.complete {
            return Ok(());
        }
        if !self.sink.is_sealed() {
            self.sink.seal()?;
        }
        self.complete = true;
        Ok(())
    }

    fn row_count(&self) -> usize {
        self.emitted
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Sum;
    use pretty_assertions::assert_eq;

    fn sum_templates() -> Vec<FormulaDispatch> {
        vec![FormulaDispatch::single(0, Box::new(Sum::new())).unwrap()]
    }

    fn sub_block(rows: &[(u32, f64)]) -> SubBlock {
        let rows = rows
            .iter()
            .map(|&(k, v)| RawRow::new(vec![k], vec![v]))
            .collect();
        SubBlock::new(rows, &KeyOrder::ascending(1)).unwrap()
    }

    fn results(merger: &mut GroupMerger) -> Vec<ResultRow> {
        (0..merger.row_count())
            .map(|idx| merger.row(idx).unwrap().unwrap())
            .collect()
    }

    fn result(key: u32, value: f64) -> ResultRow {
        ResultRow {
            key: vec![key],
            values: vec![Some(value)],
        }
    }

    #[test]
    fn merge_join_covers_every_branch() {
        let mut merger = GroupMerger::new(
            sum_templates(),
            KeyOrder::ascending(1),
            MergeOptions::default(),
            CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(
            merger.add_sub_block(&sub_block(&[(2, 1.0), (5, 1.0)])).unwrap(),
            MergeOutcome::Merged
        );
        assert_eq!(
            merger
                .add_sub_block(&sub_block(&[(1, 3.0), (5, 4.0), (9, 2.0)]))
                .unwrap(),
            MergeOutcome::Merged
        );
        assert_eq!(
            merger.add_sub_block(&SubBlock::default()).unwrap(),
            MergeOutcome::Empty
        );

        assert_eq!(
            results(&mut merger),
            vec![result(1, 3.0), result(2, 1.0), result(5, 5.0), result(9, 2.0)]
        );
        let stats = merger.stats();
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.rows_folded, 1);
        assert_eq!(stats.rows_reset, 4);
        assert_eq!(stats.rows_copied, 1);
    }

    #[test]
    fn complete_is_idempotent_and_blocks_adds() {
        let mut merger = GroupMerger::new(
            sum_templates(),
            KeyOrder::ascending(1),
            MergeOptions::default(),
            CancelFlag::new(),
        )
        .unwrap();
        merger.add_sub_block(&sub_block(&[(1, 1.0)])).unwrap();
        merger.complete().unwrap();
        merger.complete().unwrap();
        assert!(merger.is_complete());
        assert!(matches!(
            merger.add_sub_block(&sub_block(&[(2, 1.0)])),
            Err(MvError::Sealed)
        ));

        let mut sink = VecSink::new();
        merger.emit(&mut sink).unwrap();
        assert!(sink.is_sealed());
        assert_eq!(sink.into_rows(), vec![result(1, 1.0)]);
    }

    #[test]
    fn cancelled_before_first_row() {
        let cancel = CancelFlag::new();
        let mut merger = GroupMerger::new(
            sum_templates(),
            KeyOrder::ascending(1),
            MergeOptions::default(),
            cancel.clone(),
        )
        .unwrap();
        merger.add_sub_block(&sub_block(&[(1, 1.0)])).unwrap();
        cancel.cancel();
        assert_eq!(
            merger.add_sub_block(&sub_block(&[(1, 1.0)])).unwrap(),
            MergeOutcome::Cancelled
        );
        assert_eq!(results(&mut merger), vec![result(1, 1.0)]);
        assert_eq!(merger.stats().cancelled_steps, 1);
    }

    #[test]
    fn detail_row_lookup_is_unsupported() {
        let merger = DetailMerger::new(
            VecSink::new(),
            &MergeOptions::default(),
            CancelFlag::new(),
        );
        assert!(matches!(merger.row(0), Err(MvError::Unsupported(_))));
    }

    #[test]
    fn detail_keeps_arrival_order() {
        let mut merger = DetailMerger::new(
            VecSink::new(),
            &MergeOptions::default(),
            CancelFlag::new(),
        );
        merger.add_sub_block(&sub_block(&[(4, 1.0), (7, 2.0)])).unwrap();
        merger.add_sub_block(&sub_block(&[(1, 3.0)])).unwrap();
        merger.complete().unwrap();
        let keys: Vec<u32> = merger.sink().rows().iter().map(|r| r.key[0]).collect();
        assert_eq!(keys, vec![4, 7, 1]);
        assert!(merger.sink().is_sealed());
    }
}
