//! Materialized-view data engine for Formula.
//!
//! This crate focuses on:
//! - Compact columnar blocks: dictionary-coded dimensions and range-quantized, bit-packed measures,
//!   paged in lazily from a backing [`Channel`].
//! - Incremental merge of sorted per-partition sub-blocks into one aggregated result, spilling to
//!   disk under a page budget and honouring cooperative cancellation.
//! - A two-tier (memory + disk swap) TTL cache for filter masks.

#![forbid(unsafe_code)]

mod bitmap;
mod bitpacking;
mod block;
mod cache;
mod channel;
mod column;
mod dictionary;
mod dispatch;
mod error;
mod formula;
mod merge;
mod meta;
mod row;
mod spill;
mod value;

pub use crate::bitmap::BitVec;
pub use crate::bitpacking::{bits_required, BitPackedBuffer};
pub use crate::block::{Block, BlockBuilder, ColumnSpec};
pub use crate::cache::{
    CacheConfig, CacheStats, Clock, FilterMaskCache, ManualClock, SwapValue, SystemClock,
    TwoTierCache,
};
pub use crate::channel::{Channel, FileChannel, ReadSeek, WriteSeek};
pub use crate::column::{Column, DimensionColumn, Quantization, QuantizedColumn};
pub use crate::dictionary::Dictionary;
pub use crate::dispatch::FormulaDispatch;
pub use crate::error::{MvError, MvResult};
pub use crate::formula::{Average, Count, Formula, FormulaInput, Max, Min, Sum, WeightedAverage};
pub use crate::merge::{
    CancelFlag, DetailMerger, GroupMerger, MergeOptions, MergeOutcome, MergeStats, Merger,
    ResultRow, RowSink, VecSink, CANCEL_CHECK_INTERVAL,
};
pub use crate::meta::{BlockMeta, ColumnInfo};
pub use crate::row::{GroupKey, KeyOrder, RawRow, Row, SortDirection, SubBlock};
pub use crate::spill::{PageCodec, RowCodec, SpillOptions, SpillVec};
pub use crate::value::{read_value, write_value, Value};
