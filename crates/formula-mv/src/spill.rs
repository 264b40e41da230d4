//! Append-only sequence stored as fixed-size pages, spilling cold pages to an unnamed temp file.
//!
//! The running result of a grouped merge can outgrow memory. [`SpillVec`] keeps at most
//! `max_resident_pages` full pages in memory; older pages are encoded with a [`PageCodec`] and
//! appended to a temp file that the OS removes once the sequence is dropped. Readers address items
//! by index and never need to know which pages are on disk.

use crate::dispatch::FormulaDispatch;
use crate::error::{MvError, MvResult};
use crate::row::Row;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillOptions {
    /// Items per page (default: 1024).
    pub page_rows: usize,
    /// Full pages kept in memory before older ones go to disk (default: 8).
    pub max_resident_pages: usize,
    /// Directory for spill files; the system temp dir when `None`.
    pub spill_dir: Option<PathBuf>,
}

impl Default for SpillOptions {
    fn default() -> Self {
        Self {
            page_rows: 1024,
            max_resident_pages: 8,
            spill_dir: None,
        }
    }
}

impl SpillOptions {
    pub fn new(page_rows: usize, max_resident_pages: usize) -> Self {
        Self {
            page_rows,
            max_resident_pages,
            spill_dir: None,
        }
        .normalized()
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    fn normalized(mut self) -> Self {
        self.page_rows = self.page_rows.max(1);
        self.max_resident_pages = self.max_resident_pages.max(1);
        self
    }
}

/// Byte encoding for the items of a [`SpillVec`].
pub trait PageCodec {
    type Item;

    fn encode(&self, item: &Self::Item, out: &mut dyn Write) -> MvResult<()>;

    fn decode(&self, input: &mut dyn Read) -> MvResult<Self::Item>;
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    byte_len: usize,
    rows: usize,
}

enum Page<T> {
    Resident(Vec<T>),
    Spilled(Extent),
}

pub struct SpillVec<C: PageCodec> {
    codec: C,
    options: SpillOptions,
    /// Full pages (plus the final partial page once sealed). Spilled pages always form a prefix.
    pages: Vec<Page<C::Item>>,
    tail: Vec<C::Item>,
    len: usize,
    spilled_pages: usize,
    file: Option<File>,
    file_len: u64,
    /// Most recently paged-in spilled page.
    loaded: Option<(usize, Vec<C::Item>)>,
    sealed: bool,
}

impl<C: PageCodec> fmt::Debug for SpillVec<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillVec")
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .field("spilled_pages", &self.spilled_pages)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl<C: PageCodec> SpillVec<C> {
    pub fn new(codec: C, options: SpillOptions) -> Self {
        let options = options.normalized();
        Self {
            codec,
            tail: Vec::with_capacity(options.page_rows.min(1024)),
            options,
            pages: Vec::new(),
            len: 0,
            spilled_pages: 0,
            file: None,
            file_len: 0,
            loaded: None,
            sealed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn spilled_pages(&self) -> usize {
        self.spilled_pages
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len() - self.spilled_pages
    }

    pub fn push(&mut self, item: C::Item) -> MvResult<()> {
        if self.sealed {
            return Err(MvError::Sealed);
        }
        self.tail.push(item);
        self.len += 1;
        if self.tail.len() >= self.options.page_rows {
            self.flush_tail()?;
        }
        Ok(())
    }

    /// Make the sequence read-only. Sealing twice is a no-op.
    pub fn seal(&mut self) -> MvResult<()> {
        if self.sealed {
            return Ok(());
        }
        if !self.tail.is_empty() {
            self.flush_tail()?;
        }
        self.sealed = true;
        Ok(())
    }

    pub fn get(&mut self, idx: usize) -> MvResult<Option<&C::Item>> {
        if idx >= self.len {
            return Ok(None);
        }
        let page = idx / self.options.page_rows;
        let slot = idx % self.options.page_rows;
        if page == self.pages.len() {
            return Ok(self.tail.get(slot));
        }

        let spilled = match self.pages[page] {
            Page::Resident(_) => None,
            Page::Spilled(extent) => Some(extent),
        };
        if let Some(extent) = spilled {
            if self.loaded.as_ref().map(|(p, _)| *p) != Some(page) {
                let items = self.read_page(extent)?;
                self.loaded = Some((page, items));
            }
            return Ok(self.loaded.as_ref().and_then(|(_, items)| items.get(slot)));
        }
        match &self.pages[page] {
            Page::Resident(items) => Ok(items.get(slot)),
            Page::Spilled(_) => Ok(None),
        }
    }

    /// Release all storage, including the spill file.
    pub fn dispose(self) {
        if self.file.is_some() {
            log::debug!(
                "disposing spilled sequence: {} items, {} pages on disk ({} bytes)",
                self.len,
                self.spilled_pages,
                self.file_len
            );
        }
    }

    fn flush_tail(&mut self) -> MvResult<()> {
        let items = mem::take(&mut self.tail);
        self.pages.push(Page::Resident(items));
        while self.resident_pages() > self.options.max_resident_pages {
            self.spill_oldest()?;
        }
        Ok(())
    }

    fn spill_oldest(&mut self) -> MvResult<()> {
        let idx = self.spilled_pages;
        let mut buf = Vec::new();
        let rows = match &self.pages[idx] {
            Page::Resident(items) => {
                for item in items {
                    self.codec.encode(item, &mut buf)?;
                }
                items.len()
            }
            Page::Spilled(_) => return Err(MvError::corrupt("spilled pages out of order")),
        };

        let offset = self.file_len;
        let file = self.spill_file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        self.file_len += buf.len() as u64;

        self.pages[idx] = Page::Spilled(Extent {
            offset,
            byte_len: buf.len(),
            rows,
        });
        self.spilled_pages += 1;
        log::debug!("spilled page {idx} ({rows} items, {} bytes)", buf.len());
        Ok(())
    }

    fn spill_file(&mut self) -> MvResult<&mut File> {
        if self.file.is_none() {
            let file = match &self.options.spill_dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| MvError::corrupt("spill file unavailable"))
    }

    fn read_page(&mut self, extent: Extent) -> MvResult<Vec<C::Item>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| MvError::corrupt("spilled page without a spill file"))?;
        file.seek(SeekFrom::Start(extent.offset))?;
        let mut buf = vec![0u8; extent.byte_len];
        file.read_exact(&mut buf)?;

        let mut input: &[u8] = &buf;
        let mut items = Vec::with_capacity(extent.rows);
        for _ in 0..extent.rows {
            items.push(self.codec.decode(&mut input)?);
        }
        if !input.is_empty() {
            return Err(MvError::corrupt(format!(
                "{} trailing bytes in spilled page",
                input.len()
            )));
        }
        Ok(items)
    }
}

/// Encodes aggregated rows as `key_len:u32`, the key codes, then each aggregate's formula state.
#[derive(Debug)]
pub struct RowCodec {
    templates: Vec<FormulaDispatch>,
}

impl RowCodec {
    pub fn new(templates: &[FormulaDispatch]) -> MvResult<Self> {
        let templates = templates
            .iter()
            .map(FormulaDispatch::deep_clone)
            .collect::<MvResult<Vec<_>>>()?;
        Ok(Self { templates })
    }
}

impl PageCodec for RowCodec {
    type Item = Row;

    fn encode(&self, row: &Row, out: &mut dyn Write) -> MvResult<()> {
        debug_assert_eq!(row.aggregates.len(), self.templates.len());
        let key_len = u32::try_from(row.key.len())
            .map_err(|_| MvError::corrupt("group key too long"))?;
        out.write_u32::<LittleEndian>(key_len)?;
        for &code in &row.key {
            out.write_u32::<LittleEndian>(code)?;
        }
        for aggregate in &row.aggregates {
            aggregate.write_state(out)?;
        }
        Ok(())
    }

    fn decode(&self, input: &mut dyn Read) -> MvResult<Row> {
        let key_len = input.read_u32::<LittleEndian>()? as usize;
        let mut key = Vec::with_capacity(key_len.min(64));
        for _ in 0..key_len {
            key.push(input.read_u32::<LittleEndian>()?);
        }
        let mut aggregates = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            let mut aggregate = template.deep_clone()?;
            aggregate.read_state(input)?;
            aggregates.push(aggregate);
        }
        Ok(Row { key, aggregates })
    }
}
