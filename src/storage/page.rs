//! # PageInfo — the live view over one logical page
//!
//! A `PageInfo` pairs the durable [`PageHeader`](super::PageHeader) of a
//! logical page with an optional live [`Compressor`]. Without a compressor
//! it is a pure read-view; [`PageInfo::ensure_dp_available`] lazily
//! rehydrates one from the mapped window when datapoints are needed.
//!
//! ## No Stored Back-Reference
//!
//! A page belongs to exactly one [`PageManager`], but the `PageInfo` never
//! stores a pointer into the manager's mapping. It keeps the logical header
//! index plus a cached copy of the window geometry, and every operation
//! takes the owning manager as a parameter to resolve headers and byte
//! windows on demand. The mapping can therefore be remapped (grow, shrink,
//! compaction) without any dangling-view hazard — the borrow checker simply
//! refuses a stale window.
//!
//! ## Window Geometry
//!
//! The page's bytes live at `page_index * PAGE_SIZE + offset` in the file,
//! `size` bytes long. A fresh page owns a whole physical page
//! (`offset = 0, size = PAGE_SIZE`); after compaction several shrunken
//! pages may share one physical page at different offsets.

use eyre::{ensure, Result};
use tracing::trace;

use crate::compress::{Compressor, CompressorPosition, DP_RECORD_SIZE};
use crate::error::StorageError;
use crate::memory::MemoryPool;
use crate::storage::page_manager::PageManager;
use crate::types::{DataPoint, HeaderIndex, PageIndex, TimeRange, Timestamp};

/// In-memory view over one logical page.
#[derive(Debug, Default)]
pub struct PageInfo {
    header_index: HeaderIndex,
    page_index: PageIndex,
    offset: u16,
    size: u16,
    full: bool,
    out_of_order: bool,
    time_range: TimeRange,
    compressor: Option<Compressor>,
}

impl PageInfo {
    /// Clears all state for pool reuse. The compressor must already have
    /// been recycled; dropping one here would leak it from its free-list.
    pub fn reset(&mut self) {
        debug_assert!(self.compressor.is_none());
        *self = Self::default();
    }

    /// Mints a fresh page: writes the initial header and caches its
    /// geometry. The caller installs a compressor via `setup_compressor`.
    pub fn init_for_disk(
        &mut self,
        pm: &mut PageManager,
        header_index: HeaderIndex,
        page_index: PageIndex,
        size: u16,
        out_of_order: bool,
    ) -> Result<()> {
        debug_assert!(size > 1);
        let file_range = *pm.time_range();

        let header = pm.page_header_mut(header_index)?;
        header.init(page_index, size, out_of_order);

        self.header_index = header_index;
        self.page_index = page_index;
        self.offset = 0;
        self.size = size;
        self.full = false;
        self.out_of_order = out_of_order;
        self.time_range = TimeRange::empty_within(&file_range);
        self.compressor = None;
        Ok(())
    }

    /// Attaches to an existing header as a read-view (no compressor yet).
    pub fn init_from_disk(&mut self, pm: &PageManager, header_index: HeaderIndex) -> Result<()> {
        let start = pm.time_range().from();
        let header = pm.page_header(header_index)?;

        // header self-check; a bad entry quarantines the file
        ensure!(
            header.offset() as u32 + header.size() as u32 <= pm.page_size()
                && header.page_index() < pm.actual_pg_cnt()
                && header.tstamp_from() <= header.tstamp_to(),
            StorageError::Corrupt
        );

        self.header_index = header_index;
        self.page_index = header.page_index();
        self.offset = header.offset();
        self.size = header.size();
        self.full = header.is_full();
        self.out_of_order = header.is_out_of_order();
        self.time_range = if header.is_empty() {
            TimeRange::empty_within(pm.time_range())
        } else {
            header.time_range(start)
        };
        self.compressor = None;
        Ok(())
    }

    /// Installs a compressor bound to this page's window. Out-of-order
    /// pages always get version 0, whatever the file default says.
    pub fn setup_compressor(&mut self, pm: &PageManager, pool: &MemoryPool, version: u8) {
        if let Some(old) = self.compressor.take() {
            pool.release_compressor(old);
        }
        let version = if self.out_of_order { 0 } else { version };
        self.compressor =
            Some(pool.acquire_compressor(version, pm.time_range().from(), self.size as usize));
    }

    /// Idempotent lazy rehydration: if no compressor is installed, set one
    /// up and replay the persisted window into it. Decoded datapoints are
    /// appended to `out` when provided.
    pub fn ensure_dp_available(
        &mut self,
        pm: &PageManager,
        pool: &MemoryPool,
        out: Option<&mut Vec<DataPoint>>,
    ) -> Result<()> {
        if self.compressor.is_some() {
            return Ok(());
        }

        let header = pm.page_header(self.header_index)?;
        let position = CompressorPosition {
            offset: header.cursor(),
            start: header.start(),
        };

        self.setup_compressor(pm, pool, pm.compressor_version());
        let window = pm.window(self.page_index, self.offset, self.size as usize)?;
        self.compressor
            .as_mut()
            .expect("compressor installed above")
            .restore(window, position, out)
    }

    /// Appends a datapoint through the compressor. `Ok(false)` when the
    /// page is full (or is a bare read-view); `OutOfOrder` bubbles up for
    /// rerouting.
    pub fn add_data_point(
        &mut self,
        pm: &mut PageManager,
        tstamp: Timestamp,
        value: f64,
    ) -> Result<bool> {
        let Some(compressor) = self.compressor.as_mut() else {
            return Ok(false);
        };
        let window = pm.window_mut(self.page_index, self.offset, self.size as usize)?;
        let accepted = compressor.compress(window, tstamp, value)?;
        if accepted {
            self.time_range.add_time(tstamp);
        }
        Ok(accepted)
    }

    /// Writes compressor state back into the header. Version 0 (or an
    /// explicit `copy_data`) also copies the working buffer into the mapped
    /// window. Timestamps are stored as deltas from the file start.
    pub fn persist(&mut self, pm: &mut PageManager, copy_data: bool) -> Result<()> {
        let Some(compressor) = self.compressor.as_ref() else {
            return Ok(());
        };

        let position = compressor.save_position();
        if compressor.version() == 0 || copy_data {
            let window = pm.window_mut(self.page_index, self.offset, self.size as usize)?;
            compressor.save_buffer(window);
        }

        let start = pm.time_range().from();
        let full = self.full || compressor.is_full();
        let (from, to) = if self.time_range.is_empty() {
            (0, 0)
        } else {
            debug_assert!(start <= self.time_range.from());
            (
                (self.time_range.from() - start) as u32,
                (self.time_range.to() - start) as u32,
            )
        };

        let header = pm.page_header_mut(self.header_index)?;
        header.set_cursor(position.offset);
        header.set_start(position.start);
        header.set_full(full);
        header.set_tstamp_from(from);
        header.set_tstamp_to(to);
        self.full = full;
        Ok(())
    }

    /// Persists, drops the window from the resident set, and recycles the
    /// compressor if the page is sealed.
    pub fn flush(&mut self, pm: &mut PageManager, pool: &MemoryPool) -> Result<()> {
        if self.compressor.is_none() {
            return Ok(());
        }
        self.persist(pm, false)?;
        pm.advise_dont_need_page(self.page_index);
        if self.is_full() {
            self.recycle(pool);
        }
        Ok(())
    }

    /// Returns the compressor to the pool, leaving a pure read-view.
    pub fn recycle(&mut self, pool: &MemoryPool) {
        if let Some(compressor) = self.compressor.take() {
            pool.release_compressor(compressor);
        }
    }

    /// Compaction helper: clamp the durable window to the bytes actually
    /// used, seal the page, and flush. The cursor counts datapoints for
    /// version 0, hence the record-size multiplier.
    pub fn shrink_to_fit(&mut self, pm: &mut PageManager, pool: &MemoryPool) -> Result<()> {
        self.persist(pm, false)?;

        let version = pm.compressor_version_for(self.out_of_order);
        let header = pm.page_header_mut(self.header_index)?;
        let mut size = header.cursor();
        if header.start() != 0 {
            size += 1;
        }
        if version == 0 {
            size *= DP_RECORD_SIZE as u16;
        }
        debug_assert!(size != 0);
        header.set_size(size);
        header.set_full(true);
        self.size = size;
        self.full = true;

        self.flush(pm, pool)
    }

    /// Compaction move: rebinds this page directly behind `dst` inside
    /// `dst`'s physical page, relocating the data bytes.
    pub fn merge_after(&mut self, pm: &mut PageManager, dst: &PageInfo) -> Result<()> {
        let used = self
            .compressor
            .as_ref()
            .map(|c| c.size() as u16)
            .unwrap_or(0);
        debug_assert!(used > 0);
        self.relocate(pm, dst.page_index, dst.offset + dst.size, used)
    }

    /// Compaction move: rebinds this page to the start of a fresh physical
    /// page.
    pub fn copy_to(&mut self, pm: &mut PageManager, dst_page_index: PageIndex) -> Result<()> {
        let used = self
            .compressor
            .as_ref()
            .map(|c| c.size() as u16)
            .unwrap_or(0);
        debug_assert!(used > 0);
        self.relocate(pm, dst_page_index, 0, used)
    }

    fn relocate(
        &mut self,
        pm: &mut PageManager,
        page_index: PageIndex,
        offset: u16,
        size: u16,
    ) -> Result<()> {
        ensure!(
            offset as u32 + size as u32 <= pm.page_size(),
            "relocation window {}+{} exceeds page size {}",
            offset,
            size,
            pm.page_size()
        );

        // The in-place codec's bytes live in the old window; carry them
        // over. Version 0 re-serializes on persist anyway.
        let bytes = pm
            .window(self.page_index, self.offset, size as usize)?
            .to_vec();

        trace!(
            header_index = self.header_index,
            from_page = self.page_index,
            to_page = page_index,
            offset,
            size,
            "relocating page"
        );

        self.page_index = page_index;
        self.offset = offset;
        self.size = size;

        let header = pm.page_header_mut(self.header_index)?;
        header.set_page_index(page_index);
        header.set_offset(offset);
        header.set_size(size);

        pm.window_mut(page_index, offset, size as usize)?
            .copy_from_slice(&bytes);
        self.persist(pm, true)
    }

    /// Adjusts the window of a freshly minted compaction page; used by the
    /// allocator to pack a new logical page into a predecessor's trailing
    /// space.
    pub(crate) fn set_window(
        &mut self,
        pm: &mut PageManager,
        page_index: PageIndex,
        offset: u16,
        size: u16,
    ) -> Result<()> {
        self.page_index = page_index;
        self.offset = offset;
        self.size = size;

        let header = pm.page_header_mut(self.header_index)?;
        header.set_page_index(page_index);
        header.set_offset(offset);
        header.set_size(size);
        Ok(())
    }

    /// Materializes all datapoints currently held by the compressor.
    pub fn get_all_data_points(&self, pm: &PageManager, out: &mut Vec<DataPoint>) -> Result<()> {
        let Some(compressor) = self.compressor.as_ref() else {
            return Ok(());
        };
        let window = pm.window(self.page_index, self.offset, self.size as usize)?;
        compressor.uncompress(window, out)
    }

    pub fn is_full(&self) -> bool {
        match &self.compressor {
            Some(c) => c.is_full() || self.full,
            None => self.full,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.compressor {
            Some(c) => c.is_empty(),
            None => self.time_range.is_empty(),
        }
    }

    pub fn dp_count(&self) -> usize {
        self.compressor.as_ref().map(|c| c.dp_count()).unwrap_or(0)
    }

    pub fn last_tstamp(&self) -> Option<Timestamp> {
        self.compressor.as_ref().and_then(|c| c.last_tstamp())
    }

    #[inline]
    pub fn header_index(&self) -> HeaderIndex {
        self.header_index
    }

    #[inline]
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    #[inline]
    pub fn offset(&self) -> u16 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.size
    }

    #[inline]
    pub fn is_out_of_order(&self) -> bool {
        self.out_of_order
    }

    #[inline]
    pub fn time_range(&self) -> &TimeRange {
        &self.time_range
    }

    pub fn has_compressor(&self) -> bool {
        self.compressor.is_some()
    }
}
