//! # PageManager — one data file, one mapping
//!
//! A `PageManager` owns the mmap of a single data file: the file header,
//! the page-info table, and the page region. It allocates logical pages,
//! recovers from partial writes at open, and drives flush/persist,
//! compaction allocation, and shrink-to-fit.
//!
//! ## Open Protocol
//!
//! 1. A zero-length file is new: write the file header, zero the page-info
//!    table, and sync that region.
//! 2. An existing file is verified: the major version must match, a minor
//!    mismatch warns, the file's compressor version and resolution are
//!    adopted (a resolution mismatch is fatal), and the real file length is
//!    recomputed from `actual_pg_cnt`.
//! 3. The mapping is opened read-write shared with `MADV_RANDOM`.
//! 4. Recovery: an abnormal shutdown can persist the bump pointers before
//!    the header they reserved. Trailing uninitialized headers are walked
//!    back so the next allocation reuses their slots.
//!
//! ## Concurrency
//!
//! Allocation mutates the header counters, so `get_free_page*` takes
//! `&mut self` — the engine serializes writers per file exactly the way a
//! file-scoped mutex would, but the exclusion is proven at compile time.
//! Read-views of sealed pages only need `&self`.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::compress::MAX_COMPRESSOR_VERSION;
use crate::config::{
    Snapshot, CFG_TSDB_COMPRESSOR_VERSION, CFG_TSDB_COMPRESSOR_VERSION_DEF, CFG_TSDB_PAGE_COUNT,
    CFG_TSDB_PAGE_COUNT_DEF, CFG_TSDB_PAGE_SIZE, CFG_TSDB_PAGE_SIZE_DEF,
    CFG_TSDB_TIMESTAMP_RESOLUTION_MS, CFG_TSDB_TIMESTAMP_RESOLUTION_MS_DEF,
};
use crate::error::StorageError;
use crate::memory::MemoryPool;
use crate::storage::headers::{
    PageHeader, TsdbHeader, PAGE_HEADER_SIZE, TSDB_HEADER_SIZE, TSDB_MAJOR_VERSION,
    TSDB_MINOR_VERSION,
};
use crate::storage::mmap::MmapFile;
use crate::storage::page::PageInfo;
use crate::types::{HeaderIndex, PageIndex, TimeRange};

/// Minimum trailing bytes worth packing another logical page into during
/// compaction: one version-1 datapoint (32 delta bits + 64 value bits).
const COMPACTION_MIN_TRAILING: u16 = 12;

/// Knobs fixed per file at creation time.
#[derive(Debug, Clone, Copy)]
pub struct PageManagerOptions {
    pub page_count: u32,
    pub page_size: u32,
    pub compressor_version: u8,
    pub millisecond: bool,
}

impl Default for PageManagerOptions {
    fn default() -> Self {
        Self {
            page_count: CFG_TSDB_PAGE_COUNT_DEF,
            page_size: CFG_TSDB_PAGE_SIZE_DEF as u32,
            compressor_version: CFG_TSDB_COMPRESSOR_VERSION_DEF as u8,
            millisecond: CFG_TSDB_TIMESTAMP_RESOLUTION_MS_DEF,
        }
    }
}

impl PageManagerOptions {
    pub fn from_config(snapshot: &Snapshot) -> Self {
        Self {
            page_count: snapshot.get_int(CFG_TSDB_PAGE_COUNT, CFG_TSDB_PAGE_COUNT_DEF as i64)
                as u32,
            page_size: snapshot.get_bytes(CFG_TSDB_PAGE_SIZE, CFG_TSDB_PAGE_SIZE_DEF) as u32,
            compressor_version: snapshot
                .get_int(CFG_TSDB_COMPRESSOR_VERSION, CFG_TSDB_COMPRESSOR_VERSION_DEF)
                .clamp(0, MAX_COMPRESSOR_VERSION as i64) as u8,
            millisecond: snapshot.get_bool(
                CFG_TSDB_TIMESTAMP_RESOLUTION_MS,
                CFG_TSDB_TIMESTAMP_RESOLUTION_MS_DEF,
            ),
        }
    }
}

/// Page allocator and mapping owner for one data file.
#[derive(Debug)]
pub struct PageManager {
    path: PathBuf,
    id: u32,
    time_range: TimeRange,
    page_size: u32,
    compressor_version: u8,
    millisecond: bool,
    compacted: bool,
    total_size: u64,
    mmap: MmapFile,
}

impl PageManager {
    pub fn open(
        path: &Path,
        range: TimeRange,
        id: u32,
        options: &PageManagerOptions,
    ) -> Result<Self> {
        ensure!(options.page_count > 0, "page count must be non-zero");
        ensure!(
            options.page_size >= 64 && options.page_size <= u16::MAX as u32,
            "page size {} outside supported range",
            options.page_size
        );

        let default_total = options.page_count as u64 * options.page_size as u64;
        let (mmap, is_new) = MmapFile::open(path, default_total)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let mut pm = Self {
            path: path.to_path_buf(),
            id,
            time_range: range,
            page_size: options.page_size,
            compressor_version: options.compressor_version,
            millisecond: options.millisecond,
            compacted: false,
            total_size: mmap.len(),
            mmap,
        };

        if is_new {
            pm.init_new_file(options)?;
        } else {
            pm.verify_existing_file(options)?;
            pm.recover_trailing_headers()?;
        }

        info!(
            path = %pm.path.display(),
            id,
            page_count = pm.page_count(),
            page_index = pm.page_index(),
            header_index = pm.header_index(),
            compacted = pm.compacted,
            "opened data file"
        );
        Ok(pm)
    }

    fn init_new_file(&mut self, options: &PageManagerOptions) -> Result<()> {
        let first_page = first_page_index(options.page_count, self.page_size);
        ensure!(
            first_page < options.page_count,
            "page size {} cannot hold the header table for {} pages",
            self.page_size,
            options.page_count
        );

        let range = self.time_range;
        let header = self.tsdb_header_mut()?;
        header.init(&range, options.page_count, first_page);
        header.set_compressor_version(options.compressor_version);
        header.set_millisecond(options.millisecond);

        // zero the page-info table so recovery can tell reserved slots
        // from written ones
        let table_len = options.page_count as usize * PAGE_HEADER_SIZE;
        self.mmap
            .window_mut(TSDB_HEADER_SIZE, table_len)?
            .fill(0);
        self.mmap
            .flush_prefix((TSDB_HEADER_SIZE + table_len) as u64, true)?;
        Ok(())
    }

    fn verify_existing_file(&mut self, options: &PageManagerOptions) -> Result<()> {
        ensure!(
            self.total_size >= TSDB_HEADER_SIZE as u64,
            StorageError::Corrupt
        );
        let header = self.tsdb_header()?;
        let (major, minor) = (header.major_version(), header.minor_version());
        let millisecond = header.is_millisecond();
        let file_version = header.compressor_version();
        let compacted = header.is_compacted();
        let range = TimeRange::new(header.start_tstamp() as u64, header.end_tstamp() as u64);
        let (actual, page_index) = (header.actual_pg_cnt(), header.page_index());
        let (header_index, page_count) = (header.header_index(), header.page_count());

        if major != TSDB_MAJOR_VERSION {
            bail!(StorageError::VersionMismatch {
                file: major,
                ours: TSDB_MAJOR_VERSION,
            });
        }
        if minor != TSDB_MINOR_VERSION {
            warn!(file = minor, ours = TSDB_MINOR_VERSION, "minor version mismatch");
        }
        if millisecond != options.millisecond {
            bail!(StorageError::ResolutionMismatch);
        }
        if file_version != options.compressor_version {
            warn!(
                file = file_version,
                ours = options.compressor_version,
                "adopting the file's compressor version"
            );
        }
        ensure!(
            actual > 0 && page_index <= actual && header_index <= page_count,
            StorageError::Corrupt
        );

        self.compressor_version = file_version;
        self.compacted = compacted;
        self.time_range = range;

        let total = actual as u64 * self.page_size as u64;
        if total != self.total_size {
            self.mmap.resize(total)?;
            self.total_size = total;
        }
        Ok(())
    }

    /// Walks trailing header slots backwards, discarding any that were
    /// reserved (bump pointers persisted) but never written.
    fn recover_trailing_headers(&mut self) -> Result<()> {
        let header_index = self.header_index();
        let first_page = self.first_page_index();

        let mut live = header_index;
        while live > 0 && !self.page_header(live - 1)?.is_initialized() {
            live -= 1;
        }
        if live == header_index {
            return Ok(());
        }

        let rolled_page_index = if live == 0 {
            first_page
        } else {
            self.page_header(live - 1)?.page_index() + 1
        };
        warn!(
            discarded = header_index - live,
            page_index = rolled_page_index,
            "trailing pages were never initialized; discarding"
        );

        let header = self.tsdb_header_mut()?;
        header.set_header_index(live);
        header.set_page_index(rolled_page_index);
        Ok(())
    }

    // ---------------- header and window access ----------------

    pub fn tsdb_header(&self) -> Result<&TsdbHeader> {
        let bytes = self.mmap.window(0, TSDB_HEADER_SIZE)?;
        TsdbHeader::ref_from_bytes(bytes).map_err(|e| eyre::eyre!("bad file header: {:?}", e))
    }

    fn tsdb_header_mut(&mut self) -> Result<&mut TsdbHeader> {
        let bytes = self.mmap.window_mut(0, TSDB_HEADER_SIZE)?;
        TsdbHeader::mut_from_bytes(bytes).map_err(|e| eyre::eyre!("bad file header: {:?}", e))
    }

    pub fn page_header(&self, index: HeaderIndex) -> Result<&PageHeader> {
        ensure!(
            index < self.page_count(),
            "header index {} out of bounds ({})",
            index,
            self.page_count()
        );
        let offset = TSDB_HEADER_SIZE + index as usize * PAGE_HEADER_SIZE;
        let bytes = self.mmap.window(offset, PAGE_HEADER_SIZE)?;
        PageHeader::ref_from_bytes(bytes).map_err(|e| eyre::eyre!("bad page header: {:?}", e))
    }

    pub fn page_header_mut(&mut self, index: HeaderIndex) -> Result<&mut PageHeader> {
        ensure!(
            index < self.page_count(),
            "header index {} out of bounds ({})",
            index,
            self.page_count()
        );
        let offset = TSDB_HEADER_SIZE + index as usize * PAGE_HEADER_SIZE;
        let bytes = self.mmap.window_mut(offset, PAGE_HEADER_SIZE)?;
        PageHeader::mut_from_bytes(bytes).map_err(|e| eyre::eyre!("bad page header: {:?}", e))
    }

    /// Byte window inside a physical page.
    pub fn window(&self, page_index: PageIndex, offset: u16, len: usize) -> Result<&[u8]> {
        ensure!(
            offset as usize + len <= self.page_size as usize,
            "window {}+{} exceeds page size {}",
            offset,
            len,
            self.page_size
        );
        let file_offset = page_index as usize * self.page_size as usize + offset as usize;
        self.mmap.window(file_offset, len)
    }

    pub fn window_mut(&mut self, page_index: PageIndex, offset: u16, len: usize) -> Result<&mut [u8]> {
        ensure!(
            offset as usize + len <= self.page_size as usize,
            "window {}+{} exceeds page size {}",
            offset,
            len,
            self.page_size
        );
        let file_offset = page_index as usize * self.page_size as usize + offset as usize;
        self.mmap.window_mut(file_offset, len)
    }

    // ---------------- allocation ----------------

    /// Reserves the next free logical page and installs a compressor
    /// (version 0 for out-of-order pages). Fails with `OutOfPages` when the
    /// file is exhausted or already compacted.
    pub fn get_free_page_on_disk(
        &mut self,
        pool: &MemoryPool,
        out_of_order: bool,
    ) -> Result<Box<PageInfo>> {
        if self.compacted {
            bail!(StorageError::OutOfPages);
        }
        let (page_index, header_index) = self.reserve_slot()?;

        let mut info = pool.acquire_page_info();
        info.init_for_disk(self, header_index, page_index, self.page_size as u16, out_of_order)?;
        info.setup_compressor(self, pool, self.compressor_version);
        Ok(info)
    }

    /// Compaction allocation: like `get_free_page_on_disk`, but when the
    /// previous logical page leaves enough trailing space in its physical
    /// page, the new page packs into that space instead of opening a fresh
    /// physical page.
    pub fn get_free_page_for_compaction(&mut self, pool: &MemoryPool) -> Result<Box<PageInfo>> {
        if self.compacted {
            bail!(StorageError::OutOfPages);
        }
        let (page_index, header_index) = self.reserve_slot()?;

        let mut info = pool.acquire_page_info();
        info.init_for_disk(self, header_index, page_index, self.page_size as u16, false)?;

        if header_index > 0 {
            let prev = self.page_header(header_index - 1)?;
            let prev_page = prev.page_index();
            let trailing_at = prev.offset() + prev.size();
            let trailing = self.page_size as u16 - trailing_at;

            // one datapoint must fit, whatever the codec
            let min_trailing = if self.compressor_version == 0 {
                crate::compress::DP_RECORD_SIZE as u16
            } else {
                COMPACTION_MIN_TRAILING
            };

            if trailing >= min_trailing {
                info.set_window(self, prev_page, trailing_at, trailing)?;
            } else {
                info.set_window(self, prev_page + 1, 0, self.page_size as u16)?;
            }
        }

        info.setup_compressor(self, pool, self.compressor_version);
        Ok(info)
    }

    fn reserve_slot(&mut self) -> Result<(PageIndex, HeaderIndex)> {
        let header = self.tsdb_header()?;
        let page_index = header.page_index();
        let header_index = header.header_index();
        if page_index >= header.actual_pg_cnt() || header_index >= header.page_count() {
            debug!(path = %self.path.display(), "data file out of pages");
            bail!(StorageError::OutOfPages);
        }

        let header = self.tsdb_header_mut()?;
        header.set_page_index(page_index + 1);
        header.set_header_index(header_index + 1);
        Ok((page_index, header_index))
    }

    /// Read-view over an already-allocated logical page; `None` when the
    /// index is past the allocated range.
    pub fn get_the_page_on_disk(
        &self,
        pool: &MemoryPool,
        header_index: HeaderIndex,
    ) -> Result<Option<Box<PageInfo>>> {
        if header_index >= self.header_index() {
            return Ok(None);
        }
        let mut info = pool.acquire_page_info();
        info.init_from_disk(self, header_index)?;
        Ok(Some(info))
    }

    // ---------------- durability ----------------

    /// Flushes the used prefix of the file and drops the whole mapping from
    /// the resident set.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        let used = (self.page_index() as u64 * self.page_size as u64).min(self.total_size);
        self.mmap.flush_prefix(used, sync)?;
        self.mmap.advise_dont_need(0, self.total_size as usize);
        Ok(())
    }

    /// Synchronous flush of the used prefix.
    pub fn persist(&mut self) -> Result<()> {
        let used = (self.page_index() as u64 * self.page_size as u64).min(self.total_size);
        self.mmap.flush_prefix(used, true)
    }

    /// Truncates the file to the last used physical page and marks it
    /// compacted. No further allocations are permitted afterwards.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let header_index = self.header_index();
        let last_used = if header_index == 0 {
            self.first_page_index()
        } else {
            self.page_header(header_index - 1)?.page_index() + 1
        };

        let old_total = self.total_size;
        let total = last_used as u64 * self.page_size as u64;

        let header = self.tsdb_header_mut()?;
        header.set_actual_pg_cnt(last_used);
        // the bump pointer can sit past the new end (packed allocations
        // reserve a physical page they never use); clamp it back inside
        if header.page_index() > last_used {
            header.set_page_index(last_used);
        }
        header.set_compacted(true);
        self.compacted = true;

        debug!(
            path = %self.path.display(),
            old_total,
            total,
            "shrink to fit"
        );
        self.mmap.resize(total)?;
        self.total_size = total;
        Ok(())
    }

    pub fn advise_dont_need_page(&self, page_index: PageIndex) {
        self.mmap.advise_dont_need(
            page_index as usize * self.page_size as usize,
            self.page_size as usize,
        );
    }

    // ---------------- accessors ----------------

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn time_range(&self) -> &TimeRange {
        &self.time_range
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[inline]
    pub fn compressor_version(&self) -> u8 {
        self.compressor_version
    }

    /// Effective codec version for a page: out-of-order pages are always
    /// version 0.
    #[inline]
    pub fn compressor_version_for(&self, out_of_order: bool) -> u8 {
        if out_of_order {
            0
        } else {
            self.compressor_version
        }
    }

    #[inline]
    pub fn is_millisecond(&self) -> bool {
        self.millisecond
    }

    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.compacted
    }

    pub fn page_count(&self) -> u32 {
        self.tsdb_header().map(|h| h.page_count()).unwrap_or(0)
    }

    pub fn page_index(&self) -> PageIndex {
        self.tsdb_header().map(|h| h.page_index()).unwrap_or(0)
    }

    pub fn header_index(&self) -> HeaderIndex {
        self.tsdb_header().map(|h| h.header_index()).unwrap_or(0)
    }

    pub fn actual_pg_cnt(&self) -> u32 {
        self.tsdb_header().map(|h| h.actual_pg_cnt()).unwrap_or(0)
    }

    pub fn first_page_index(&self) -> PageIndex {
        first_page_index(self.page_count(), self.page_size)
    }

    /// Physical pages handed out, as a percentage of the file's capacity.
    pub fn page_percent_used(&self) -> f64 {
        let actual = self.actual_pg_cnt();
        if actual == 0 {
            return 0.0;
        }
        (self.page_index() as f64 / actual as f64) * 100.0
    }
}

/// First physical page index usable for data: the header plus page-info
/// table rounded up to whole pages.
pub fn first_page_index(page_count: u32, page_size: u32) -> PageIndex {
    let meta = TSDB_HEADER_SIZE + page_count as usize * PAGE_HEADER_SIZE;
    meta.div_ceil(page_size as usize) as PageIndex
}
