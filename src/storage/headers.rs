//! # On-Disk Header Definitions
//!
//! Type-safe, zerocopy-based structs for the two durable records in a data
//! file: the file-level [`TsdbHeader`] and the per-logical-page
//! [`PageHeader`]. Both are little-endian and their field widths are the
//! on-disk contract — implementations must match byte for byte.
//!
//! ## File Layout
//!
//! ```text
//! offset 0   : TsdbHeader (36 bytes)
//! offset 36  : PageHeader[page_count] (20 bytes each)
//! offset P   : pages, PAGE_SIZE each,
//!              P = ceil((36 + page_count * 20) / PAGE_SIZE) * PAGE_SIZE
//! ```
//!
//! The header and page-info table live inside the first few physical pages
//! of the file; `first_page_index` (computed by the page manager) is the
//! first page usable for data.
//!
//! ## Flags
//!
//! File flags: bit 0 `compacted`, bit 1 `millisecond`, bits 4..7 the
//! compressor version. Page flags: bit 0 `full`, bit 1 `out_of_order`.
//!
//! ## Zerocopy Safety
//!
//! All structs derive `FromBytes`/`IntoBytes`/`Immutable`/`KnownLayout`/
//! `Unaligned`, so references can be taken directly into the mapped file
//! without copying, at any alignment. Compile-time assertions pin the
//! struct sizes to the contract.

use zerocopy::little_endian::{I64, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::types::{TimeRange, Timestamp};
use crate::zerocopy_accessors;

/// Bumped on incompatible format changes; mismatch aborts open.
pub const TSDB_MAJOR_VERSION: u8 = 1;
/// Bumped on compatible changes; mismatch only warns.
pub const TSDB_MINOR_VERSION: u8 = 2;

pub const TSDB_HEADER_SIZE: usize = 36;
pub const PAGE_HEADER_SIZE: usize = 20;

const FLAG_COMPACTED: u8 = 0x01;
const FLAG_MILLISECOND: u8 = 0x02;
const FLAG_COMPRESSOR_SHIFT: u8 = 4;
const FLAG_COMPRESSOR_MASK: u8 = 0xF0;

const PAGE_FLAG_FULL: u8 = 0x01;
const PAGE_FLAG_OUT_OF_ORDER: u8 = 0x02;

/// First bytes of every data file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TsdbHeader {
    major_version: u8,
    minor_version: u8,
    flags: u8,
    reserved: u8,
    page_count: U32,
    page_index: U32,
    header_index: U32,
    actual_pg_cnt: U32,
    start_tstamp: I64,
    end_tstamp: I64,
}

const _: () = assert!(std::mem::size_of::<TsdbHeader>() == TSDB_HEADER_SIZE);

impl TsdbHeader {
    zerocopy_accessors! {
        page_count: u32,
        page_index: u32,
        header_index: u32,
        actual_pg_cnt: u32,
        start_tstamp: i64,
        end_tstamp: i64,
    }

    pub fn init(&mut self, range: &TimeRange, page_count: u32, first_page_index: u32) {
        self.major_version = TSDB_MAJOR_VERSION;
        self.minor_version = TSDB_MINOR_VERSION;
        self.flags = 0;
        self.reserved = 0;
        self.set_page_count(page_count);
        self.set_page_index(first_page_index);
        self.set_header_index(0);
        self.set_actual_pg_cnt(page_count);
        self.set_start_tstamp(range.from() as i64);
        self.set_end_tstamp(range.to() as i64);
    }

    #[inline]
    pub fn major_version(&self) -> u8 {
        self.major_version
    }

    #[inline]
    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.flags & FLAG_COMPACTED != 0
    }

    pub fn set_compacted(&mut self, compacted: bool) {
        if compacted {
            self.flags |= FLAG_COMPACTED;
        } else {
            self.flags &= !FLAG_COMPACTED;
        }
    }

    #[inline]
    pub fn is_millisecond(&self) -> bool {
        self.flags & FLAG_MILLISECOND != 0
    }

    pub fn set_millisecond(&mut self, millisecond: bool) {
        if millisecond {
            self.flags |= FLAG_MILLISECOND;
        } else {
            self.flags &= !FLAG_MILLISECOND;
        }
    }

    #[inline]
    pub fn compressor_version(&self) -> u8 {
        (self.flags & FLAG_COMPRESSOR_MASK) >> FLAG_COMPRESSOR_SHIFT
    }

    pub fn set_compressor_version(&mut self, version: u8) {
        self.flags = (self.flags & !FLAG_COMPRESSOR_MASK)
            | ((version << FLAG_COMPRESSOR_SHIFT) & FLAG_COMPRESSOR_MASK);
    }
}

/// One durable record per logical page.
///
/// `offset`/`size` describe the byte window inside the physical page
/// `page_index`; after compaction several logical pages can share one
/// physical page. `tstamp_from`/`tstamp_to` are deltas from the file's
/// `start_tstamp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_index: U32,
    offset: U16,
    size: U16,
    cursor: U16,
    start: u8,
    flags: u8,
    tstamp_from: U32,
    tstamp_to: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    zerocopy_accessors! {
        page_index: u32,
        offset: u16,
        size: u16,
        cursor: u16,
        tstamp_from: u32,
        tstamp_to: u32,
    }

    /// Mints this slot for a fresh page.
    pub fn init(&mut self, page_index: u32, size: u16, out_of_order: bool) {
        self.set_page_index(page_index);
        self.set_offset(0);
        self.set_size(size);
        self.set_cursor(0);
        self.start = 0;
        self.flags = 0;
        self.set_out_of_order(out_of_order);
        self.set_tstamp_from(0);
        self.set_tstamp_to(0);
    }

    #[inline]
    pub fn start(&self) -> u8 {
        self.start
    }

    #[inline]
    pub fn set_start(&mut self, start: u8) {
        self.start = start;
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.flags & PAGE_FLAG_FULL != 0
    }

    pub fn set_full(&mut self, full: bool) {
        if full {
            self.flags |= PAGE_FLAG_FULL;
        } else {
            self.flags &= !PAGE_FLAG_FULL;
        }
    }

    #[inline]
    pub fn is_out_of_order(&self) -> bool {
        self.flags & PAGE_FLAG_OUT_OF_ORDER != 0
    }

    pub fn set_out_of_order(&mut self, ooo: bool) {
        if ooo {
            self.flags |= PAGE_FLAG_OUT_OF_ORDER;
        } else {
            self.flags &= !PAGE_FLAG_OUT_OF_ORDER;
        }
    }

    /// Whether this slot was ever written. Data pages live past the header
    /// region, so a genuine `page_index` is never zero; the recovery walk
    /// uses this to spot headers whose reservation out-ran the write.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.page_index.get() != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursor.get() == 0
    }

    /// Absolute page span given the file's start timestamp.
    pub fn time_range(&self, start_tstamp: Timestamp) -> TimeRange {
        TimeRange::new(
            start_tstamp + self.tstamp_from() as Timestamp,
            start_tstamp + self.tstamp_to() as Timestamp,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn tsdb_header_size_is_36() {
        assert_eq!(std::mem::size_of::<TsdbHeader>(), 36);
    }

    #[test]
    fn page_header_size_is_20() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 20);
    }

    #[test]
    fn tsdb_header_roundtrip() {
        let mut header = TsdbHeader::read_from_bytes(&[0u8; TSDB_HEADER_SIZE]).unwrap();
        header.init(&TimeRange::new(1000, 2000), 4096, 3);
        header.set_compressor_version(2);
        header.set_millisecond(true);

        let bytes = header.as_bytes().to_vec();
        let parsed = TsdbHeader::ref_from_bytes(&bytes[..]).unwrap();

        assert_eq!(parsed.major_version(), TSDB_MAJOR_VERSION);
        assert_eq!(parsed.page_count(), 4096);
        assert_eq!(parsed.page_index(), 3);
        assert_eq!(parsed.header_index(), 0);
        assert_eq!(parsed.actual_pg_cnt(), 4096);
        assert_eq!(parsed.start_tstamp(), 1000);
        assert_eq!(parsed.end_tstamp(), 2000);
        assert_eq!(parsed.compressor_version(), 2);
        assert!(parsed.is_millisecond());
        assert!(!parsed.is_compacted());
    }

    #[test]
    fn compressor_version_does_not_clobber_low_flags() {
        let mut header = TsdbHeader::read_from_bytes(&[0u8; TSDB_HEADER_SIZE]).unwrap();
        header.set_compacted(true);
        header.set_compressor_version(3);
        assert!(header.is_compacted());
        assert_eq!(header.compressor_version(), 3);

        header.set_compressor_version(1);
        assert!(header.is_compacted());
        assert_eq!(header.compressor_version(), 1);
    }

    #[test]
    fn page_header_flags() {
        let mut header = PageHeader::read_from_bytes(&[0u8; PAGE_HEADER_SIZE]).unwrap();
        header.init(7, 4096, true);

        assert!(header.is_out_of_order());
        assert!(!header.is_full());
        assert!(header.is_initialized());
        assert!(header.is_empty());

        header.set_full(true);
        header.set_cursor(100);
        assert!(header.is_full());
        assert!(header.is_out_of_order());
        assert!(!header.is_empty());
    }

    #[test]
    fn page_time_range_is_relative_to_file_start() {
        let mut header = PageHeader::read_from_bytes(&[0u8; PAGE_HEADER_SIZE]).unwrap();
        header.init(1, 4096, false);
        header.set_tstamp_from(10);
        header.set_tstamp_to(90);

        let range = header.time_range(1000);
        assert_eq!(range.from(), 1010);
        assert_eq!(range.to(), 1090);
    }
}
