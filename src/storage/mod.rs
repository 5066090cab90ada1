//! # Storage Module
//!
//! The paged storage engine: memory-mapped, append-only data files hosting
//! fixed-size pages of compressed datapoints.
//!
//! ## Architecture Overview
//!
//! One [`PageManager`] per data file owns the mapping and the on-disk
//! layout:
//!
//! ```text
//! [ TsdbHeader | PageHeader[0..page_count] | padding | page[0..actual_pg_cnt] ]
//! ```
//!
//! Logical pages are handed out bump-pointer style: `header_index` reserves
//! the next header slot, `page_index` the next physical page. A
//! [`PageInfo`] is the in-memory face of one logical page — durable header
//! plus an optional live compressor — and is recycled through the typed
//! memory pool between uses.
//!
//! ## Durability Model
//!
//! Writes land in the shared mapping and reach disk through periodic
//! `msync` (`flush`/`persist`), not per datapoint. Recovery at open rolls
//! back header slots whose reservation was persisted without the header
//! write itself. After a flush, pages are dropped from the resident set
//! with `MADV_DONTNEED` so memory tracks the live write set.
//!
//! ## Compaction
//!
//! [`compact`] rebuilds a file through a temp path, packing partially
//! filled pages into shared physical pages (multiple logical windows per
//! page), shrinks it to fit, and atomically renames it into place.
//!
//! ## Module Organization
//!
//! - `mmap`: mapping lifecycle (`MmapFile`)
//! - `headers`: zerocopy on-disk structs (`TsdbHeader`, `PageHeader`)
//! - `page`: `PageInfo` operations
//! - `page_manager`: allocation, recovery, flush, shrink-to-fit
//! - `compaction`: the offline compaction driver

mod compaction;
mod headers;
mod mmap;
mod page;
mod page_manager;

pub use compaction::compact;
pub use headers::{
    PageHeader, TsdbHeader, PAGE_HEADER_SIZE, TSDB_HEADER_SIZE, TSDB_MAJOR_VERSION,
    TSDB_MINOR_VERSION,
};
pub use mmap::MmapFile;
pub use page::PageInfo;
pub use page_manager::{first_page_index, PageManager, PageManagerOptions};
