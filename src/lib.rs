//! # pulsedb — Memory-Mapped Time-Series Storage Engine
//!
//! pulsedb stores `(timestamp, f64)` series in per-time-range data files of
//! fixed-size pages, memory-mapped and append-only, with streaming
//! fixed-interval rollups computed on the way in. This crate is the storage
//! engine; the network listeners and the series catalog live above it and
//! talk to the [`engine::Engine`] façade.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pulsedb::engine::{Engine, EngineOptions};
//! use pulsedb::types::TimeRange;
//!
//! let engine = Engine::open(EngineOptions {
//!     data_dir: "./data".into(),
//!     ..Default::default()
//! })?;
//!
//! engine.ingest(series_id, 1_700_000_000, 42.5)?;
//! let points = engine.query(&[series_id], TimeRange::new(t0, t1), None)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Engine façade                  │
//! │   ingest / query / flush / shutdown       │
//! ├──────────────┬───────────────────────────┤
//! │ RollupAggr.  │  per-series write state    │
//! ├──────────────┴───────────────────────────┤
//! │ PageManager (one per data file)           │
//! │   allocation · recovery · compaction      │
//! ├──────────────────────────────────────────┤
//! │ PageInfo + versioned Compressors          │
//! ├──────────────────────────────────────────┤
//! │ mmap'd files · typed object pool          │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Format
//!
//! One file per (time range, file id): a 36-byte header, a table of
//! 20-byte per-page records, then the fixed-size pages. Datapoints are
//! packed by a versioned codec — raw records (version 0, reorderable) or
//! bit-packed Gorilla-style delta-of-delta/XOR (version 1, in place).
//! See [`storage::TsdbHeader`] and [`storage::PageHeader`] for the
//! byte-exact contract.
//!
//! ## Module Overview
//!
//! - [`engine`]: the façade binding time ranges to page managers
//! - [`storage`]: mmap lifecycle, page allocation, recovery, compaction
//! - [`compress`]: versioned datapoint codecs
//! - [`rollup`]: streaming per-series aggregates and their store
//! - [`memory`]: typed recyclable-object pool
//! - [`config`]: process-wide key/value configuration with hot reload
//! - [`types`]: timestamps, ranges, datapoints, identifiers

#[macro_use]
mod macros;

pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod rollup;
pub mod stoppable;
pub mod storage;
pub mod types;

pub use engine::{Engine, EngineOptions, IngestCounts};
pub use error::StorageError;
pub use stoppable::{ShutdownRequest, Stoppable};
pub use types::{DataPoint, MetricId, TimeRange, TimeSeriesId, Timestamp};
