//! # Versioned Datapoint Codecs
//!
//! A page of datapoints is compressed by one of the codecs in this module.
//! The codec version is chosen per file at creation time and recorded in the
//! file header; out-of-order pages always use version 0 regardless of the
//! file's default, because only version 0 can accept appends in arbitrary
//! timestamp order.
//!
//! ## Versions
//!
//! - **Version 0** ([`RawCodec`]): keeps an external working set of raw
//!   datapoints and only touches the mapped page on [`Compressor::save_buffer`].
//!   16 bytes per datapoint, any insertion order.
//! - **Version 1** ([`GorillaCodec`]): bit-packed delta-of-delta timestamps
//!   and XOR-prefix values written directly into the mapped page window.
//!   Timestamps must be non-decreasing.
//!
//! ## Buffer Model
//!
//! Codecs never store a pointer to the page they compress into. The caller
//! resolves the page window from the mapping and passes it to each operation
//! as a slice; codec state (byte cursor plus bit-within-byte) is relative to
//! the window start. Relocating a page during compaction therefore needs no
//! codec fix-up — the caller copies the bytes and re-derives the window.
//!
//! ## Resumability
//!
//! [`Compressor::save_position`] captures the durable `(cursor, start)`
//! pair stored in the page header. A later [`Compressor::restore`] replays
//! the window up to that position, rebuilding the codec state so that
//! subsequent appends continue exactly as if the codec had never been
//! dropped.

mod gorilla;
mod v0;

pub use gorilla::GorillaCodec;
pub use v0::{RawCodec, DP_RECORD_SIZE};

use eyre::Result;

use crate::types::{DataPoint, Timestamp};

/// Highest codec version this build writes.
pub const MAX_COMPRESSOR_VERSION: u8 = 1;

/// Durable codec cursor: byte offset plus starting bit within that byte.
/// For version 0 `offset` counts datapoints and `start` is always zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressorPosition {
    pub offset: u16,
    pub start: u8,
}

/// Tagged dispatch over the codec versions.
///
/// Variants are boxed so the enum stays pool-friendly: the memory pool
/// recycles the boxes, and moving a `Compressor` never copies codec state.
#[derive(Debug)]
pub enum Compressor {
    V0(Box<RawCodec>),
    V1(Box<GorillaCodec>),
}

impl Compressor {
    /// A fresh codec of the given version, bound to `buf_len` bytes starting
    /// at `base_tstamp`. Unknown versions fall back to the newest codec.
    pub fn new(version: u8, base_tstamp: Timestamp, buf_len: usize) -> Self {
        match version {
            0 => {
                let mut c = Box::new(RawCodec::default());
                c.init(base_tstamp, buf_len);
                Compressor::V0(c)
            }
            _ => {
                let mut c = Box::new(GorillaCodec::default());
                c.init(base_tstamp, buf_len);
                Compressor::V1(c)
            }
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Compressor::V0(_) => 0,
            Compressor::V1(_) => 1,
        }
    }

    /// Rebinds the codec to a new logical window, discarding all state.
    pub fn init(&mut self, base_tstamp: Timestamp, buf_len: usize) {
        match self {
            Compressor::V0(c) => c.init(base_tstamp, buf_len),
            Compressor::V1(c) => c.init(base_tstamp, buf_len),
        }
    }

    /// Appends one datapoint. `Ok(false)` means the window is full; an
    /// `OutOfOrder` error means a version ≥ 1 codec rejected a timestamp
    /// older than the last accepted one.
    pub fn compress(&mut self, page: &mut [u8], tstamp: Timestamp, value: f64) -> Result<bool> {
        match self {
            Compressor::V0(c) => Ok(c.compress(tstamp, value)),
            Compressor::V1(c) => c.compress(page, tstamp, value),
        }
    }

    /// Materializes every contained datapoint into `out`.
    pub fn uncompress(&self, page: &[u8], out: &mut Vec<DataPoint>) -> Result<()> {
        match self {
            Compressor::V0(c) => {
                c.uncompress(out);
                Ok(())
            }
            Compressor::V1(c) => c.uncompress(page, out),
        }
    }

    /// Rebuilds codec state from a persisted window, replaying it up to
    /// `position`. Decoded datapoints are appended to `out` when provided.
    pub fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: Option<&mut Vec<DataPoint>>,
    ) -> Result<()> {
        match self {
            Compressor::V0(c) => c.restore(page, position, out),
            Compressor::V1(c) => c.restore(page, position, out),
        }
    }

    /// Durable cursor for the page header.
    pub fn save_position(&self) -> CompressorPosition {
        match self {
            Compressor::V0(c) => c.save_position(),
            Compressor::V1(c) => c.save_position(),
        }
    }

    /// Copies the working buffer into the mapped window. Version 1 writes in
    /// place, so this is a no-op for it.
    pub fn save_buffer(&self, page: &mut [u8]) {
        if let Compressor::V0(c) = self {
            c.save_buffer(page);
        }
    }

    /// Bytes of the window currently holding data.
    pub fn size(&self) -> usize {
        match self {
            Compressor::V0(c) => c.size(),
            Compressor::V1(c) => c.size(),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            Compressor::V0(c) => c.is_full(),
            Compressor::V1(c) => c.is_full(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dp_count() == 0
    }

    pub fn dp_count(&self) -> usize {
        match self {
            Compressor::V0(c) => c.dp_count(),
            Compressor::V1(c) => c.dp_count(),
        }
    }

    /// Timestamp of the most recently appended datapoint.
    pub fn last_tstamp(&self) -> Option<Timestamp> {
        match self {
            Compressor::V0(c) => c.last_tstamp(),
            Compressor::V1(c) => c.last_tstamp(),
        }
    }
}
