//! # Version 0 Codec
//!
//! The simplest codec: raw little-endian `(timestamp, value)` records,
//! 16 bytes each, buffered in an external working set. Nothing reaches the
//! mapped page until `save_buffer` runs, which is why this codec can accept
//! datapoints in any order — the working set is just re-serialized on the
//! next save.
//!
//! The durable cursor counts datapoints, not bytes; shrink-to-fit multiplies
//! it by the record size when computing the packed window.

use eyre::{ensure, Result};

use crate::compress::CompressorPosition;
use crate::error::StorageError;
use crate::types::{DataPoint, Timestamp};

/// On-disk bytes per datapoint: `u64` timestamp + `f64` value bits.
pub const DP_RECORD_SIZE: usize = 16;

#[derive(Debug, Default)]
pub struct RawCodec {
    capacity: usize,
    points: Vec<DataPoint>,
    full: bool,
}

impl RawCodec {
    pub fn init(&mut self, _base_tstamp: Timestamp, buf_len: usize) {
        self.capacity = buf_len / DP_RECORD_SIZE;
        self.points.clear();
        self.full = false;
    }

    pub fn compress(&mut self, tstamp: Timestamp, value: f64) -> bool {
        if self.points.len() >= self.capacity {
            self.full = true;
            return false;
        }
        self.points.push(DataPoint::new(tstamp, value));
        true
    }

    /// Emits the working set in timestamp order. The sort is stable, so
    /// equal timestamps keep their insertion order.
    pub fn uncompress(&self, out: &mut Vec<DataPoint>) {
        let start = out.len();
        out.extend_from_slice(&self.points);
        out[start..].sort_by_key(|dp| dp.tstamp);
    }

    pub fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: Option<&mut Vec<DataPoint>>,
    ) -> Result<()> {
        let count = position.offset as usize;
        ensure!(
            count * DP_RECORD_SIZE <= page.len(),
            StorageError::Corrupt
        );

        self.points.clear();
        for i in 0..count {
            let rec = &page[i * DP_RECORD_SIZE..(i + 1) * DP_RECORD_SIZE];
            let tstamp = u64::from_le_bytes(rec[..8].try_into().expect("8-byte slice"));
            let value = f64::from_bits(u64::from_le_bytes(rec[8..].try_into().expect("8-byte slice")));
            self.points.push(DataPoint::new(tstamp, value));
        }
        self.full = self.points.len() >= self.capacity;

        if let Some(out) = out {
            self.uncompress(out);
        }
        Ok(())
    }

    pub fn save_position(&self) -> CompressorPosition {
        CompressorPosition {
            offset: self.points.len() as u16,
            start: 0,
        }
    }

    pub fn save_buffer(&self, page: &mut [u8]) {
        for (i, dp) in self.points.iter().enumerate() {
            let rec = &mut page[i * DP_RECORD_SIZE..(i + 1) * DP_RECORD_SIZE];
            rec[..8].copy_from_slice(&dp.tstamp.to_le_bytes());
            rec[8..].copy_from_slice(&dp.value.to_bits().to_le_bytes());
        }
    }

    pub fn size(&self) -> usize {
        self.points.len() * DP_RECORD_SIZE
    }

    pub fn is_full(&self) -> bool {
        self.full || self.points.len() >= self.capacity
    }

    pub fn dp_count(&self) -> usize {
        self.points.len()
    }

    pub fn last_tstamp(&self) -> Option<Timestamp> {
        self.points.last().map(|dp| dp.tstamp)
    }
}
