//! # Rollup Store
//!
//! Flushed rollup buckets persist in a per-range, append-only mapped file:
//! a small header followed by fixed-width little-endian entries. Aggregate
//! tuples are already tiny and uniform, so they skip the datapoint
//! compressors entirely.
//!
//! ```text
//! offset 0  : magic (8) | entry_count (u32) | reserved (u32)
//! offset 16 : RollupEntry[entry_count] (48 bytes each)
//! ```
//!
//! The file grows by doubling its entry capacity; `entry_count` in the
//! header is the durable append cursor.

use std::path::Path;

use eyre::{ensure, Result};
use zerocopy::little_endian::{F64, I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::MmapFile;
use crate::types::{MetricId, TimeSeriesId, Timestamp};

const ROLLUP_MAGIC: &[u8; 8] = b"pdbroll\x01";
const ROLLUP_HEADER_SIZE: usize = 16;
const ROLLUP_ENTRY_SIZE: usize = 48;
const INITIAL_CAPACITY: usize = 1024;

/// One flushed bucket: series identity, bucket start (seconds), and the
/// four accumulators.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RollupEntry {
    mid: U32,
    tid: U32,
    tstamp: I64,
    cnt: U32,
    reserved: U32,
    min: F64,
    max: F64,
    sum: F64,
}

const _: () = assert!(std::mem::size_of::<RollupEntry>() == ROLLUP_ENTRY_SIZE);

impl RollupEntry {
    pub fn new(
        mid: MetricId,
        tid: TimeSeriesId,
        tstamp: Timestamp,
        cnt: u32,
        min: f64,
        max: f64,
        sum: f64,
    ) -> Self {
        Self {
            mid: U32::new(mid),
            tid: U32::new(tid),
            tstamp: I64::new(tstamp as i64),
            cnt: U32::new(cnt),
            reserved: U32::new(0),
            min: F64::new(min),
            max: F64::new(max),
            sum: F64::new(sum),
        }
    }

    #[inline]
    pub fn mid(&self) -> MetricId {
        self.mid.get()
    }

    #[inline]
    pub fn tid(&self) -> TimeSeriesId {
        self.tid.get()
    }

    /// Bucket lower bound, in seconds.
    #[inline]
    pub fn tstamp(&self) -> Timestamp {
        self.tstamp.get() as Timestamp
    }

    #[inline]
    pub fn cnt(&self) -> u32 {
        self.cnt.get()
    }

    #[inline]
    pub fn min(&self) -> f64 {
        self.min.get()
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.max.get()
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum.get()
    }
}

/// Append-only mapped file of rollup entries.
#[derive(Debug)]
pub struct RollupFile {
    mmap: MmapFile,
}

impl RollupFile {
    pub fn open(path: &Path) -> Result<Self> {
        let default_len = (ROLLUP_HEADER_SIZE + INITIAL_CAPACITY * ROLLUP_ENTRY_SIZE) as u64;
        let (mut mmap, is_new) = MmapFile::open(path, default_len)?;

        if is_new {
            let header = mmap.window_mut(0, ROLLUP_HEADER_SIZE)?;
            header[..8].copy_from_slice(ROLLUP_MAGIC);
            header[8..].fill(0);
            mmap.flush_prefix(ROLLUP_HEADER_SIZE as u64, true)?;
        } else {
            let header = mmap.window(0, ROLLUP_HEADER_SIZE)?;
            ensure!(
                &header[..8] == ROLLUP_MAGIC,
                "'{}' is not a rollup file",
                path.display()
            );
        }
        Ok(Self { mmap })
    }

    pub fn entry_count(&self) -> u32 {
        self.mmap
            .window(8, 4)
            .map(|b| u32::from_le_bytes(b.try_into().expect("4-byte slice")))
            .unwrap_or(0)
    }

    fn set_entry_count(&mut self, count: u32) -> Result<()> {
        self.mmap
            .window_mut(8, 4)?
            .copy_from_slice(&count.to_le_bytes());
        Ok(())
    }

    fn capacity(&self) -> usize {
        (self.mmap.len() as usize).saturating_sub(ROLLUP_HEADER_SIZE) / ROLLUP_ENTRY_SIZE
    }

    pub fn append(&mut self, entry: &RollupEntry) -> Result<()> {
        let count = self.entry_count() as usize;
        if count >= self.capacity() {
            let new_len =
                (ROLLUP_HEADER_SIZE + self.capacity().max(INITIAL_CAPACITY) * 2 * ROLLUP_ENTRY_SIZE)
                    as u64;
            self.mmap.resize(new_len)?;
        }

        let offset = ROLLUP_HEADER_SIZE + count * ROLLUP_ENTRY_SIZE;
        self.mmap
            .window_mut(offset, ROLLUP_ENTRY_SIZE)?
            .copy_from_slice(entry.as_bytes());
        self.set_entry_count(count as u32 + 1)
    }

    pub fn entry(&self, index: u32) -> Result<RollupEntry> {
        ensure!(
            index < self.entry_count(),
            "rollup entry {} out of bounds ({})",
            index,
            self.entry_count()
        );
        let offset = ROLLUP_HEADER_SIZE + index as usize * ROLLUP_ENTRY_SIZE;
        let bytes = self.mmap.window(offset, ROLLUP_ENTRY_SIZE)?;
        RollupEntry::read_from_bytes(bytes).map_err(|e| eyre::eyre!("bad rollup entry: {:?}", e))
    }

    pub fn flush(&self, sync: bool) -> Result<()> {
        let used = ROLLUP_HEADER_SIZE as u64 + self.entry_count() as u64 * ROLLUP_ENTRY_SIZE as u64;
        self.mmap.flush_prefix(used, sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rollup.0");

        let mut file = RollupFile::open(&path).unwrap();
        file.append(&RollupEntry::new(1, 7, 600, 3, -1.0, 5.0, 6.5))
            .unwrap();
        file.append(&RollupEntry::new(1, 7, 1200, 0, 0.0, 0.0, 0.0))
            .unwrap();
        file.flush(true).unwrap();
        drop(file);

        let file = RollupFile::open(&path).unwrap();
        assert_eq!(file.entry_count(), 2);

        let e = file.entry(0).unwrap();
        assert_eq!((e.mid(), e.tid(), e.tstamp(), e.cnt()), (1, 7, 600, 3));
        assert_eq!((e.min(), e.max(), e.sum()), (-1.0, 5.0, 6.5));

        let empty = file.entry(1).unwrap();
        assert_eq!(empty.cnt(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rollup.0");

        let mut file = RollupFile::open(&path).unwrap();
        for i in 0..(INITIAL_CAPACITY as u32 + 10) {
            file.append(&RollupEntry::new(1, 1, i as Timestamp * 60, 1, 0.0, 0.0, 0.0))
                .unwrap();
        }
        assert_eq!(file.entry_count(), INITIAL_CAPACITY as u32 + 10);
        assert_eq!(file.entry(INITIAL_CAPACITY as u32 + 9).unwrap().tstamp(), (INITIAL_CAPACITY as u64 + 9) * 60);
    }

    #[test]
    fn rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rollup.0");
        std::fs::write(&path, b"definitely not a rollup file").unwrap();

        assert!(RollupFile::open(&path).is_err());
    }
}
