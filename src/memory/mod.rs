//! # Typed Recyclable-Object Pool
//!
//! Every datapoint that enters the engine needs a `PageInfo` and, sooner or
//! later, a `Compressor`. Allocating those from the system allocator on the
//! ingest hot path is an anti-pattern; instead they are recycled through a
//! process-wide typed pool and reused.
//!
//! ## Design
//!
//! One free-list per [`RecyclableKind`], each sharded across a small fixed
//! number of mutexes to keep responder threads from contending on a single
//! lock. `acquire` pops from a round-robin shard (allocating fresh when the
//! shard is empty — pool exhaustion is not an error) and hands back a fully
//! reset object; `release` pushes the object onto a shard for reuse.
//!
//! Compressors recycle through the [`Compressor`] enum itself: releasing a
//! `V0` returns its box to the version-0 list, a `V1` to the version-1 list,
//! so a page that switches codec versions never poisons the wrong list.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::compress::{Compressor, GorillaCodec, RawCodec};
use crate::storage::PageInfo;
use crate::types::Timestamp;

/// Object classes the pool recycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecyclableKind {
    PageInfo,
    CompressorV0,
    CompressorV1,
}

const POOL_SHARD_COUNT: usize = 8;

/// Sharded free-list for one object kind.
struct FreeList<T> {
    shards: [Mutex<Vec<Box<T>>>; POOL_SHARD_COUNT],
    next_shard: AtomicUsize,
}

impl<T: Default> FreeList<T> {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(Vec::new())),
            next_shard: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> Box<T> {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % POOL_SHARD_COUNT;
        let recycled = self.shards[shard].lock().pop();
        recycled.unwrap_or_default()
    }

    fn release(&self, obj: Box<T>) {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % POOL_SHARD_COUNT;
        self.shards[shard].lock().push(obj);
    }

    fn available(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// Process-wide pool of page infos and compressors.
pub struct MemoryPool {
    page_infos: FreeList<PageInfo>,
    compressors_v0: FreeList<RawCodec>,
    compressors_v1: FreeList<GorillaCodec>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            page_infos: FreeList::new(),
            compressors_v0: FreeList::new(),
            compressors_v1: FreeList::new(),
        }
    }

    /// A reset `PageInfo`, recycled when possible.
    pub fn acquire_page_info(&self) -> Box<PageInfo> {
        let mut info = self.page_infos.acquire();
        info.reset();
        info
    }

    pub fn release_page_info(&self, info: Box<PageInfo>) {
        self.page_infos.release(info);
    }

    /// A compressor of the given version, initialized for `buf_len` bytes
    /// starting at `base_tstamp`.
    pub fn acquire_compressor(
        &self,
        version: u8,
        base_tstamp: Timestamp,
        buf_len: usize,
    ) -> Compressor {
        match version {
            0 => {
                let mut codec = self.compressors_v0.acquire();
                codec.init(base_tstamp, buf_len);
                Compressor::V0(codec)
            }
            _ => {
                let mut codec = self.compressors_v1.acquire();
                codec.init(base_tstamp, buf_len);
                Compressor::V1(codec)
            }
        }
    }

    pub fn release_compressor(&self, compressor: Compressor) {
        match compressor {
            Compressor::V0(codec) => self.compressors_v0.release(codec),
            Compressor::V1(codec) => self.compressors_v1.release(codec),
        }
    }

    /// Free objects currently parked in the pool, per kind.
    pub fn available(&self, kind: RecyclableKind) -> usize {
        match kind {
            RecyclableKind::PageInfo => self.page_infos.available(),
            RecyclableKind::CompressorV0 => self.compressors_v0.available(),
            RecyclableKind::CompressorV1 => self.compressors_v1.available(),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}
