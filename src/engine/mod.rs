//! # Engine Façade
//!
//! The `Engine` binds time ranges to page managers and exposes the surface
//! the network layer consumes: `ingest`, `ingest_batch`, `query`, `flush`,
//! and the [`Stoppable`] shutdown contract.
//!
//! ## Ingest Routing
//!
//! A datapoint routes to the data file owning its timestamp (files and
//! their directories are created on first touch). Each series keeps one
//! open in-order page and, when needed, one open out-of-order page:
//!
//! - A timestamp at or past the series' high-water mark appends in order
//!   and feeds the series' rollup aggregator.
//! - An older timestamp goes to the out-of-order page (version-0 codec)
//!   and bypasses rollup.
//! - `OutOfPages` from a file triggers allocation of a sibling data file
//!   in the same range, and the append retries there.
//!
//! ## Concurrency
//!
//! Engine state sits behind one `parking_lot::RwLock`: writers (ingest,
//! flush, compaction) serialize per the single-writer-per-page rule, while
//! queries — which only rehydrate read-views — share the read side. The
//! shutdown flag is an atomic checked before any write.
//!
//! ## Series Index
//!
//! The map from series to its logical pages is in-memory engine state; the
//! durable series catalog belongs to the layer above. Compaction rewrites
//! header indexes, so [`Engine::compact_range`] patches this index with the
//! remap table the compactor returns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{info, warn};

use crate::config::{
    Snapshot, CFG_TSDB_DATA_DIR, CFG_TSDB_DATA_DIR_DEF, CFG_TSDB_ROLLUP_INTERVAL,
    CFG_TSDB_ROLLUP_INTERVAL_DEF,
};
use crate::error::StorageError;
use crate::memory::MemoryPool;
use crate::rollup::{RollupAggregator, RollupEntry, RollupFile, RollupSink, RollupType};
use crate::stoppable::{ShutdownRequest, Stoppable};
use crate::storage::{compact, PageInfo, PageManager, PageManagerOptions};
use crate::types::{
    DataPoint, HeaderIndex, MetricId, TimeRange, TimeSeriesId, Timestamp, INVALID_TIMESTAMP,
};

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Engine-level knobs; per-file knobs nest in `page`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub data_dir: PathBuf,
    /// Width of one time range (one directory of files), in the native
    /// resolution.
    pub range_duration: Timestamp,
    /// Rollup bucket width in seconds.
    pub rollup_interval: Timestamp,
    pub page: PageManagerOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(CFG_TSDB_DATA_DIR_DEF),
            range_duration: 86_400,
            rollup_interval: CFG_TSDB_ROLLUP_INTERVAL_DEF,
            page: PageManagerOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(snapshot: &Snapshot) -> Self {
        let page = PageManagerOptions::from_config(snapshot);
        let day = if page.millisecond { 86_400_000 } else { 86_400 };
        Self {
            data_dir: PathBuf::from(snapshot.get_str(CFG_TSDB_DATA_DIR, CFG_TSDB_DATA_DIR_DEF)),
            range_duration: day,
            rollup_interval: snapshot
                .get_time_secs(CFG_TSDB_ROLLUP_INTERVAL, CFG_TSDB_ROLLUP_INTERVAL_DEF)
                .max(1),
            page,
        }
    }
}

/// Outcome of a batch ingest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestCounts {
    pub accepted: u64,
    pub out_of_order: u64,
    pub rejected: u64,
}

/// A series' page currently accepting writes.
struct OpenPage {
    info: Box<PageInfo>,
    range_idx: usize,
    file_idx: usize,
}

/// Durable location of a sealed logical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRef {
    range_idx: usize,
    file_idx: usize,
    header_index: HeaderIndex,
}

#[derive(Default)]
struct SeriesState {
    mid: MetricId,
    /// High-water mark of accepted in-order timestamps.
    last_in_order: Timestamp,
    current: Option<OpenPage>,
    ooo: Option<OpenPage>,
    /// Sealed pages, in seal order.
    pages: Vec<PageRef>,
    rollup: RollupAggregator,
}

impl SeriesState {
    fn new() -> Self {
        Self {
            last_in_order: INVALID_TIMESTAMP,
            ..Default::default()
        }
    }
}

/// One time range: its directory, data files, and rollup store.
struct RangeStore {
    range: TimeRange,
    dir: PathBuf,
    data: Vec<PageManager>,
    rollup: RollupFile,
}

struct EngineState {
    ranges: Vec<RangeStore>,
    series: HashMap<TimeSeriesId, SeriesState>,
}

pub struct Engine {
    options: EngineOptions,
    pool: MemoryPool,
    state: RwLock<EngineState>,
    lifecycle: AtomicU8,
}

impl Engine {
    /// Opens the engine over `options.data_dir`, reattaching to any data
    /// files already there (which exercises per-file crash recovery).
    pub fn open(options: EngineOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.data_dir).wrap_err_with(|| {
            format!(
                "failed to create data directory '{}'",
                options.data_dir.display()
            )
        })?;

        let mut ranges = Vec::new();
        load_existing_ranges(&options, &mut ranges)?;

        info!(
            data_dir = %options.data_dir.display(),
            ranges = ranges.len(),
            "engine open"
        );
        Ok(Self {
            options,
            pool: MemoryPool::new(),
            state: RwLock::new(EngineState {
                ranges,
                series: HashMap::new(),
            }),
            lifecycle: AtomicU8::new(STATE_RUNNING),
        })
    }

    pub fn from_config(snapshot: &Snapshot) -> Result<Self> {
        Self::open(EngineOptions::from_config(snapshot))
    }

    /// Associates a series with its metric for rollup attribution.
    pub fn register_series(&self, mid: MetricId, tid: TimeSeriesId) {
        let mut state = self.state.write();
        state.series.entry(tid).or_insert_with(SeriesState::new).mid = mid;
    }

    /// Ingests one datapoint. Out-of-order timestamps are rerouted, not
    /// rejected; the error surface is I/O and shutdown.
    pub fn ingest(&self, tid: TimeSeriesId, tstamp: Timestamp, value: f64) -> Result<()> {
        self.check_accepting()?;
        let mut state = self.state.write();
        self.ingest_locked(&mut state, tid, tstamp, value)
            .map(|_| ())
    }

    /// Ingests a batch; per-point failures are counted, not fatal. Only a
    /// shutdown aborts the batch.
    pub fn ingest_batch<I>(&self, points: I) -> Result<IngestCounts>
    where
        I: IntoIterator<Item = (TimeSeriesId, Timestamp, f64)>,
    {
        let mut counts = IngestCounts::default();
        let mut state = self.state.write();
        for (tid, tstamp, value) in points {
            self.check_accepting()?;
            match self.ingest_locked(&mut state, tid, tstamp, value) {
                Ok(false) => counts.accepted += 1,
                Ok(true) => {
                    counts.accepted += 1;
                    counts.out_of_order += 1;
                }
                Err(err) => {
                    warn!(tid, tstamp, error = %err, "datapoint rejected");
                    counts.rejected += 1;
                }
            }
        }
        Ok(counts)
    }

    /// Returns whether the point took the out-of-order path.
    fn ingest_locked(
        &self,
        state: &mut EngineState,
        tid: TimeSeriesId,
        tstamp: Timestamp,
        value: f64,
    ) -> Result<bool> {
        let last = state
            .series
            .get(&tid)
            .map(|s| s.last_in_order)
            .unwrap_or(INVALID_TIMESTAMP);
        let out_of_order = last != INVALID_TIMESTAMP && tstamp < last;

        match self.append(state, tid, tstamp, value, out_of_order) {
            Ok(()) => {}
            // an in-place codec can still refuse the append (page inherited
            // a later high-water mark); reroute instead of failing
            Err(err) if !out_of_order && StorageError::is(&err, StorageError::OutOfOrder) => {
                self.append(state, tid, tstamp, value, true)?;
                return Ok(true);
            }
            Err(err) => return Err(err),
        }

        if out_of_order {
            return Ok(true);
        }

        // in-order points drive the rollup stream
        let EngineState { ranges, series } = state;
        let range_idx = locate_range(ranges, tstamp).expect("range opened by append");
        let file_range = ranges[range_idx].range;
        let series_state = series.get_mut(&tid).expect("series created by append");
        series_state.last_in_order = tstamp;

        let mid = series_state.mid;
        let mut sink = RangeSink {
            options: &self.options,
            ranges,
        };
        series_state.rollup.add_data_point(
            &mut sink,
            &file_range,
            self.options.page.millisecond,
            mid,
            tid,
            DataPoint::new(tstamp, value),
        )?;
        Ok(false)
    }

    fn append(
        &self,
        state: &mut EngineState,
        tid: TimeSeriesId,
        tstamp: Timestamp,
        value: f64,
        out_of_order: bool,
    ) -> Result<()> {
        let EngineState { ranges, series } = state;
        let range_idx = locate_or_open_range(&self.options, ranges, tstamp)?;
        let series_state = series.entry(tid).or_insert_with(SeriesState::new);

        let slot = if out_of_order {
            &mut series_state.ooo
        } else {
            &mut series_state.current
        };

        // a page left over from an earlier range seals before we move on
        if let Some(open) = slot.as_mut() {
            if open.range_idx != range_idx {
                let sealed = slot.take().expect("checked above");
                seal_page(ranges, &self.pool, &mut series_state.pages, sealed)?;
            }
        }

        loop {
            if slot.is_none() {
                let store = &mut ranges[range_idx];
                let file_idx = store.data.len() - 1;
                match store.data[file_idx].get_free_page_on_disk(&self.pool, out_of_order) {
                    Ok(info) => {
                        *slot = Some(OpenPage {
                            info,
                            range_idx,
                            file_idx,
                        });
                    }
                    Err(err) if StorageError::is(&err, StorageError::OutOfPages) => {
                        // the range gets a sibling data file and we retry
                        let id = store.data.len() as u32;
                        let path = store.dir.join(id.to_string());
                        let pm =
                            PageManager::open(&path, store.range, id, &self.options.page)?;
                        store.data.push(pm);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let open = slot.as_mut().expect("slot filled above");
            let pm = &mut ranges[open.range_idx].data[open.file_idx];
            match open.info.add_data_point(pm, tstamp, value)? {
                true => return Ok(()),
                false => {
                    // page full: seal it and allocate a successor
                    let sealed = slot.take().expect("slot filled above");
                    seal_page(ranges, &self.pool, &mut series_state.pages, sealed)?;
                }
            }
        }
    }

    /// Materializes datapoints for the given series over `range`, merged in
    /// timestamp order. With a rollup type, persisted rollup buckets are
    /// read back instead and the returned timestamps are bucket starts in
    /// seconds.
    pub fn query(
        &self,
        series_ids: &[TimeSeriesId],
        range: TimeRange,
        rollup_type: Option<RollupType>,
    ) -> Result<Vec<DataPoint>> {
        let state = self.state.read();
        let mut out = Vec::new();

        match rollup_type {
            Some(rollup_type) => {
                self.query_rollups(&state, series_ids, range, rollup_type, &mut out)?
            }
            None => self.query_raw(&state, series_ids, range, &mut out)?,
        }

        out.sort_by_key(|dp| dp.tstamp);
        Ok(out)
    }

    fn query_raw(
        &self,
        state: &EngineState,
        series_ids: &[TimeSeriesId],
        range: TimeRange,
        out: &mut Vec<DataPoint>,
    ) -> Result<()> {
        let mut scratch = Vec::new();
        for tid in series_ids {
            let Some(series_state) = state.series.get(tid) else {
                continue;
            };

            for page_ref in &series_state.pages {
                let pm = &state.ranges[page_ref.range_idx].data[page_ref.file_idx];
                if !pm.time_range().intersects(&range) {
                    continue;
                }
                let Some(mut view) = pm.get_the_page_on_disk(&self.pool, page_ref.header_index)?
                else {
                    continue;
                };
                if view.time_range().is_empty() || view.time_range().from() >= range.to() {
                    self.release_view(view);
                    continue;
                }
                scratch.clear();
                view.ensure_dp_available(pm, &self.pool, Some(&mut scratch))?;
                out.extend(scratch.iter().filter(|dp| range.contains(dp.tstamp)));
                self.release_view(view);
            }

            for open in [&series_state.current, &series_state.ooo].into_iter().flatten() {
                let pm = &state.ranges[open.range_idx].data[open.file_idx];
                scratch.clear();
                open.info.get_all_data_points(pm, &mut scratch)?;
                out.extend(scratch.iter().filter(|dp| range.contains(dp.tstamp)));
            }
        }
        Ok(())
    }

    fn query_rollups(
        &self,
        state: &EngineState,
        series_ids: &[TimeSeriesId],
        range: TimeRange,
        rollup_type: RollupType,
        out: &mut Vec<DataPoint>,
    ) -> Result<()> {
        let millisecond = self.options.page.millisecond;
        let range_sec = TimeRange::new(range.from_sec(millisecond), range.to_sec(millisecond));

        for store in &state.ranges {
            if !store.range.intersects(&range) {
                continue;
            }
            for index in 0..store.rollup.entry_count() {
                let entry = store.rollup.entry(index)?;
                if !series_ids.contains(&entry.tid()) || !range_sec.contains(entry.tstamp()) {
                    continue;
                }
                if let Some(value) =
                    rollup_type.materialize(entry.cnt(), entry.min(), entry.max(), entry.sum())
                {
                    out.push(DataPoint::new(entry.tstamp(), value));
                }
            }
        }
        Ok(())
    }

    fn release_view(&self, mut view: Box<PageInfo>) {
        view.recycle(&self.pool);
        self.pool.release_page_info(view);
    }

    /// Persists all open pages and flushes every mapping; synchronous when
    /// `sync` is set.
    pub fn flush(&self, sync: bool) -> Result<()> {
        let mut state = self.state.write();
        let EngineState { ranges, series } = &mut *state;

        for series_state in series.values_mut() {
            for open in [&mut series_state.current, &mut series_state.ooo]
                .into_iter()
                .flatten()
            {
                let pm = &mut ranges[open.range_idx].data[open.file_idx];
                open.info.persist(pm, false)?;
            }
        }
        for store in ranges.iter_mut() {
            for pm in store.data.iter_mut() {
                pm.flush(sync)?;
            }
            store.rollup.flush(sync)?;
        }
        Ok(())
    }

    /// Compacts every data file of the range starting at `range_from`,
    /// sealing any open pages in it first and patching the series index
    /// with the compactor's remap table.
    pub fn compact_range(&self, range_from: Timestamp) -> Result<()> {
        let mut state = self.state.write();
        let EngineState { ranges, series } = &mut *state;
        let range_idx = ranges
            .iter()
            .position(|store| store.range.from() == range_from)
            .ok_or_else(|| eyre::eyre!("no open range starts at {}", range_from))?;

        // seal open pages so every page is durable before the rebuild
        for series_state in series.values_mut() {
            for slot in [&mut series_state.current, &mut series_state.ooo] {
                if slot.as_ref().is_some_and(|open| open.range_idx == range_idx) {
                    let sealed = slot.take().expect("checked above");
                    seal_page(ranges, &self.pool, &mut series_state.pages, sealed)?;
                }
            }
        }

        let store = &mut ranges[range_idx];
        let files = std::mem::take(&mut store.data);
        for (file_idx, pm) in files.into_iter().enumerate() {
            let (pm, remap) = compact(pm, &self.pool)?;
            store.data.push(pm);
            if remap.is_empty() {
                continue;
            }

            let mut by_old: HashMap<HeaderIndex, SmallVec<[HeaderIndex; 2]>> = HashMap::new();
            for (old, new) in remap {
                by_old.entry(old).or_default().push(new);
            }
            for series_state in series.values_mut() {
                let pages = std::mem::take(&mut series_state.pages);
                series_state.pages = pages
                    .into_iter()
                    .flat_map(|page_ref| {
                        let mut replaced: SmallVec<[PageRef; 2]> = SmallVec::new();
                        if page_ref.range_idx == range_idx && page_ref.file_idx == file_idx {
                            if let Some(new_indexes) = by_old.get(&page_ref.header_index) {
                                for &header_index in new_indexes {
                                    replaced.push(PageRef {
                                        header_index,
                                        ..page_ref
                                    });
                                }
                                return replaced;
                            }
                        }
                        replaced.push(page_ref);
                        replaced
                    })
                    .collect();
                series_state.pages.dedup();
            }
        }
        Ok(())
    }

    /// Rollup buckets persisted for the range starting at `range_from`,
    /// gap-filled empties included.
    pub fn rollup_bucket_count(&self, range_from: Timestamp) -> u32 {
        let state = self.state.read();
        state
            .ranges
            .iter()
            .find(|store| store.range.from() == range_from)
            .map(|store| store.rollup.entry_count())
            .unwrap_or(0)
    }

    /// Series with an open (not yet sealed) page — the write backlog a
    /// drain has to settle.
    pub fn pending_flush_count(&self) -> usize {
        let state = self.state.read();
        state
            .series
            .values()
            .filter(|s| s.current.is_some() || s.ooo.is_some())
            .count()
    }

    fn check_accepting(&self) -> Result<()> {
        if self.lifecycle.load(Ordering::Acquire) != STATE_RUNNING {
            bail!(StorageError::ShutdownInProgress);
        }
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        // flush rollup tails, then everything, synchronously
        let mut state = self.state.write();
        let EngineState { ranges, series } = &mut *state;
        for (tid, series_state) in series.iter_mut() {
            let mid = series_state.mid;
            let mut sink = RangeSink {
                options: &self.options,
                ranges: &mut *ranges,
            };
            series_state.rollup.flush(&mut sink, mid, *tid)?;
        }
        drop(state);
        self.flush(true)
    }
}

impl Stoppable for Engine {
    fn shutdown(&self, request: ShutdownRequest) {
        let target = match request {
            ShutdownRequest::Drain => STATE_DRAINING,
            ShutdownRequest::Asap => STATE_STOPPED,
        };
        self.lifecycle.store(target, Ordering::Release);

        if request == ShutdownRequest::Drain {
            if let Err(err) = self.drain() {
                warn!(error = %err, "drain failed during shutdown");
            }
            self.lifecycle.store(STATE_STOPPED, Ordering::Release);
        }
    }

    fn wait(&mut self, _timeout: Duration) -> bool {
        self.lifecycle.load(Ordering::Acquire) == STATE_STOPPED
    }
}

/// Routes flushed rollup buckets to the store of the range owning them.
struct RangeSink<'a> {
    options: &'a EngineOptions,
    ranges: &'a mut Vec<RangeStore>,
}

impl RollupSink for RangeSink<'_> {
    fn rollup_interval(&self) -> Timestamp {
        self.options.rollup_interval
    }

    fn add_rollup_point(
        &mut self,
        mid: MetricId,
        tid: TimeSeriesId,
        tstamp: Timestamp,
        cnt: u32,
        min: f64,
        max: f64,
        sum: f64,
    ) -> Result<()> {
        // bucket labels are seconds; ranges are in native resolution
        let native = if self.options.page.millisecond {
            tstamp * 1000
        } else {
            tstamp
        };
        let range_idx = locate_or_open_range(self.options, self.ranges, native)?;
        self.ranges[range_idx]
            .rollup
            .append(&RollupEntry::new(mid, tid, tstamp, cnt, min, max, sum))
    }
}

fn seal_page(
    ranges: &mut [RangeStore],
    pool: &MemoryPool,
    pages: &mut Vec<PageRef>,
    mut open: OpenPage,
) -> Result<()> {
    let pm = &mut ranges[open.range_idx].data[open.file_idx];
    open.info.persist(pm, false)?;
    open.info.flush(pm, pool)?;
    open.info.recycle(pool);
    pages.push(PageRef {
        range_idx: open.range_idx,
        file_idx: open.file_idx,
        header_index: open.info.header_index(),
    });
    pool.release_page_info(open.info);
    Ok(())
}

fn locate_range(ranges: &[RangeStore], tstamp: Timestamp) -> Option<usize> {
    ranges.iter().position(|store| store.range.contains(tstamp))
}

fn locate_or_open_range(
    options: &EngineOptions,
    ranges: &mut Vec<RangeStore>,
    tstamp: Timestamp,
) -> Result<usize> {
    if let Some(idx) = locate_range(ranges, tstamp) {
        return Ok(idx);
    }

    let from = tstamp - (tstamp % options.range_duration);
    let range = TimeRange::new(from, from + options.range_duration);
    let dir = options.data_dir.join(from.to_string());
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create range directory '{}'", dir.display()))?;

    let pm = open_or_quarantine(&dir.join("0"), range, 0, &options.page)?;
    let rollup = RollupFile::open(&dir.join("rollup"))?;
    ranges.push(RangeStore {
        range,
        dir,
        data: vec![pm],
        rollup,
    });
    Ok(ranges.len() - 1)
}

/// Opens a data file; a corrupt one is renamed aside and replaced so the
/// rest of the database keeps serving.
fn open_or_quarantine(
    path: &std::path::Path,
    range: TimeRange,
    id: u32,
    options: &PageManagerOptions,
) -> Result<PageManager> {
    match PageManager::open(path, range, id, options) {
        Ok(pm) => Ok(pm),
        Err(err) if StorageError::is(&err, StorageError::Corrupt) => {
            let mut quarantine = path.to_path_buf();
            quarantine.as_mut_os_string().push(".quarantined");
            warn!(
                path = %path.display(),
                quarantine = %quarantine.display(),
                "corrupt data file quarantined"
            );
            std::fs::rename(path, &quarantine).wrap_err_with(|| {
                format!("failed to quarantine '{}'", path.display())
            })?;
            PageManager::open(path, range, id, options)
        }
        Err(err) => Err(err),
    }
}

fn load_existing_ranges(options: &EngineOptions, ranges: &mut Vec<RangeStore>) -> Result<()> {
    let entries = match std::fs::read_dir(&options.data_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(from) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<Timestamp>().ok())
        else {
            continue;
        };

        let dir = entry.path();
        let range = TimeRange::new(from, from + options.range_duration);
        let mut file_ids: Vec<u32> = std::fs::read_dir(&dir)
            .map(|files| {
                files
                    .flatten()
                    .filter_map(|f| f.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
                    .collect()
            })
            .unwrap_or_default();
        file_ids.sort_unstable();

        let mut data = Vec::new();
        for id in file_ids {
            data.push(open_or_quarantine(
                &dir.join(id.to_string()),
                range,
                id,
                &options.page,
            )?);
        }
        if data.is_empty() {
            data.push(open_or_quarantine(&dir.join("0"), range, 0, &options.page)?);
        }

        // the file header is authoritative for the range bounds
        let range = *data[0].time_range();
        let rollup = RollupFile::open(&dir.join("rollup"))?;
        ranges.push(RangeStore {
            range,
            dir,
            data,
            rollup,
        });
    }
    Ok(())
}
