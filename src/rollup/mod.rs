//! # Streaming Rollup Aggregation
//!
//! One [`RollupAggregator`] per live series folds in-order datapoints into
//! fixed-interval `(count, min, max, sum)` buckets. Buckets are labeled by
//! their lower bound in seconds: `bucket = ts - (ts % interval)`.
//!
//! ## Gap Filling
//!
//! When a datapoint lands in a later bucket than the one being accumulated,
//! the current bucket flushes and an **empty** `(0, 0, 0, 0)` bucket is
//! emitted for every missing interval strictly before the new bucket —
//! but only within the bound file's time range. If the walk crosses the
//! file's end, the aggregator rebinds to the file owning the new datapoint
//! and continues gap-filling from that file's start. Queries over a span
//! therefore see exactly `ceil(span / interval)` aggregates, present or
//! not.
//!
//! ## Ordering
//!
//! In-order ingest only: the engine routes out-of-order datapoints straight
//! to out-of-order pages and they bypass rollup entirely.

mod store;

pub use store::{RollupEntry, RollupFile};

use eyre::Result;

use crate::types::{
    to_sec, DataPoint, MetricId, TimeRange, TimeSeriesId, Timestamp, INVALID_TIMESTAMP,
};

/// Aggregate kinds a rollup query can materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupType {
    Avg,
    Cnt,
    Min,
    Max,
    Sum,
}

impl RollupType {
    /// The aggregate value for one bucket, or `None` for an empty bucket.
    pub fn materialize(&self, cnt: u32, min: f64, max: f64, sum: f64) -> Option<f64> {
        if cnt == 0 {
            return None;
        }
        Some(match self {
            RollupType::Avg => sum / cnt as f64,
            RollupType::Cnt => cnt as f64,
            RollupType::Min => min,
            RollupType::Max => max,
            RollupType::Sum => sum,
        })
    }
}

/// Where flushed buckets go. Implemented by the engine, which routes each
/// aggregate to the rollup store of the file owning its bucket timestamp.
pub trait RollupSink {
    /// Rollup interval in seconds.
    fn rollup_interval(&self) -> Timestamp;

    fn add_rollup_point(
        &mut self,
        mid: MetricId,
        tid: TimeSeriesId,
        tstamp: Timestamp,
        cnt: u32,
        min: f64,
        max: f64,
        sum: f64,
    ) -> Result<()>;
}

/// Per-series streaming accumulator.
#[derive(Debug)]
pub struct RollupAggregator {
    cnt: u32,
    min: f64,
    max: f64,
    sum: f64,
    /// Lower bound of the bucket being accumulated, in seconds.
    tstamp: Timestamp,
    /// Time range (in seconds) of the file the aggregator is bound to.
    file_range: Option<TimeRange>,
}

impl Default for RollupAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl RollupAggregator {
    pub fn new() -> Self {
        Self {
            cnt: 0,
            min: 0.0,
            max: 0.0,
            sum: 0.0,
            tstamp: INVALID_TIMESTAMP,
            file_range: None,
        }
    }

    /// Folds one in-order datapoint into the current bucket, flushing and
    /// gap-filling when the datapoint opens a later bucket. `file_range` is
    /// the range of the file owning `dp` in its native resolution;
    /// `millisecond` names that resolution.
    pub fn add_data_point<S: RollupSink>(
        &mut self,
        sink: &mut S,
        file_range: &TimeRange,
        millisecond: bool,
        mid: MetricId,
        tid: TimeSeriesId,
        dp: DataPoint,
    ) -> Result<()> {
        let interval = sink.rollup_interval();
        debug_assert!(interval > 0);

        let range_sec = TimeRange::new(
            file_range.from_sec(millisecond),
            file_range.to_sec(millisecond),
        );
        if self.file_range.is_none() {
            self.file_range = Some(range_sec);
        }

        let bucket = Self::step_down(to_sec(dp.tstamp, millisecond), interval);
        if self.tstamp == INVALID_TIMESTAMP {
            self.tstamp = bucket;
        }

        if bucket != self.tstamp {
            self.flush(sink, mid, tid)?;

            let end = self.file_range.expect("bound above").to();
            self.tstamp += interval;
            while self.tstamp < end && self.tstamp < bucket {
                self.flush(sink, mid, tid)?;
                self.tstamp += interval;
            }

            if self.tstamp >= end {
                // crossed into the next file; continue gap-filling there
                self.file_range = Some(range_sec);
                self.tstamp = range_sec.from();
                while self.tstamp < bucket {
                    self.flush(sink, mid, tid)?;
                    self.tstamp += interval;
                }
            }
        }

        if self.cnt == 0 {
            self.min = dp.value;
            self.max = dp.value;
        } else {
            self.min = self.min.min(dp.value);
            self.max = self.max.max(dp.value);
        }
        self.cnt += 1;
        self.sum += dp.value;
        Ok(())
    }

    /// Emits the current bucket (empty buckets included) and resets the
    /// accumulators — but not the bucket label, which keeps advancing.
    pub fn flush<S: RollupSink>(
        &mut self,
        sink: &mut S,
        mid: MetricId,
        tid: TimeSeriesId,
    ) -> Result<()> {
        if self.tstamp == INVALID_TIMESTAMP {
            return Ok(());
        }
        sink.add_rollup_point(mid, tid, self.tstamp, self.cnt, self.min, self.max, self.sum)?;
        self.cnt = 0;
        self.min = 0.0;
        self.max = 0.0;
        self.sum = 0.0;
        Ok(())
    }

    /// One aggregate of the requested kind from the in-flight bucket, or
    /// `None` when nothing has accumulated.
    pub fn query(&self, rollup_type: RollupType) -> Option<DataPoint> {
        rollup_type
            .materialize(self.cnt, self.min, self.max, self.sum)
            .map(|value| DataPoint::new(self.tstamp, value))
    }

    /// Bucket lower bound for a timestamp, in seconds.
    pub fn step_down(tstamp_sec: Timestamp, interval: Timestamp) -> Timestamp {
        tstamp_sec - (tstamp_sec % interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink {
        interval: Timestamp,
        emitted: Vec<(Timestamp, u32, f64, f64, f64)>,
    }

    impl VecSink {
        fn new(interval: Timestamp) -> Self {
            Self {
                interval,
                emitted: Vec::new(),
            }
        }
    }

    impl RollupSink for VecSink {
        fn rollup_interval(&self) -> Timestamp {
            self.interval
        }

        fn add_rollup_point(
            &mut self,
            _mid: MetricId,
            _tid: TimeSeriesId,
            tstamp: Timestamp,
            cnt: u32,
            min: f64,
            max: f64,
            sum: f64,
        ) -> Result<()> {
            self.emitted.push((tstamp, cnt, min, max, sum));
            Ok(())
        }
    }

    #[test]
    fn accumulates_within_one_bucket() {
        let mut sink = VecSink::new(10);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 100);

        for &(ts, v) in &[(0, 2.0), (3, 5.0), (9, 1.0)] {
            agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(ts, v))
                .unwrap();
        }
        assert!(sink.emitted.is_empty());

        agg.flush(&mut sink, 1, 7).unwrap();
        assert_eq!(sink.emitted, vec![(0, 3, 1.0, 5.0, 8.0)]);
    }

    #[test]
    fn gap_filling_emits_empty_buckets() {
        let mut sink = VecSink::new(10);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 100);

        agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(0, 1.0))
            .unwrap();
        agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(35, 2.0))
            .unwrap();

        // buckets 0 (cnt=1), 10 and 20 empty; bucket 30 still accumulating
        assert_eq!(
            sink.emitted,
            vec![
                (0, 1, 1.0, 1.0, 1.0),
                (10, 0, 0.0, 0.0, 0.0),
                (20, 0, 0.0, 0.0, 0.0),
            ]
        );

        agg.flush(&mut sink, 1, 7).unwrap();
        assert_eq!(sink.emitted.last(), Some(&(30, 1, 2.0, 2.0, 2.0)));
    }

    #[test]
    fn max_tracks_the_maximum_not_the_minimum() {
        // a descending-then-ascending shape catches an accumulator that
        // derives max from the running min
        let mut sink = VecSink::new(60);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 3600);

        for &(ts, v) in &[(0, 5.0), (1, -3.0), (2, 4.0)] {
            agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(ts, v))
                .unwrap();
        }

        let dp = agg.query(RollupType::Max).unwrap();
        assert_eq!(dp.value, 5.0);
        let dp = agg.query(RollupType::Min).unwrap();
        assert_eq!(dp.value, -3.0);
    }

    #[test]
    fn min_max_seed_from_first_value_not_zero() {
        let mut sink = VecSink::new(60);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 3600);

        agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(0, 7.5))
            .unwrap();

        assert_eq!(agg.query(RollupType::Min).unwrap().value, 7.5);
        assert_eq!(agg.query(RollupType::Max).unwrap().value, 7.5);
    }

    #[test]
    fn query_kinds() {
        let mut sink = VecSink::new(60);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 3600);

        assert!(agg.query(RollupType::Avg).is_none());

        for &(ts, v) in &[(0, 1.0), (1, 2.0), (2, 6.0)] {
            agg.add_data_point(&mut sink, &range, false, 1, 7, DataPoint::new(ts, v))
                .unwrap();
        }

        assert_eq!(agg.query(RollupType::Avg).unwrap().value, 3.0);
        assert_eq!(agg.query(RollupType::Cnt).unwrap().value, 3.0);
        assert_eq!(agg.query(RollupType::Sum).unwrap().value, 9.0);
    }

    #[test]
    fn crosses_file_boundary_and_rebinds() {
        let mut sink = VecSink::new(10);
        let mut agg = RollupAggregator::new();
        let first = TimeRange::new(0, 100);
        let second = TimeRange::new(100, 200);

        agg.add_data_point(&mut sink, &first, false, 1, 7, DataPoint::new(5, 1.0))
            .unwrap();
        agg.add_data_point(&mut sink, &second, false, 1, 7, DataPoint::new(115, 2.0))
            .unwrap();

        // first file: bucket 0 plus empties 10..90; second file: empty 100
        let expected: Vec<Timestamp> = (0..=100).step_by(10).collect();
        let got: Vec<Timestamp> = sink.emitted.iter().map(|e| e.0).collect();
        assert_eq!(got, expected);
        assert_eq!(sink.emitted[0].1, 1);
        assert!(sink.emitted[1..].iter().all(|e| e.1 == 0));

        agg.flush(&mut sink, 1, 7).unwrap();
        assert_eq!(sink.emitted.last(), Some(&(110, 1, 2.0, 2.0, 2.0)));
    }

    #[test]
    fn millisecond_resolution_steps_down_in_seconds() {
        let mut sink = VecSink::new(10);
        let mut agg = RollupAggregator::new();
        let range = TimeRange::new(0, 100_000);

        agg.add_data_point(&mut sink, &range, true, 1, 7, DataPoint::new(35_250, 4.0))
            .unwrap();
        assert_eq!(agg.query(RollupType::Cnt).unwrap().tstamp, 30);
    }
}
