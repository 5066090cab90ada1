//! # Rollup Integration Tests
//!
//! Drives the engine end-to-end and checks the streaming rollup behavior
//! that matters to queries:
//!
//! 1. Gap filling — a span of S seconds at interval I yields exactly
//!    ceil(S / I) persisted buckets, empties included
//! 2. Rollup continuity across a file (time range) boundary
//! 3. Aggregate correctness for every rollup kind, including the shape
//!    that separates a real max from one accumulated off the running min

use tempfile::tempdir;

use pulsedb::engine::{Engine, EngineOptions};
use pulsedb::rollup::RollupType;
use pulsedb::storage::PageManagerOptions;
use pulsedb::types::{DataPoint, TimeRange};
use pulsedb::{ShutdownRequest, Stoppable};

fn options(dir: &std::path::Path, range_duration: u64, rollup_interval: u64) -> EngineOptions {
    EngineOptions {
        data_dir: dir.to_path_buf(),
        range_duration,
        rollup_interval,
        page: PageManagerOptions {
            page_count: 16,
            page_size: 4096,
            compressor_version: 1,
            millisecond: false,
        },
    }
}

#[test]
fn gap_filling_emits_a_bucket_per_interval() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(options(dir.path(), 100, 10)).unwrap();

    engine.ingest(7, 0, 1.0).unwrap();
    engine.ingest(7, 35, 2.0).unwrap();
    engine.shutdown(ShutdownRequest::Drain);

    // span [0, 35] at interval 10 -> buckets 0, 10, 20, 30
    assert_eq!(engine.rollup_bucket_count(0), 4);

    let cnt = engine
        .query(&[7], TimeRange::new(0, 100), Some(RollupType::Cnt))
        .unwrap();
    assert_eq!(
        cnt,
        vec![DataPoint::new(0, 1.0), DataPoint::new(30, 1.0)]
    );

    let sum = engine
        .query(&[7], TimeRange::new(0, 100), Some(RollupType::Sum))
        .unwrap();
    assert_eq!(
        sum,
        vec![DataPoint::new(0, 1.0), DataPoint::new(30, 2.0)]
    );
}

#[test]
fn rollup_crosses_file_boundary() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(options(dir.path(), 100, 10)).unwrap();

    engine.ingest(7, 5, 1.0).unwrap();
    engine.ingest(7, 115, 2.0).unwrap();
    engine.shutdown(ShutdownRequest::Drain);

    // first file: bucket 0 plus empties 10..90; second file: empty 100,
    // then 110 flushed by the drain
    assert_eq!(engine.rollup_bucket_count(0), 10);
    assert_eq!(engine.rollup_bucket_count(100), 2);

    let cnt = engine
        .query(&[7], TimeRange::new(0, 200), Some(RollupType::Cnt))
        .unwrap();
    assert_eq!(
        cnt,
        vec![DataPoint::new(0, 1.0), DataPoint::new(110, 1.0)]
    );
}

#[test]
fn aggregate_kinds_are_correct() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(options(dir.path(), 1000, 10)).unwrap();

    // one bucket shaped to catch max-from-min accumulation: the maximum
    // arrives first, then the minimum
    engine.ingest(7, 0, 9.0).unwrap();
    engine.ingest(7, 1, -4.0).unwrap();
    engine.ingest(7, 2, 1.0).unwrap();
    engine.shutdown(ShutdownRequest::Drain);

    let range = TimeRange::new(0, 1000);
    let get = |kind| {
        engine
            .query(&[7], range, Some(kind))
            .unwrap()
            .first()
            .copied()
            .unwrap()
    };

    assert_eq!(get(RollupType::Cnt).value, 3.0);
    assert_eq!(get(RollupType::Min).value, -4.0);
    assert_eq!(get(RollupType::Max).value, 9.0);
    assert_eq!(get(RollupType::Sum).value, 6.0);
    assert_eq!(get(RollupType::Avg).value, 2.0);
}

#[test]
fn out_of_order_points_bypass_rollup() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(options(dir.path(), 1000, 10)).unwrap();

    engine.ingest(7, 50, 1.0).unwrap();
    engine.ingest(7, 5, 100.0).unwrap(); // out of order, no rollup impact
    engine.shutdown(ShutdownRequest::Drain);

    let sum = engine
        .query(&[7], TimeRange::new(0, 1000), Some(RollupType::Sum))
        .unwrap();
    assert_eq!(sum, vec![DataPoint::new(50, 1.0)]);

    // the raw point is still queryable
    let raw = engine.query(&[7], TimeRange::new(0, 1000), None).unwrap();
    assert_eq!(
        raw,
        vec![DataPoint::new(5, 100.0), DataPoint::new(50, 1.0)]
    );
}

#[test]
fn buckets_attribute_to_registered_metric() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(options(dir.path(), 1000, 10)).unwrap();
    engine.register_series(42, 7);
    engine.register_series(42, 8);

    engine.ingest(7, 0, 1.0).unwrap();
    engine.ingest(8, 0, 10.0).unwrap();
    engine.shutdown(ShutdownRequest::Drain);

    // per-series isolation: series 8's bucket does not leak into 7's query
    let sum7 = engine
        .query(&[7], TimeRange::new(0, 1000), Some(RollupType::Sum))
        .unwrap();
    assert_eq!(sum7, vec![DataPoint::new(0, 1.0)]);

    let both = engine
        .query(&[7, 8], TimeRange::new(0, 1000), Some(RollupType::Sum))
        .unwrap();
    assert_eq!(both.len(), 2);
}
