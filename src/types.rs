//! # Core Domain Types
//!
//! Timestamps, time ranges, datapoints, and the opaque identifiers handed
//! out by the catalog. Everything here is plain data; behavior lives in the
//! storage and rollup layers.
//!
//! ## Timestamp Resolution
//!
//! A [`Timestamp`] is a 64-bit integer in either second or millisecond
//! resolution. The resolution is fixed per data file at creation time and
//! recorded in the file header; mixing resolutions within one database is
//! rejected at file-open time. Code that needs wall-clock seconds regardless
//! of the file's resolution goes through [`to_sec`].
//!
//! ## Time Ranges
//!
//! A [`TimeRange`] is half-open: `[from, to)`. Every data file owns exactly
//! one range, and every page within the file stays inside it. Ranges also
//! track the observed span of a single page in memory, which is why
//! [`TimeRange::add_time`] exists: a freshly minted page starts with an
//! inverted (empty) range and grows as datapoints arrive.

/// 64-bit timestamp in the owning file's native resolution.
pub type Timestamp = u64;

/// Sentinel for "no timestamp yet".
pub const INVALID_TIMESTAMP: Timestamp = u64::MAX;

/// Opaque metric identifier assigned by the catalog.
pub type MetricId = u32;

/// Opaque series identifier assigned by the catalog.
pub type TimeSeriesId = u32;

/// Physical page index within a data file.
pub type PageIndex = u32;

/// Logical page (header slot) index within a data file.
pub type HeaderIndex = u32;

/// Converts a timestamp to seconds given the resolution it was recorded in.
#[inline]
pub fn to_sec(tstamp: Timestamp, millisecond: bool) -> Timestamp {
    if millisecond {
        tstamp / 1000
    } else {
        tstamp
    }
}

/// A single observation: timestamp plus value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub tstamp: Timestamp,
    pub value: f64,
}

impl DataPoint {
    #[inline]
    pub fn new(tstamp: Timestamp, value: f64) -> Self {
        Self { tstamp, value }
    }
}

/// Half-open timestamp interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    from: Timestamp,
    to: Timestamp,
}

impl TimeRange {
    #[inline]
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// An inverted range that contains nothing; `add_time` collapses it to
    /// the first timestamp it sees. Used for pages that have no data yet.
    #[inline]
    pub fn empty_within(file_range: &TimeRange) -> Self {
        Self {
            from: file_range.to,
            to: file_range.from,
        }
    }

    #[inline]
    pub fn from(&self) -> Timestamp {
        self.from
    }

    #[inline]
    pub fn to(&self) -> Timestamp {
        self.to
    }

    /// True when no timestamp has been folded in yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    #[inline]
    pub fn duration(&self) -> Timestamp {
        self.to.saturating_sub(self.from)
    }

    #[inline]
    pub fn contains(&self, tstamp: Timestamp) -> bool {
        self.from <= tstamp && tstamp < self.to
    }

    /// Inclusive containment used for page spans, whose `to` is the last
    /// observed timestamp rather than an exclusive bound.
    #[inline]
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.is_empty() || (self.from <= other.from && other.to <= self.to)
    }

    #[inline]
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Grows the range to cover `tstamp`.
    #[inline]
    pub fn add_time(&mut self, tstamp: Timestamp) {
        if self.is_empty() {
            self.from = tstamp;
            self.to = tstamp;
        } else {
            if tstamp < self.from {
                self.from = tstamp;
            }
            if tstamp > self.to {
                self.to = tstamp;
            }
        }
    }

    /// `from` in seconds for the given resolution.
    #[inline]
    pub fn from_sec(&self, millisecond: bool) -> Timestamp {
        to_sec(self.from, millisecond)
    }

    /// `to` in seconds for the given resolution.
    #[inline]
    pub fn to_sec(&self, millisecond: bool) -> Timestamp {
        to_sec(self.to, millisecond)
    }
}

impl Default for TimeRange {
    /// An empty (inverted) range; `add_time` collapses it to the first
    /// timestamp it sees.
    fn default() -> Self {
        Self {
            from: INVALID_TIMESTAMP,
            to: 0,
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_containment() {
        let r = TimeRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(199));
        assert!(!r.contains(200));
        assert!(!r.contains(99));
    }

    #[test]
    fn empty_range_grows_from_first_timestamp() {
        let file = TimeRange::new(100, 200);
        let mut r = TimeRange::empty_within(&file);
        assert!(r.is_empty());

        r.add_time(150);
        assert!(!r.is_empty());
        assert_eq!(r.from(), 150);
        assert_eq!(r.to(), 150);

        r.add_time(120);
        r.add_time(180);
        assert_eq!(r.from(), 120);
        assert_eq!(r.to(), 180);
    }

    #[test]
    fn intersects_is_exclusive_at_bounds() {
        let a = TimeRange::new(0, 100);
        let b = TimeRange::new(100, 200);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&TimeRange::new(99, 101)));
    }

    #[test]
    fn second_conversion() {
        assert_eq!(to_sec(12_345, false), 12_345);
        assert_eq!(to_sec(12_345, true), 12);
    }
}
