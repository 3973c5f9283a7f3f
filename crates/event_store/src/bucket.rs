use chrono::{DateTime, TimeDelta, Utc};
use common::domain::DateRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Width used when the store is not configured otherwise
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(60 * 60);

/// Fixed-width time bucket number, `floor(event_millis / width_millis)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(pub i64);

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps timestamps to buckets. The width is fixed for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketScheme {
    width_ms: i64,
}

impl Default for BucketScheme {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_WIDTH)
    }
}

impl BucketScheme {
    /// Widths below one millisecond are clamped to one millisecond.
    pub fn new(width: Duration) -> Self {
        let width_ms = i64::try_from(width.as_millis()).unwrap_or(i64::MAX).max(1);
        Self { width_ms }
    }

    pub fn width(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.width_ms)
    }

    pub fn width_ms(&self) -> i64 {
        self.width_ms
    }

    pub fn bucket_of(&self, ts: DateTime<Utc>) -> BucketId {
        BucketId(ts.timestamp_millis().div_euclid(self.width_ms))
    }

    /// Every bucket intersecting `range`, newest first. An open end means now.
    pub fn buckets_covering(&self, range: &DateRange) -> Vec<BucketId> {
        self.buckets_covering_at(range, Utc::now())
    }

    /// Same as [`Self::buckets_covering`] with an explicit clock.
    ///
    /// An open start reaches back one bucket width from the end. A range whose
    /// start lies after its end still yields the end bucket.
    pub fn buckets_covering_at(&self, range: &DateRange, now: DateTime<Utc>) -> Vec<BucketId> {
        let (oldest, newest) = self.span_at(range, now);
        (oldest.0..=newest.0).rev().map(BucketId).collect()
    }

    /// Number of buckets [`Self::buckets_covering_at`] would return, without
    /// enumerating them.
    pub fn bucket_count_at(&self, range: &DateRange, now: DateTime<Utc>) -> u64 {
        let (oldest, newest) = self.span_at(range, now);
        newest.0.abs_diff(oldest.0).saturating_add(1)
    }

    /// Oldest and newest covering bucket
    fn span_at(&self, range: &DateRange, now: DateTime<Utc>) -> (BucketId, BucketId) {
        let end = range.end.unwrap_or(now);
        let start = range
            .start
            .unwrap_or_else(|| end.checked_sub_signed(self.width()).unwrap_or(end));

        let newest = self.bucket_of(end);
        (self.bucket_of(start).min(newest), newest)
    }
}
