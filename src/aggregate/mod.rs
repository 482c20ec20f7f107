//! Time-bucketed statistics over the result stream.
//!
//! Every counted result lands in exactly one hourly and one daily bucket per
//! endpoint. Buckets are aligned to UTC hour/day starts, updated in place while
//! their window is open and frozen once it has passed.

mod health;
mod stats;

pub use health::*;
pub use stats::*;

use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Snapshot;
use crate::probe::TestResult;

/// Aggregation window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
}

impl Period {
    pub const ALL: [Period; 2] = [Period::Hourly, Period::Daily];

    pub fn window_seconds(&self) -> i64 {
        match self {
            Period::Hourly => 3600,
            Period::Daily => 86400,
        }
    }

    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_window(time, self.window_seconds())
    }

    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + ChronoDuration::seconds(self.window_seconds())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Hourly => "hourly",
            Period::Daily => "daily",
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Period::Hourly),
            "daily" => Ok(Period::Daily),
            other => Err(format!("unknown period {other:?} (expected hourly or daily)")),
        }
    }
}

/// Truncate a timestamp down to the start of its window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub endpoint_id: String,
    pub period: Period,
    pub bucket_start: DateTime<Utc>,
}

impl BucketKey {
    pub fn for_time(endpoint_id: impl Into<String>, period: Period, time: DateTime<Utc>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            period,
            bucket_start: period.bucket_start(time),
        }
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.period.bucket_end(self.bucket_start)
    }
}

/// Aggregator errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("result for {endpoint_id} falls in closed {period} bucket starting {bucket_start}")]
    StaleResult {
        endpoint_id: String,
        period: Period,
        bucket_start: DateTime<Utc>,
    },
}

/// What [`Aggregator::ingest`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded,
    /// Cancelled and invalid-config results carry no information about the
    /// endpoint and are left out of the statistics.
    Ignored,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    stats: BucketStats,
    closed: bool,
}

/// A bucket as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub endpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub period: Period,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub closed: bool,
    #[serde(flatten)]
    pub stats: StatsSummary,
}

/// Combination of the member buckets of one region for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRollup {
    pub region: String,
    pub period: Period,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    /// Members that had a bucket for the window.
    pub endpoint_count: usize,
    #[serde(flatten)]
    pub stats: StatsSummary,
}

/// Concurrent hourly/daily bucket store.
///
/// Bucket mutations are serialized per key by the map's shard locks. Closing
/// takes `close_barrier` exclusively, so an ingest never straddles a close.
pub struct Aggregator {
    buckets: DashMap<BucketKey, Bucket>,
    regions: DashMap<String, String>,
    grace: ChronoDuration,
    close_barrier: RwLock<()>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            regions: DashMap::new(),
            grace: ChronoDuration::zero(),
            close_barrier: RwLock::new(()),
        }
    }

    /// Keep buckets open for `grace` past their end so results still in
    /// flight at the boundary are counted.
    pub fn with_grace(grace: std::time::Duration) -> Self {
        Self {
            grace: ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero()),
            ..Self::new()
        }
    }

    /// Record the endpoint → region mapping used to label buckets.
    pub fn assign_regions(&self, snapshot: &Snapshot) {
        self.regions.clear();
        for endpoint in snapshot.endpoints() {
            self.regions.insert(endpoint.id.clone(), endpoint.region.clone());
        }
    }

    pub fn ingest(&self, result: &TestResult) -> Result<IngestOutcome, AggregateError> {
        self.ingest_at(result, Utc::now())
    }

    /// Ingest with an explicit notion of "now" for closing decisions.
    ///
    /// Either both period buckets are updated or neither is.
    pub fn ingest_at(&self, result: &TestResult, now: DateTime<Utc>) -> Result<IngestOutcome, AggregateError> {
        if !BucketStats::counts(result.status) {
            return Ok(IngestOutcome::Ignored);
        }

        let _barrier = self.close_barrier.read().unwrap_or_else(|e| e.into_inner());
        let keys = Period::ALL.map(|p| BucketKey::for_time(result.endpoint_id.as_str(), p, result.timestamp));

        for key in &keys {
            let closed = key.bucket_end() + self.grace <= now
                || self.buckets.get(key).map(|b| b.closed).unwrap_or(false);
            if closed {
                return Err(AggregateError::StaleResult {
                    endpoint_id: key.endpoint_id.clone(),
                    period: key.period,
                    bucket_start: key.bucket_start,
                });
            }
        }

        for key in keys {
            self.buckets.entry(key).or_default().stats.record(result);
        }
        Ok(IngestOutcome::Recorded)
    }

    pub fn get_bucket(&self, endpoint_id: &str, period: Period, time: DateTime<Utc>) -> Option<AggregatedResult> {
        self.get_bucket_at(endpoint_id, period, time, Utc::now())
    }

    /// Like [`Aggregator::get_bucket`], reporting the window as closed once
    /// it has elapsed at `now` even if no close pass has run yet.
    pub fn get_bucket_at(
        &self,
        endpoint_id: &str,
        period: Period,
        time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<AggregatedResult> {
        let key = BucketKey::for_time(endpoint_id, period, time);
        self.buckets.get(&key).map(|b| self.view(&key, &b, now))
    }

    /// Close every open bucket whose window (plus grace) has passed.
    pub fn close_elapsed(&self, now: DateTime<Utc>) -> usize {
        let _barrier = self.close_barrier.write().unwrap_or_else(|e| e.into_inner());
        let mut closed = 0;
        for mut entry in self.buckets.iter_mut() {
            if !entry.closed && entry.key().bucket_end() + self.grace <= now {
                entry.closed = true;
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::debug!("Closed {} aggregation buckets", closed);
        }
        closed
    }

    /// Remove and return every closed bucket, oldest first.
    pub fn take_closed(&self) -> Vec<AggregatedResult> {
        self.drain_closed(|_| true)
    }

    /// Remove and return closed buckets whose window ended at or before
    /// `cutoff`. Newer closed buckets stay readable.
    pub fn take_closed_before(&self, cutoff: DateTime<Utc>) -> Vec<AggregatedResult> {
        self.drain_closed(|k| k.bucket_end() <= cutoff)
    }

    fn drain_closed(&self, select: impl Fn(&BucketKey) -> bool) -> Vec<AggregatedResult> {
        let keys: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|e| e.closed && select(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let now = Utc::now();
        let mut drained: Vec<AggregatedResult> = keys
            .into_iter()
            .filter_map(|k| self.buckets.remove(&k))
            .map(|(k, b)| self.view(&k, &b, now))
            .collect();
        drained.sort_by(|a, b| a.bucket_start.cmp(&b.bucket_start).then(a.period.cmp(&b.period)));
        drained
    }

    /// Every existing bucket of `endpoint_id` whose window starts within
    /// `[from, to]` (with `from` truncated to its window start).
    pub fn range(
        &self,
        endpoint_id: &str,
        period: Period,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<AggregatedResult> {
        let first = period.bucket_start(from);
        let now = Utc::now();
        let mut out: Vec<AggregatedResult> = self
            .buckets
            .iter()
            .filter(|e| {
                let k = e.key();
                k.endpoint_id == endpoint_id && k.period == period && k.bucket_start >= first && k.bucket_start <= to
            })
            .map(|e| self.view(e.key(), e.value(), now))
            .collect();
        out.sort_by_key(|r| r.bucket_start);
        out
    }

    pub fn hourly_range(&self, endpoint_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AggregatedResult> {
        self.range(endpoint_id, Period::Hourly, from, to)
    }

    pub fn daily_range(&self, endpoint_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AggregatedResult> {
        self.range(endpoint_id, Period::Daily, from, to)
    }

    /// Drop every bucket of an endpoint. Returns how many were removed.
    pub fn invalidate_endpoint(&self, endpoint_id: &str) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|k, _| k.endpoint_id != endpoint_id);
        self.regions.remove(endpoint_id);
        before - self.buckets.len()
    }

    /// Combine the buckets of every endpoint in `region` for the window
    /// containing `time`. `None` when the region is unknown.
    pub fn region_rollup(
        &self,
        snapshot: &Snapshot,
        region: &str,
        period: Period,
        time: DateTime<Utc>,
    ) -> Option<RegionRollup> {
        let members = snapshot.region(region)?;
        let bucket_start = period.bucket_start(time);

        let mut stats = BucketStats::default();
        let mut endpoint_count = 0;
        for endpoint in &members.endpoints {
            let key = BucketKey {
                endpoint_id: endpoint.id.clone(),
                period,
                bucket_start,
            };
            if let Some(bucket) = self.buckets.get(&key) {
                stats.merge(&bucket.stats);
                endpoint_count += 1;
            }
        }

        Some(RegionRollup {
            region: region.to_string(),
            period,
            bucket_start,
            bucket_end: period.bucket_end(bucket_start),
            endpoint_count,
            stats: stats.summary(),
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn view(&self, key: &BucketKey, bucket: &Bucket, now: DateTime<Utc>) -> AggregatedResult {
        AggregatedResult {
            endpoint_id: key.endpoint_id.clone(),
            region: self.regions.get(&key.endpoint_id).map(|r| r.value().clone()),
            period: key.period,
            bucket_start: key.bucket_start,
            bucket_end: key.bucket_end(),
            closed: bucket.closed || key.bucket_end() + self.grace <= now,
            stats: bucket.stats.summary(),
        }
    }
}
