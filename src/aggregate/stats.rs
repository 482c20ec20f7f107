//! Online latency statistics.

use serde::{Deserialize, Serialize};

use crate::probe::{TestResult, TestStatus};

/// Single-pass mean/variance accumulator (Welford), mergeable with the
/// parallel combination of Chan et al.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl LatencyStats {
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn merge(&mut self, other: &LatencyStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let na = self.count as f64;
        let nb = other.count as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Population variance.
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

/// Counters and latency accumulator for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketStats {
    pub test_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub latency: LatencyStats,
}

impl BucketStats {
    /// Whether `status` counts towards bucket statistics at all.
    pub fn counts(status: TestStatus) -> bool {
        !matches!(status, TestStatus::Cancelled | TestStatus::InvalidConfig)
    }

    pub fn record(&mut self, result: &TestResult) {
        self.test_count += 1;
        if result.status.is_success() {
            self.success_count += 1;
            self.latency.push(result.latency_ms());
        } else {
            self.failure_count += 1;
        }
    }

    pub fn merge(&mut self, other: &BucketStats) {
        self.test_count += other.test_count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.latency.merge(&other.latency);
    }

    pub fn availability_pct(&self) -> Option<f64> {
        (self.test_count > 0).then(|| self.success_count as f64 / self.test_count as f64 * 100.0)
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            test_count: self.test_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            avg_latency_ms: self.latency.mean().unwrap_or(0.0),
            min_latency_ms: self.latency.min().unwrap_or(0.0),
            max_latency_ms: self.latency.max().unwrap_or(0.0),
            std_dev_latency_ms: self.latency.std_dev().unwrap_or(0.0),
            availability_pct: self.availability_pct(),
        }
    }
}

/// Read-side view of [`BucketStats`]. Latencies are milliseconds and read 0
/// when the bucket has no successful samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub test_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub std_dev_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_pct: Option<f64>,
}
