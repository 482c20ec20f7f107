//! Health classification from current bucket data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Aggregator, Period, StatsSummary};
use crate::config::{Snapshot, Thresholds};

/// Ordered from best to worst so the overall status is the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHealth {
    pub region: String,
    pub status: HealthStatus,
    pub test_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub regions: Vec<RegionHealth>,
}

/// Classify one set of statistics against a region's thresholds.
///
/// Availability below threshold is critical; average latency above threshold
/// is a warning. A zero threshold disables its check and an empty window is
/// healthy.
pub fn classify(stats: &StatsSummary, thresholds: &Thresholds) -> HealthStatus {
    let Some(availability) = stats.availability_pct else {
        return HealthStatus::Healthy;
    };

    if thresholds.availability_percent > 0.0 && availability < thresholds.availability_percent {
        return HealthStatus::Critical;
    }
    if thresholds.latency_ms > 0 && stats.success_count > 0 && stats.avg_latency_ms > thresholds.latency_ms as f64 {
        return HealthStatus::Warning;
    }
    HealthStatus::Healthy
}

impl Aggregator {
    /// Health per region from the current hourly window, worst region overall.
    pub fn health(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> HealthReport {
        let regions: Vec<RegionHealth> = snapshot
            .regions
            .iter()
            .filter_map(|(name, region)| {
                let rollup = self.region_rollup(snapshot, name, Period::Hourly, now)?;
                let stats = rollup.stats;
                Some(RegionHealth {
                    region: name.clone(),
                    status: classify(&stats, &region.thresholds),
                    test_count: stats.test_count,
                    availability_pct: stats.availability_pct,
                    avg_latency_ms: (stats.success_count > 0).then_some(stats.avg_latency_ms),
                })
            })
            .collect();

        let overall = regions.iter().map(|r| r.status).max().unwrap_or_default();
        HealthReport {
            overall,
            generated_at: now,
            regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, Region};
    use crate::probe::{Protocol, ProtocolConfig, TcpConfig, TestConfig, TestResult, TestStatus};
    use chrono::TimeZone;
    use std::time::Duration;

    fn summary(tests: u64, successes: u64, avg: f64) -> StatsSummary {
        StatsSummary {
            test_count: tests,
            success_count: successes,
            failure_count: tests - successes,
            avg_latency_ms: avg,
            min_latency_ms: avg,
            max_latency_ms: avg,
            std_dev_latency_ms: 0.0,
            availability_pct: (tests > 0).then(|| successes as f64 / tests as f64 * 100.0),
        }
    }

    #[test]
    fn test_classify() {
        let thresholds = Thresholds {
            latency_ms: 100,
            availability_percent: 99.0,
        };
        assert_eq!(classify(&summary(0, 0, 0.0), &thresholds), HealthStatus::Healthy);
        assert_eq!(classify(&summary(100, 100, 20.0), &thresholds), HealthStatus::Healthy);
        assert_eq!(classify(&summary(100, 100, 150.0), &thresholds), HealthStatus::Warning);
        assert_eq!(classify(&summary(100, 90, 150.0), &thresholds), HealthStatus::Critical);

        let disabled = Thresholds {
            latency_ms: 0,
            availability_percent: 0.0,
        };
        assert_eq!(classify(&summary(10, 0, 0.0), &disabled), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_report_takes_worst_region() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let mut snapshot = Snapshot::default();
        snapshot.regions.clear();
        for (region, id) in [("EU", "eu-web"), ("US", "us-web"), ("Idle", "idle-web")] {
            let mut endpoint = Endpoint::new("web", Protocol::Tcp, "web:80");
            endpoint.id = id.into();
            snapshot.regions.insert(
                region.into(),
                Region {
                    endpoints: vec![endpoint],
                    thresholds: Thresholds {
                        latency_ms: 50,
                        availability_percent: 90.0,
                    },
                },
            );
        }
        snapshot.normalize();

        let agg = Aggregator::new();
        let record = |id: &str, status: TestStatus, ms: u64| {
            let config = TestConfig::new(id, "web:80", Duration::from_secs(1), ProtocolConfig::Tcp(TcpConfig::default()));
            let result = TestResult::new(&config, now, status).with_latency(Duration::from_millis(ms));
            agg.ingest_at(&result, now).unwrap();
        };
        record("eu-web", TestStatus::Success, 80);
        record("us-web", TestStatus::Success, 10);
        record("us-web", TestStatus::Timeout, 0);

        let report = agg.health(&snapshot, now);
        assert_eq!(report.overall, HealthStatus::Critical);
        let by_region = |name: &str| report.regions.iter().find(|r| r.region == name).unwrap().status;
        assert_eq!(by_region("EU"), HealthStatus::Warning);
        assert_eq!(by_region("US"), HealthStatus::Critical);
        assert_eq!(by_region("Idle"), HealthStatus::Healthy);
    }
}
